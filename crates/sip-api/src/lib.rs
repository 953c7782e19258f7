//! HTTP surface for the stock ingestion pipeline.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. All handlers are `pub(crate)` so the
//! scenario tests in `tests/` can compose the router directly.

pub mod error;
pub mod filters;
pub mod pagination;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
