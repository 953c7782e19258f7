//! Shared types for the stock ingestion pipeline.
//!
//! This crate is deliberately dependency-light: entities, the ingestion
//! state machine, the error taxonomy, and the entity-change event payload.
//! No I/O lives here; every other crate builds on these definitions.

pub mod entities;
pub mod error;
pub mod events;
pub mod state;

pub use entities::{BulkQueueRun, Exchange, IngestionRun, Stock, StockMetadataPatch};
pub use error::PipelineError;
pub use events::EntityChanged;
pub use state::IngestionState;

/// Normalize a ticker the way the store persists it: trimmed + uppercased.
///
/// Normalization is idempotent and happens before any uniqueness check, so
/// `" aapl "`, `"AAPL"` and `"AaPl"` all resolve to the same stock row.
pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_uppercases() {
        assert_eq!(normalize_ticker(" aapl "), "AAPL");
        assert_eq!(normalize_ticker("AaPl"), "AAPL");
        assert_eq!(normalize_ticker("AAPL"), "AAPL");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_ticker(" msft ");
        assert_eq!(normalize_ticker(&once), once);
    }
}
