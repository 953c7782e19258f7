// crates/sip-db/src/lib.rs
//! Relational run store: the only crate that mutates PostgreSQL state.
//!
//! [`store::RunStore`] is the persistence seam the rest of the pipeline
//! programs against; [`pg::PgRunStore`] is the production implementation.
//! Tests swap in `sip-testkit`'s in-memory store.

use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod pg;
pub mod store;

pub use pg::PgRunStore;
pub use store::{
    BulkCounter, Page, PageCursor, RunFilter, RunStore, StateUpdate, StockFilter,
};

use sip_schemas::PipelineError;

/// Connect to Postgres with a bounded pool.
pub async fn connect(database_url: &str) -> Result<PgPool, PipelineError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| PipelineError::Database(format!("failed to connect to Postgres: {e}")))
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), PipelineError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PipelineError::Database(format!("db migrate failed: {e}")))
}

/// Test helper used by integration tests: connect using `SIP_DATABASE_URL`
/// and ensure migrations are applied.
pub async fn testkit_db_pool() -> Result<PgPool, PipelineError> {
    let url = std::env::var("SIP_DATABASE_URL")
        .map_err(|_| PipelineError::Database("missing env var SIP_DATABASE_URL".to_string()))?;
    let pool = connect(&url).await?;
    migrate(&pool).await?;
    Ok(pool)
}
