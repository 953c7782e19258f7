//! Unified columnar table engine.
//!
//! One logical table named `stocks` holds financials, metadata and TTM rows
//! for every ticker, keyed by `(ticker, record_type, period_end_date)`.
//! [`TableEngine`] is the seam the transform worker and metadata projector
//! program against; [`VersionedStockTable`] is the object-store-backed
//! implementation (parquet snapshots + a numbered commit log).
//!
//! The table is **single-writer**: the transform lane runs with one
//! consumer, and commits additionally use create-if-absent log entries so a
//! second writer fails loudly instead of silently clobbering a version.

use async_trait::async_trait;
use polars::prelude::DataFrame;
use sip_schemas::PipelineError;

pub mod merge;
pub mod versioned;

pub use versioned::VersionedStockTable;

/// Column names forming the composite primary key of the unified table.
pub const KEY_COLUMNS: [&str; 3] = ["ticker", "record_type", "period_end_date"];

/// Merge/read contract over the unified `stocks` table.
#[async_trait]
pub trait TableEngine: Send + Sync {
    /// Create the table from `source` if it does not exist, otherwise merge:
    /// rows matching on the composite key (null-safe on `period_end_date`)
    /// are replaced wholesale, unmatched rows are inserted. Returns the
    /// table URI recorded as `processed_data_uri`.
    async fn merge(&self, source: DataFrame) -> Result<String, PipelineError>;

    /// All rows with `ticker = <ticker>` and `record_type = 'metadata'`,
    /// or `None` when the table does not exist yet.
    async fn read_metadata(&self, ticker: &str) -> Result<Option<DataFrame>, PipelineError>;
}
