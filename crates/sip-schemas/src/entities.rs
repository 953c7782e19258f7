//! Persisted entities shared across the pipeline crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::IngestionState;

/// A stock ticker symbol plus the descriptive metadata projected back from
/// the unified table. Descriptive fields stay `None` until the metadata
/// projector fills them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stock {
    pub id: Uuid,
    /// Stored normalized (trimmed, uppercased); lookups normalize first.
    pub ticker: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub subindustry: Option<String>,
    pub industry: Option<String>,
    pub morningstar_sector: Option<String>,
    pub morningstar_industry: Option<String>,
    pub country: Option<String>,
    pub description: Option<String>,
    pub exchange_id: Option<Uuid>,
    pub exchange: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stock exchange, keyed by normalized (uppercased) name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single attempt to take one ticker from queued to done.
///
/// Carries one phase timestamp per state (stamped on first entry), the
/// payload pointers filled by the workers, and the error fields required
/// when `state == FAILED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Uuid,
    pub stock_id: Uuid,
    /// Denormalized from the stock row; every read joins it eagerly.
    pub ticker: String,
    pub bulk_queue_run_id: Option<Uuid>,
    pub requested_by: Option<String>,
    pub request_id: Option<String>,
    pub state: IngestionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queued_for_fetch_at: Option<DateTime<Utc>>,
    pub fetching_started_at: Option<DateTime<Utc>>,
    pub fetching_finished_at: Option<DateTime<Utc>>,
    pub queued_for_transform_at: Option<DateTime<Utc>>,
    pub transform_started_at: Option<DateTime<Utc>>,
    pub transform_finished_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw_data_uri: Option<String>,
    pub processed_data_uri: Option<String>,
}

impl IngestionRun {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal()
    }
}

/// Aggregation handle for one bulk fan-out request.
///
/// Counter invariant: `queued_count + skipped_count + error_count <=
/// total_stocks` while processing, with equality once `completed_at` is
/// stamped. Counters are only ever mutated with in-database arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkQueueRun {
    pub id: Uuid,
    pub requested_by: Option<String>,
    pub total_stocks: i64,
    pub queued_count: i64,
    pub skipped_count: i64,
    pub error_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Metadata fields the projector writes back onto a stock row.
///
/// Only `Some` fields are applied; `exchange` is special-cased into a
/// normalized upsert on the exchanges table plus the foreign key.
#[derive(Debug, Clone, Default)]
pub struct StockMetadataPatch {
    pub name: Option<String>,
    pub sector: Option<String>,
    pub subindustry: Option<String>,
    pub industry: Option<String>,
    pub morningstar_sector: Option<String>,
    pub morningstar_industry: Option<String>,
    pub country: Option<String>,
    pub description: Option<String>,
    pub exchange: Option<String>,
}

impl StockMetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.sector.is_none()
            && self.subindustry.is_none()
            && self.industry.is_none()
            && self.morningstar_sector.is_none()
            && self.morningstar_industry.is_none()
            && self.country.is_none()
            && self.description.is_none()
            && self.exchange.is_none()
    }
}
