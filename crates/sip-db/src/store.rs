//! The `RunStore` persistence seam.
//!
//! Workers and the HTTP layer hold an `Arc<dyn RunStore>`; the PostgreSQL
//! implementation lives in [`crate::pg`], the in-memory test double in
//! `sip-testkit`. Both enforce transition legality through
//! `sip_schemas::state`, so swapping them never changes the state machine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sip_schemas::{
    BulkQueueRun, IngestionRun, IngestionState, PipelineError, Stock, StockMetadataPatch,
};
use uuid::Uuid;

/// Optional fields applied alongside a state transition.
///
/// URIs overwrite only when provided (non-null); error fields are required
/// when the target state is FAILED and ignored otherwise.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw_data_uri: Option<String>,
    pub processed_data_uri: Option<String>,
}

/// Keyset cursor: rows strictly before `(created_at, id)` in the
/// `-created_at, -id` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// One page of a `-created_at` ordered listing.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub before: Option<PageCursor>,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            limit: 50,
            before: None,
        }
    }
}

/// Filters for the stock list view. `*_contains` variants are
/// case-insensitive substring matches; the rest are case-insensitive exact.
#[derive(Debug, Clone, Default)]
pub struct StockFilter {
    pub ticker: Option<String>,
    pub ticker_contains: Option<String>,
    pub sector: Option<String>,
    pub sector_contains: Option<String>,
    pub exchange: Option<String>,
    pub country: Option<String>,
}

/// Filters for run list views.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub ticker: Option<String>,
    pub ticker_contains: Option<String>,
    pub state: Option<IngestionState>,
    pub requested_by: Option<String>,
    pub requested_by_contains: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub is_terminal: Option<bool>,
    pub is_in_progress: Option<bool>,
}

/// The four bulk-run counters mutated with in-database arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCounter {
    Queued,
    Skipped,
    Error,
}

impl BulkCounter {
    pub fn column(&self) -> &'static str {
        match self {
            BulkCounter::Queued => "queued_count",
            BulkCounter::Skipped => "skipped_count",
            BulkCounter::Error => "error_count",
        }
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    // -- stocks ------------------------------------------------------------

    /// Upsert a stock by normalized ticker. Returns the row in both the
    /// created and the already-existing case.
    async fn get_or_create_stock(&self, ticker: &str) -> Result<Stock, PipelineError>;

    async fn get_stock_by_ticker(&self, ticker: &str) -> Result<Option<Stock>, PipelineError>;

    /// Row-locked metadata writeback; the `exchange` field is
    /// normalized-upserted into the exchanges table and linked by foreign
    /// key. Returns the names of the fields that were written.
    async fn apply_stock_metadata(
        &self,
        stock_id: Uuid,
        patch: &StockMetadataPatch,
    ) -> Result<Vec<String>, PipelineError>;

    // -- runs --------------------------------------------------------------

    async fn get_run(&self, run_id: Uuid) -> Result<IngestionRun, PipelineError>;

    /// Latest run for a stock by `created_at` desc, stock loaded eagerly.
    async fn latest_run_for_stock(
        &self,
        stock_id: Uuid,
    ) -> Result<Option<IngestionRun>, PipelineError>;

    /// All runs not in DONE/FAILED.
    async fn active_runs(&self) -> Result<Vec<IngestionRun>, PipelineError>;

    async fn latest_done_run(
        &self,
        stock_id: Uuid,
    ) -> Result<Option<IngestionRun>, PipelineError>;

    /// The transactional queue-for-fetch core: upsert the stock, return the
    /// latest run untouched if it is still active, otherwise create a fresh
    /// run in QUEUED_FOR_FETCH. A concurrent winner surfaces as
    /// [`PipelineError::DuplicateActiveRun`].
    async fn queue_for_fetch(
        &self,
        ticker: &str,
        requested_by: Option<&str>,
        request_id: &str,
    ) -> Result<(IngestionRun, bool), PipelineError>;

    /// Atomic, row-locked state transition per the transition authority.
    /// Stamps the phase timestamp for `new_state` (first entry wins).
    async fn update_run_state(
        &self,
        run_id: Uuid,
        new_state: IngestionState,
        update: StateUpdate,
    ) -> Result<IngestionRun, PipelineError>;

    // -- bulk runs ---------------------------------------------------------

    async fn create_bulk_run(
        &self,
        requested_by: Option<&str>,
    ) -> Result<BulkQueueRun, PipelineError>;

    async fn get_bulk_run(&self, id: Uuid) -> Result<BulkQueueRun, PipelineError>;

    async fn bulk_mark_started(&self, id: Uuid) -> Result<(), PipelineError>;

    async fn bulk_set_total(&self, id: Uuid, total: i64) -> Result<(), PipelineError>;

    /// In-database `SET c = c + delta`; never read-modify-write.
    async fn bulk_adjust_counter(
        &self,
        id: Uuid,
        counter: BulkCounter,
        delta: i64,
    ) -> Result<(), PipelineError>;

    async fn bulk_mark_completed(&self, id: Uuid) -> Result<(), PipelineError>;

    /// Attach a run to a bulk run if not already linked.
    async fn link_run_to_bulk(&self, run_id: Uuid, bulk_id: Uuid) -> Result<(), PipelineError>;

    /// Count of linked runs per state, for the stats endpoint.
    async fn bulk_state_counts(
        &self,
        bulk_id: Uuid,
    ) -> Result<Vec<(IngestionState, i64)>, PipelineError>;

    // -- listings ----------------------------------------------------------

    /// All tickers in stable alphabetical order, optionally restricted to
    /// one exchange (by normalized name).
    async fn list_tickers(&self, exchange: Option<&str>) -> Result<Vec<String>, PipelineError>;

    async fn list_stocks(
        &self,
        filter: &StockFilter,
        page: &Page,
    ) -> Result<Vec<Stock>, PipelineError>;

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: &Page,
    ) -> Result<Vec<IngestionRun>, PipelineError>;

    async fn list_bulk_runs(&self, page: &Page) -> Result<Vec<BulkQueueRun>, PipelineError>;
}
