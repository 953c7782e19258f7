//! Stock ingestion service.
//!
//! Business logic between the HTTP/bulk layers and the run store: status
//! lookups, the idempotent queue-for-fetch entry point, and state-update
//! delegation. All mutations happen inside the store's transactions; the
//! service itself only normalizes input, generates request ids and logs.
//!
//! Callers enqueue the downstream fetch task strictly **after** a service
//! call returns; by then the transaction has committed, so a worker can
//! never race a not-yet-visible row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sip_db::{RunStore, StateUpdate};
use sip_schemas::{normalize_ticker, IngestionRun, IngestionState, PipelineError};
use tracing::info;
use uuid::Uuid;

/// Latest-run summary for one stock.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub ticker: String,
    pub stock_id: Uuid,
    pub run_id: Option<Uuid>,
    pub state: Option<IngestionState>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct StockIngestionService {
    store: Arc<dyn RunStore>,
}

impl StockIngestionService {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        StockIngestionService { store }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Current status of a stock's latest ingestion run.
    ///
    /// Fails with [`PipelineError::StockNotFound`] for unknown tickers; a
    /// known stock with no runs yet returns a summary with null run fields.
    pub async fn get_status(&self, ticker: &str) -> Result<StatusResult, PipelineError> {
        let ticker = normalize_ticker(ticker);
        let stock = self
            .store
            .get_stock_by_ticker(&ticker)
            .await?
            .ok_or_else(|| PipelineError::StockNotFound(ticker.clone()))?;

        match self.store.latest_run_for_stock(stock.id).await? {
            Some(run) => {
                info!(ticker, run_id = %run.id, state = %run.state, "retrieved status");
                Ok(StatusResult {
                    ticker: stock.ticker,
                    stock_id: stock.id,
                    run_id: Some(run.id),
                    state: Some(run.state),
                    created_at: Some(run.created_at),
                    updated_at: Some(run.updated_at),
                })
            }
            None => {
                info!(ticker, "no ingestion runs found");
                Ok(StatusResult {
                    ticker: stock.ticker,
                    stock_id: stock.id,
                    run_id: None,
                    state: None,
                    created_at: None,
                    updated_at: None,
                })
            }
        }
    }

    /// Queue a stock for fetching, creating the stock row if needed.
    ///
    /// Returns `(run, false)` when an active run already exists (the
    /// idempotent fast-path) and `(run, true)` when a fresh run was created
    /// in QUEUED_FOR_FETCH. A concurrent winner propagates as
    /// [`PipelineError::DuplicateActiveRun`], which the API maps to 409.
    pub async fn queue_for_fetch(
        &self,
        ticker: &str,
        requested_by: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<(IngestionRun, bool), PipelineError> {
        let ticker = normalize_ticker(ticker);
        let generated;
        let request_id = match request_id {
            Some(id) => id,
            None => {
                generated = default_request_id(Utc::now());
                generated.as_str()
            }
        };
        self.store
            .queue_for_fetch(&ticker, requested_by, request_id)
            .await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<IngestionRun, PipelineError> {
        self.store.get_run(run_id).await
    }

    /// Atomic, validated state transition (see the transition authority in
    /// `sip-schemas::state`).
    pub async fn update_run_state(
        &self,
        run_id: Uuid,
        new_state: IngestionState,
        update: StateUpdate,
    ) -> Result<IngestionRun, PipelineError> {
        self.store.update_run_state(run_id, new_state, update).await
    }
}

/// High-resolution wall-clock request id: `YYYYMMDDHHMMSSmmmuuu`.
pub fn default_request_id(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S%f").to_string()
}
