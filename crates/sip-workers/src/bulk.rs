//! Bulk orchestrator: fan one request out across every known ticker.
//!
//! Counter discipline: every adjustment is in-database arithmetic through
//! the store, never read-modify-write, so the totals stay correct when the
//! task is retried or raced by another process. Per-ticker failures are
//! absorbed into `error_count`; one bad ticker never aborts the sweep.

use std::sync::Arc;

use sip_db::{BulkCounter, RunStore};
use sip_ingest::StockIngestionService;
use sip_schemas::PipelineError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::queue::{Queue, Task};

/// Result object returned by a completed fan-out.
#[derive(Debug, Clone)]
pub struct BulkSummary {
    pub bulk_queue_run_id: Uuid,
    pub total_stocks: i64,
    pub queued_count: i64,
    pub skipped_count: i64,
    pub error_count: i64,
    pub success: bool,
}

pub struct BulkOrchestrator {
    store: Arc<dyn RunStore>,
    service: StockIngestionService,
    queue: Arc<dyn Queue>,
}

impl BulkOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        service: StockIngestionService,
        queue: Arc<dyn Queue>,
    ) -> Self {
        BulkOrchestrator {
            store,
            service,
            queue,
        }
    }

    pub async fn run(
        &self,
        bulk_run_id: Uuid,
        exchange: Option<&str>,
    ) -> Result<BulkSummary, PipelineError> {
        info!(bulk_run_id = %bulk_run_id, "starting bulk fan-out");

        let bulk = self.store.get_bulk_run(bulk_run_id).await?;
        self.store.bulk_mark_started(bulk_run_id).await?;

        let tickers = self.store.list_tickers(exchange).await?;
        let total = tickers.len() as i64;
        self.store.bulk_set_total(bulk_run_id, total).await?;
        info!(bulk_run_id = %bulk_run_id, total, "retrieved stocks for processing");

        let request_id = format!("bulk-queue-{bulk_run_id}");

        for (index, ticker) in tickers.iter().enumerate() {
            if let Err(e) = self
                .process_ticker(&bulk, ticker, &request_id)
                .await
            {
                self.store
                    .bulk_adjust_counter(bulk_run_id, BulkCounter::Error, 1)
                    .await?;
                error!(
                    bulk_run_id = %bulk_run_id,
                    ticker,
                    error = %e,
                    "error processing stock in bulk queue"
                );
            }

            if (index + 1) % 100 == 0 {
                // Counters are read back from the database for progress,
                // never from in-process tallies.
                let current = self.store.get_bulk_run(bulk_run_id).await?;
                info!(
                    bulk_run_id = %bulk_run_id,
                    processed = index + 1,
                    total,
                    queued = current.queued_count,
                    skipped = current.skipped_count,
                    errors = current.error_count,
                    "bulk queue progress"
                );
            }
        }

        self.store.bulk_mark_completed(bulk_run_id).await?;
        let final_state = self.store.get_bulk_run(bulk_run_id).await?;
        info!(
            bulk_run_id = %bulk_run_id,
            total,
            queued = final_state.queued_count,
            skipped = final_state.skipped_count,
            errors = final_state.error_count,
            "completed bulk fan-out"
        );

        Ok(BulkSummary {
            bulk_queue_run_id: bulk_run_id,
            total_stocks: final_state.total_stocks,
            queued_count: final_state.queued_count,
            skipped_count: final_state.skipped_count,
            error_count: final_state.error_count,
            success: true,
        })
    }

    async fn process_ticker(
        &self,
        bulk: &sip_schemas::BulkQueueRun,
        ticker: &str,
        request_id: &str,
    ) -> Result<(), PipelineError> {
        let (run, created) = self
            .service
            .queue_for_fetch(ticker, bulk.requested_by.as_deref(), Some(request_id))
            .await?;

        if run.bulk_queue_run_id != Some(bulk.id) {
            self.store.link_run_to_bulk(run.id, bulk.id).await?;
        }

        if created {
            self.store
                .bulk_adjust_counter(bulk.id, BulkCounter::Queued, 1)
                .await?;
            if let Err(e) = self
                .queue
                .enqueue(Task::Fetch {
                    run_id: run.id,
                    ticker: ticker.to_string(),
                })
                .await
            {
                warn!(ticker, run_id = %run.id, error = %e, "failed to enqueue fetch task");
                self.store
                    .bulk_adjust_counter(bulk.id, BulkCounter::Queued, -1)
                    .await?;
                self.store
                    .bulk_adjust_counter(bulk.id, BulkCounter::Error, 1)
                    .await?;
            }
        } else {
            self.store
                .bulk_adjust_counter(bulk.id, BulkCounter::Skipped, 1)
                .await?;
        }
        Ok(())
    }
}
