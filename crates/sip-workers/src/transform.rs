//! Transform worker: reshape raw JSON and merge into the unified table.
//!
//! Must run with concurrency 1 per table; the versioned-table writer does
//! not tolerate concurrent commits (see `sip-table`). The lane runtime pins
//! this worker to a single consumer.

use std::sync::Arc;

use sip_db::{RunStore, StateUpdate};
use sip_schemas::{normalize_ticker, IngestionState, PipelineError};
use sip_store::RawStore;
use sip_table::TableEngine;
use tracing::{error, info, warn};

use crate::queue::{Queue, Task};
use crate::reshape::reshape;
use crate::{parse_run_id, transition_to_failed};

/// Result object returned by a transform task execution.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub run_id: String,
    pub ticker: String,
    pub state: IngestionState,
    pub skipped: bool,
    pub processed_uri: Option<String>,
    pub records_processed: usize,
}

pub struct TransformWorker {
    store: Arc<dyn RunStore>,
    raw: Arc<dyn RawStore>,
    table: Arc<dyn TableEngine>,
    queue: Arc<dyn Queue>,
}

impl TransformWorker {
    pub fn new(
        store: Arc<dyn RunStore>,
        raw: Arc<dyn RawStore>,
        table: Arc<dyn TableEngine>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        TransformWorker {
            store,
            raw,
            table,
            queue,
        }
    }

    pub async fn run(&self, run_id: &str, ticker: &str) -> Result<TransformResult, PipelineError> {
        let run_uuid = parse_run_id(run_id)?;
        let ticker = normalize_ticker(ticker);
        info!(run_id, ticker, "starting transform task");

        // Step 1: validate state, transition to TRANSFORM_RUNNING.
        let run = self.store.get_run(run_uuid).await?;

        if matches!(
            run.state,
            IngestionState::TransformFinished | IngestionState::Done
        ) {
            info!(run_id, state = %run.state, "run already past transform, skipping");
            return Ok(TransformResult {
                run_id: run_id.to_string(),
                ticker,
                state: run.state,
                skipped: true,
                processed_uri: run.processed_data_uri,
                records_processed: 0,
            });
        }

        if run.state == IngestionState::Failed {
            return Err(PipelineError::InvalidState(format!(
                "run {run_id} is in FAILED state and cannot be retried"
            )));
        }

        if !matches!(
            run.state,
            IngestionState::QueuedForTransform | IngestionState::TransformRunning
        ) {
            return Err(PipelineError::InvalidState(format!(
                "run {run_id} must be in QUEUED_FOR_TRANSFORM or TRANSFORM_RUNNING state, \
                 but is in {}",
                run.state
            )));
        }

        let Some(raw_uri) = run.raw_data_uri.clone() else {
            transition_to_failed(
                &self.store,
                &self.queue,
                run_uuid,
                &ticker,
                "MISSING_RAW_DATA",
                "no raw_data_uri found for run",
            )
            .await;
            return Err(PipelineError::InvalidState(format!(
                "run {run_id} has no raw_data_uri"
            )));
        };

        if run.state == IngestionState::QueuedForTransform {
            self.store
                .update_run_state(
                    run_uuid,
                    IngestionState::TransformRunning,
                    StateUpdate::default(),
                )
                .await?;
        }

        // Step 2: download the raw payload.
        let payload = match self.raw.get_raw(&raw_uri).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_retryable() => {
                warn!(run_id, ticker, error = %e, "retryable storage error downloading raw data");
                return Err(e);
            }
            Err(e) => {
                transition_to_failed(
                    &self.store,
                    &self.queue,
                    run_uuid,
                    &ticker,
                    "STORAGE_ERROR",
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };

        // Step 3: parse + reshape into the unified row set.
        let frame = match serde_json::from_slice::<serde_json::Value>(&payload)
            .map_err(|e| PipelineError::InvalidDataFormat(format!("invalid JSON payload: {e}")))
            .and_then(|data| reshape(&data, &ticker))
        {
            Ok(frame) => frame,
            Err(e) => {
                transition_to_failed(
                    &self.store,
                    &self.queue,
                    run_uuid,
                    &ticker,
                    "DATA_TRANSFORMATION_ERROR",
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };
        let records = frame.height();
        info!(run_id, ticker, rows = records, "reshaped payload into unified rows");

        // Step 4: merge into the unified stocks table.
        let processed_uri = match self.table.merge(frame).await {
            Ok(uri) => uri,
            Err(e) => {
                transition_to_failed(
                    &self.store,
                    &self.queue,
                    run_uuid,
                    &ticker,
                    "TABLE_ERROR",
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };

        // Step 5: TRANSFORM_FINISHED with the processed URI.
        self.store
            .update_run_state(
                run_uuid,
                IngestionState::TransformFinished,
                StateUpdate {
                    processed_data_uri: Some(processed_uri.clone()),
                    ..StateUpdate::default()
                },
            )
            .await?;

        // Step 6: DONE, then the follow-up tasks. The merge has succeeded at
        // this point; failures below are logged but never revert DONE.
        let mut final_state = IngestionState::TransformFinished;
        match self
            .store
            .update_run_state(run_uuid, IngestionState::Done, StateUpdate::default())
            .await
        {
            Ok(_) => {
                final_state = IngestionState::Done;
                if let Err(e) = self
                    .queue
                    .enqueue(Task::ProjectMetadata {
                        ticker: ticker.clone(),
                    })
                    .await
                {
                    error!(run_id, ticker, error = %e, "failed to enqueue metadata projection");
                }
                if let Err(e) = self
                    .queue
                    .enqueue(Task::Notify {
                        run_id: run_uuid,
                        ticker: ticker.clone(),
                        state: IngestionState::Done,
                    })
                    .await
                {
                    error!(run_id, ticker, error = %e, "failed to enqueue notification");
                }
            }
            Err(e) => {
                error!(run_id, ticker, error = %e, "failed to transition to DONE");
            }
        }

        info!(run_id, ticker, %processed_uri, state = %final_state, "completed transform task");
        Ok(TransformResult {
            run_id: run_id.to_string(),
            ticker,
            state: final_state,
            skipped: false,
            processed_uri: Some(processed_uri),
            records_processed: records,
        })
    }
}
