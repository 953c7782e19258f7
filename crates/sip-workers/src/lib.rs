//! Task-queue workers for the ingestion pipeline.
//!
//! One module per worker, mirroring the pipeline order: fetch → transform →
//! metadata projection, with the bulk orchestrator fanning out over tickers
//! and the notifier reporting terminal transitions. The [`queue::Queue`]
//! seam decouples enqueue sites from the lane runtime, so tests capture
//! tasks instead of running them.

pub mod bulk;
pub mod fetch;
pub mod metadata;
pub mod notify;
pub mod queue;
pub mod reshape;
pub mod retry;
pub mod runtime;
pub mod transform;

pub use queue::{Queue, Task};
pub use runtime::{spawn_runtime, TokioQueue, Workers};

use std::sync::Arc;

use sip_db::{RunStore, StateUpdate};
use sip_schemas::{IngestionState, PipelineError};
use tracing::warn;
use uuid::Uuid;

/// Transition a run to FAILED and enqueue the red notification.
///
/// Best-effort by design: the run may already be terminal (another process
/// beat us to it) and the notification may fail to enqueue; neither must
/// mask the original worker error, so both are logged and swallowed.
pub(crate) async fn transition_to_failed(
    store: &Arc<dyn RunStore>,
    queue: &Arc<dyn Queue>,
    run_id: Uuid,
    ticker: &str,
    error_code: &str,
    error_message: &str,
) {
    let update = StateUpdate {
        error_code: Some(error_code.to_string()),
        error_message: Some(error_message.to_string()),
        ..StateUpdate::default()
    };
    match store
        .update_run_state(run_id, IngestionState::Failed, update)
        .await
    {
        Ok(_) => {
            if let Err(e) = queue
                .enqueue(Task::Notify {
                    run_id,
                    ticker: ticker.to_string(),
                    state: IngestionState::Failed,
                })
                .await
            {
                warn!(run_id = %run_id, error = %e, "failed to enqueue failure notification");
            }
        }
        Err(PipelineError::InvalidStateTransition(_)) => {
            warn!(run_id = %run_id, "could not transition run to FAILED (already terminal?)");
        }
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "failed to transition run to FAILED");
        }
    }
}

/// Parse a task-supplied run id; malformed ids are a non-retryable fatal.
pub(crate) fn parse_run_id(run_id: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(run_id)
        .map_err(|_| PipelineError::InvalidState(format!("invalid run_id format: {run_id}")))
}
