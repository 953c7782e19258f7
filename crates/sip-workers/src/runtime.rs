//! Lane runtime: in-process task queue consumers.
//!
//! Five lanes, one unbounded channel each:
//! - **fetch**: spawns a task per message, so fetches run in parallel;
//! - **transform**: processed inline, strictly one at a time, because the
//!   versioned-table writer is single-writer;
//! - **metadata**, **notify**: spawned per message;
//! - **bulk**: processed inline (one fan-out at a time).
//!
//! Retryable errors are retried here with jittered exponential backoff, up
//! to [`retry::MAX_ATTEMPTS`]; exhausting the attempts terminalizes the run
//! with `MAX_RETRIES_EXCEEDED`. Non-retryable errors were already
//! terminalized by the worker that raised them.

use std::sync::Arc;

use async_trait::async_trait;
use sip_schemas::PipelineError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bulk::BulkOrchestrator;
use crate::fetch::FetchWorker;
use crate::metadata::MetadataProjector;
use crate::notify::{send_run_notification, Notifier};
use crate::queue::{Queue, Task};
use crate::retry::{backoff_delay, MAX_ATTEMPTS};
use crate::transform::TransformWorker;
use crate::transition_to_failed;

/// In-process [`Queue`] routing tasks onto their lane channels.
pub struct TokioQueue {
    fetch_tx: mpsc::UnboundedSender<Task>,
    transform_tx: mpsc::UnboundedSender<Task>,
    metadata_tx: mpsc::UnboundedSender<Task>,
    notify_tx: mpsc::UnboundedSender<Task>,
    bulk_tx: mpsc::UnboundedSender<Task>,
}

/// Receiver half of the five lanes, consumed by [`spawn_runtime`].
pub struct LaneReceivers {
    fetch: mpsc::UnboundedReceiver<Task>,
    transform: mpsc::UnboundedReceiver<Task>,
    metadata: mpsc::UnboundedReceiver<Task>,
    notify: mpsc::UnboundedReceiver<Task>,
    bulk: mpsc::UnboundedReceiver<Task>,
}

impl TokioQueue {
    pub fn channel() -> (Arc<TokioQueue>, LaneReceivers) {
        let (fetch_tx, fetch) = mpsc::unbounded_channel();
        let (transform_tx, transform) = mpsc::unbounded_channel();
        let (metadata_tx, metadata) = mpsc::unbounded_channel();
        let (notify_tx, notify) = mpsc::unbounded_channel();
        let (bulk_tx, bulk) = mpsc::unbounded_channel();
        (
            Arc::new(TokioQueue {
                fetch_tx,
                transform_tx,
                metadata_tx,
                notify_tx,
                bulk_tx,
            }),
            LaneReceivers {
                fetch,
                transform,
                metadata,
                notify,
                bulk,
            },
        )
    }
}

#[async_trait]
impl Queue for TokioQueue {
    async fn enqueue(&self, task: Task) -> Result<(), PipelineError> {
        let tx = match &task {
            Task::Fetch { .. } => &self.fetch_tx,
            Task::Transform { .. } => &self.transform_tx,
            Task::ProjectMetadata { .. } => &self.metadata_tx,
            Task::Notify { .. } => &self.notify_tx,
            Task::BulkFanOut { .. } => &self.bulk_tx,
        };
        tx.send(task.clone())
            .map_err(|_| PipelineError::Broker(format!("{} lane is closed", task.kind())))
    }
}

/// Everything the lanes need to execute tasks.
pub struct Workers {
    pub store: Arc<dyn sip_db::RunStore>,
    pub queue: Arc<dyn Queue>,
    pub fetch: FetchWorker,
    pub transform: TransformWorker,
    pub metadata: MetadataProjector,
    pub bulk: BulkOrchestrator,
    pub notifier: Arc<dyn Notifier>,
}

/// Spawn all five lane consumers. Returns immediately; consumers live for
/// the process lifetime.
pub fn spawn_runtime(workers: Arc<Workers>, mut lanes: LaneReceivers) {
    // Fetch: parallel per ticker.
    {
        let workers = Arc::clone(&workers);
        tokio::spawn(async move {
            while let Some(task) = lanes.fetch.recv().await {
                let workers = Arc::clone(&workers);
                tokio::spawn(async move {
                    execute_with_retry(&workers, task).await;
                });
            }
        });
    }

    // Transform: single consumer, strictly sequential.
    {
        let workers = Arc::clone(&workers);
        tokio::spawn(async move {
            while let Some(task) = lanes.transform.recv().await {
                execute_with_retry(&workers, task).await;
            }
        });
    }

    // Metadata projection: parallel, retried on lock timeouts.
    {
        let workers = Arc::clone(&workers);
        tokio::spawn(async move {
            while let Some(task) = lanes.metadata.recv().await {
                let workers = Arc::clone(&workers);
                tokio::spawn(async move {
                    execute_with_retry(&workers, task).await;
                });
            }
        });
    }

    // Notify: fire-and-forget, errors logged and swallowed.
    {
        let workers = Arc::clone(&workers);
        tokio::spawn(async move {
            while let Some(task) = lanes.notify.recv().await {
                let workers = Arc::clone(&workers);
                tokio::spawn(async move {
                    if let Task::Notify {
                        run_id,
                        ticker,
                        state,
                    } = task
                    {
                        if let Err(e) = send_run_notification(
                            &workers.store,
                            &workers.notifier,
                            run_id,
                            &ticker,
                            state,
                        )
                        .await
                        {
                            warn!(run_id = %run_id, error = %e, "notification failed (swallowed)");
                        }
                    }
                });
            }
        });
    }

    // Bulk: one fan-out at a time.
    {
        let workers = Arc::clone(&workers);
        tokio::spawn(async move {
            while let Some(task) = lanes.bulk.recv().await {
                if let Task::BulkFanOut {
                    bulk_run_id,
                    exchange,
                } = task
                {
                    if let Err(e) = workers.bulk.run(bulk_run_id, exchange.as_deref()).await {
                        error!(bulk_run_id = %bulk_run_id, error = %e, "bulk fan-out failed");
                    }
                }
            }
        });
    }

    info!("worker lanes started");
}

async fn run_task(workers: &Workers, task: &Task) -> Result<(), PipelineError> {
    match task {
        Task::Fetch { run_id, ticker } => {
            workers.fetch.run(&run_id.to_string(), ticker).await?;
        }
        Task::Transform { run_id, ticker } => {
            workers.transform.run(&run_id.to_string(), ticker).await?;
        }
        Task::ProjectMetadata { ticker } => {
            workers.metadata.run(ticker).await?;
        }
        // Routed to dedicated lanes; never reaches the retry path.
        Task::Notify { .. } | Task::BulkFanOut { .. } => {}
    }
    Ok(())
}

/// Run one task with the shared retry policy.
pub async fn execute_with_retry(workers: &Workers, task: Task) {
    for attempt in 1..=MAX_ATTEMPTS {
        match run_task(workers, &task).await {
            Ok(()) => return,
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(
                    kind = task.kind(),
                    attempt,
                    max = MAX_ATTEMPTS,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "retryable task error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                error!(
                    kind = task.kind(),
                    attempt,
                    error = %e,
                    "max retries exceeded"
                );
                if let (Some(run_id), Some(ticker)) = (task.run_id(), task.ticker()) {
                    transition_to_failed(
                        &workers.store,
                        &workers.queue,
                        run_id,
                        ticker,
                        "MAX_RETRIES_EXCEEDED",
                        &format!("failed after {MAX_ATTEMPTS} attempts: {e}"),
                    )
                    .await;
                }
                return;
            }
            Err(e) => {
                // Non-retryable: the worker already terminalized the run.
                error!(kind = task.kind(), error = %e, "task failed");
                return;
            }
        }
    }
}
