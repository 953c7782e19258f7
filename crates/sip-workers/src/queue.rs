//! The enqueue seam between the pipeline and its task lanes.

use async_trait::async_trait;
use sip_schemas::{IngestionState, PipelineError};
use uuid::Uuid;

/// A unit of queued work. Fetch and transform carry both the run id and the
/// ticker so workers can log and key storage without an extra lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Fetch {
        run_id: Uuid,
        ticker: String,
    },
    Transform {
        run_id: Uuid,
        ticker: String,
    },
    ProjectMetadata {
        ticker: String,
    },
    Notify {
        run_id: Uuid,
        ticker: String,
        state: IngestionState,
    },
    BulkFanOut {
        bulk_run_id: Uuid,
        exchange: Option<String>,
    },
}

impl Task {
    /// The run this task operates on, when it has one. Used by the lane
    /// runtime to terminalize runs whose retries are exhausted.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Task::Fetch { run_id, .. } | Task::Transform { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }

    pub fn ticker(&self) -> Option<&str> {
        match self {
            Task::Fetch { ticker, .. }
            | Task::Transform { ticker, .. }
            | Task::ProjectMetadata { ticker }
            | Task::Notify { ticker, .. } => Some(ticker),
            Task::BulkFanOut { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Fetch { .. } => "fetch",
            Task::Transform { .. } => "transform",
            Task::ProjectMetadata { .. } => "project_metadata",
            Task::Notify { .. } => "notify",
            Task::BulkFanOut { .. } => "bulk_fan_out",
        }
    }
}

/// Enqueue contract. A failed enqueue is a broker error
/// ([`PipelineError::Broker`]); callers decide whether that terminalizes
/// the run (API queue endpoint) or adjusts counters (bulk orchestrator).
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<(), PipelineError>;
}
