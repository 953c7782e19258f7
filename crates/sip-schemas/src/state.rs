//! Ingestion state machine.
//!
//! # Design
//!
//! A run moves through a linear pipeline with one escape hatch to FAILED
//! from any active state:
//!
//! ```text
//! QUEUED_FOR_FETCH ──► FETCHING ──► FETCHED ──► QUEUED_FOR_TRANSFORM
//!        │                │            │                 │
//!        ▼                ▼            ▼                 ▼
//!      FAILED           FAILED       FAILED        TRANSFORM_RUNNING ──► TRANSFORM_FINISHED ──► DONE
//!                                                        │                      │
//!                                                        ▼                      ▼
//!                                                      FAILED                 FAILED
//! ```
//!
//! DONE and FAILED are terminal; no event leaves them. Every transition is
//! validated through [`validate_transition`] so the PostgreSQL store and the
//! in-memory test store enforce identical legality rules.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// IngestionState
// ---------------------------------------------------------------------------

/// All states a stock ingestion run can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionState {
    /// Initial state when ingestion is requested.
    QueuedForFetch,
    /// Data is being fetched from the upstream source.
    Fetching,
    /// Raw payload landed in the object store.
    Fetched,
    /// Ready for the transform worker.
    QueuedForTransform,
    /// Transform worker is reshaping and merging.
    TransformRunning,
    /// Merge into the unified table completed.
    TransformFinished,
    /// Pipeline completed successfully. **Terminal.**
    Done,
    /// Pipeline encountered an error. **Terminal.**
    Failed,
}

/// The six non-terminal states, in pipeline order. Backs the partial-unique
/// "at most one active run per stock" constraint.
pub const ACTIVE_STATES: [IngestionState; 6] = [
    IngestionState::QueuedForFetch,
    IngestionState::Fetching,
    IngestionState::Fetched,
    IngestionState::QueuedForTransform,
    IngestionState::TransformRunning,
    IngestionState::TransformFinished,
];

impl IngestionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionState::QueuedForFetch => "QUEUED_FOR_FETCH",
            IngestionState::Fetching => "FETCHING",
            IngestionState::Fetched => "FETCHED",
            IngestionState::QueuedForTransform => "QUEUED_FOR_TRANSFORM",
            IngestionState::TransformRunning => "TRANSFORM_RUNNING",
            IngestionState::TransformFinished => "TRANSFORM_FINISHED",
            IngestionState::Done => "DONE",
            IngestionState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        match s {
            "QUEUED_FOR_FETCH" => Ok(IngestionState::QueuedForFetch),
            "FETCHING" => Ok(IngestionState::Fetching),
            "FETCHED" => Ok(IngestionState::Fetched),
            "QUEUED_FOR_TRANSFORM" => Ok(IngestionState::QueuedForTransform),
            "TRANSFORM_RUNNING" => Ok(IngestionState::TransformRunning),
            "TRANSFORM_FINISHED" => Ok(IngestionState::TransformFinished),
            "DONE" => Ok(IngestionState::Done),
            "FAILED" => Ok(IngestionState::Failed),
            other => Err(PipelineError::InvalidState(format!(
                "unknown ingestion state: {other}"
            ))),
        }
    }

    /// Returns `true` for DONE and FAILED; no further transitions possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionState::Done | IngestionState::Failed)
    }

    /// Complement of [`is_terminal`][Self::is_terminal].
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The phase-timestamp column stamped on first entry into this state.
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            IngestionState::QueuedForFetch => "queued_for_fetch_at",
            IngestionState::Fetching => "fetching_started_at",
            IngestionState::Fetched => "fetching_finished_at",
            IngestionState::QueuedForTransform => "queued_for_transform_at",
            IngestionState::TransformRunning => "transform_started_at",
            IngestionState::TransformFinished => "transform_finished_at",
            IngestionState::Done => "done_at",
            IngestionState::Failed => "failed_at",
        }
    }
}

impl std::fmt::Display for IngestionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transition authority
// ---------------------------------------------------------------------------

/// Legal successor states for `from`. Terminal states return the empty slice.
pub fn valid_next_states(from: IngestionState) -> &'static [IngestionState] {
    use IngestionState::*;
    match from {
        QueuedForFetch => &[Fetching, Failed],
        Fetching => &[Fetched, Failed],
        Fetched => &[QueuedForTransform, Failed],
        QueuedForTransform => &[TransformRunning, Failed],
        TransformRunning => &[TransformFinished, Failed],
        TransformFinished => &[Done, Failed],
        Done | Failed => &[],
    }
}

/// Validate that `from → to` is a legal edge of the pipeline.
///
/// Both run-store implementations call this under their row lock before
/// mutating anything, so an illegal transition never reaches the database.
pub fn validate_transition(
    from: IngestionState,
    to: IngestionState,
) -> Result<(), PipelineError> {
    let allowed = valid_next_states(from);
    if allowed.contains(&to) {
        return Ok(());
    }
    Err(PipelineError::InvalidStateTransition(format!(
        "cannot transition from '{from}' to '{to}' (valid: {})",
        allowed
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Validate the error-field requirement of entering FAILED: both
/// `error_code` and `error_message` must be non-empty.
pub fn validate_failure_fields(
    to: IngestionState,
    error_code: Option<&str>,
    error_message: Option<&str>,
) -> Result<(), PipelineError> {
    if to != IngestionState::Failed {
        return Ok(());
    }
    let code_ok = error_code.is_some_and(|c| !c.is_empty());
    let msg_ok = error_message.is_some_and(|m| !m.is_empty());
    if code_ok && msg_ok {
        Ok(())
    } else {
        Err(PipelineError::InvalidStateTransition(
            "FAILED requires both error_code and error_message".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
