//! Pipeline error taxonomy.
//!
//! Two families drive the whole retry design: retryable errors go back to
//! the task queue with backoff, non-retryable errors transition the run to
//! FAILED immediately. [`PipelineError::is_retryable`] is the single source
//! of truth for that split; workers never pattern-match individual variants
//! to decide retry behavior.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    // -- retryable ---------------------------------------------------------
    #[error("upstream request timed out: {0}")]
    ApiTimeout(String),
    #[error("upstream rate limit exceeded: {0}")]
    ApiRateLimit(String),
    #[error("upstream fetch failed: {0}")]
    ApiFetch(String),
    #[error("storage connection failed: {0}")]
    StorageConnection(String),
    #[error("storage upload failed: {0}")]
    StorageUpload(String),
    #[error("database lock timeout: {0}")]
    DatabaseLockTimeout(String),

    // -- non-retryable -----------------------------------------------------
    #[error("upstream authentication failed: {0}")]
    ApiAuthentication(String),
    #[error("not found upstream: {0}")]
    ApiNotFound(String),
    #[error("upstream client error: {0}")]
    ApiClient(String),
    #[error("storage authentication failed: {0}")]
    StorageAuthentication(String),
    #[error("storage bucket not found: {0}")]
    StorageBucketNotFound(String),
    #[error("invalid data format: {0}")]
    InvalidDataFormat(String),
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("ingestion run '{0}' not found")]
    RunNotFound(Uuid),
    #[error("stock '{0}' not found")]
    StockNotFound(String),
    #[error("bulk queue run '{0}' not found")]
    BulkRunNotFound(Uuid),
    #[error("table write failed: {0}")]
    TableWrite(String),
    #[error("table merge failed: {0}")]
    TableMerge(String),
    #[error("table read failed: {0}")]
    TableRead(String),
    #[error("an active ingestion run already exists for '{0}'")]
    DuplicateActiveRun(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("broker enqueue failed: {0}")]
    Broker(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl PipelineError {
    /// Whether the task queue should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::ApiTimeout(_)
                | PipelineError::ApiRateLimit(_)
                | PipelineError::ApiFetch(_)
                | PipelineError::StorageConnection(_)
                | PipelineError::StorageUpload(_)
                | PipelineError::DatabaseLockTimeout(_)
        )
    }

    /// The `error_code` recorded on a run that fails with this error.
    pub fn failure_code(&self) -> &'static str {
        match self {
            PipelineError::ApiTimeout(_)
            | PipelineError::ApiRateLimit(_)
            | PipelineError::ApiFetch(_)
            | PipelineError::ApiAuthentication(_)
            | PipelineError::ApiNotFound(_)
            | PipelineError::ApiClient(_) => "API_ERROR",
            PipelineError::StorageAuthentication(_) => "STORAGE_AUTH_ERROR",
            PipelineError::StorageBucketNotFound(_) => "STORAGE_BUCKET_NOT_FOUND",
            PipelineError::StorageConnection(_) | PipelineError::StorageUpload(_) => {
                "STORAGE_ERROR"
            }
            PipelineError::InvalidDataFormat(_) => "DATA_TRANSFORMATION_ERROR",
            PipelineError::TableWrite(_)
            | PipelineError::TableMerge(_)
            | PipelineError::TableRead(_) => "TABLE_ERROR",
            PipelineError::Broker(_) => "BROKER_ERROR",
            PipelineError::DatabaseLockTimeout(_) | PipelineError::Database(_) => {
                "DATABASE_ERROR"
            }
            _ => "UNEXPECTED_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_family_matches_taxonomy() {
        let retryable: [PipelineError; 6] = [
            PipelineError::ApiTimeout("t".into()),
            PipelineError::ApiRateLimit("r".into()),
            PipelineError::ApiFetch("f".into()),
            PipelineError::StorageConnection("c".into()),
            PipelineError::StorageUpload("u".into()),
            PipelineError::DatabaseLockTimeout("l".into()),
        ];
        for e in retryable {
            assert!(e.is_retryable(), "{e} must be retryable");
        }

        let non_retryable = [
            PipelineError::ApiAuthentication("a".into()),
            PipelineError::ApiNotFound("n".into()),
            PipelineError::ApiClient("c".into()),
            PipelineError::StorageAuthentication("a".into()),
            PipelineError::StorageBucketNotFound("b".into()),
            PipelineError::InvalidDataFormat("d".into()),
            PipelineError::InvalidStateTransition("t".into()),
            PipelineError::InvalidState("s".into()),
            PipelineError::StockNotFound("AAPL".into()),
            PipelineError::TableMerge("m".into()),
            PipelineError::DuplicateActiveRun("AAPL".into()),
            PipelineError::Unexpected("u".into()),
        ];
        for e in non_retryable {
            assert!(!e.is_retryable(), "{e} must not be retryable");
        }
    }

    #[test]
    fn failure_codes_for_worker_failures() {
        assert_eq!(
            PipelineError::ApiNotFound("x".into()).failure_code(),
            "API_ERROR"
        );
        assert_eq!(
            PipelineError::StorageAuthentication("x".into()).failure_code(),
            "STORAGE_AUTH_ERROR"
        );
        assert_eq!(
            PipelineError::StorageBucketNotFound("x".into()).failure_code(),
            "STORAGE_BUCKET_NOT_FOUND"
        );
        assert_eq!(
            PipelineError::InvalidDataFormat("x".into()).failure_code(),
            "DATA_TRANSFORMATION_ERROR"
        );
        assert_eq!(
            PipelineError::TableMerge("x".into()).failure_code(),
            "TABLE_ERROR"
        );
        assert_eq!(PipelineError::Broker("x".into()).failure_code(), "BROKER_ERROR");
    }
}
