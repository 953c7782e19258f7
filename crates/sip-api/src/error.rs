//! Error envelope and service-error mapping.
//!
//! Every error response carries `{"error": {"code", "message", "details"}}`,
//! including broker-enqueue failures, which the upstream system sometimes
//! emitted as bare fields; here the envelope is used consistently.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sip_schemas::PipelineError;

pub fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    details: serde_json::Value,
) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "code": code,
                "message": message,
                "details": details,
            }
        })),
    )
        .into_response()
}

/// Map a service error to its HTTP representation.
pub fn map_pipeline_error(e: &PipelineError, details: serde_json::Value) -> Response {
    let (status, code) = match e {
        PipelineError::StockNotFound(_) => (StatusCode::NOT_FOUND, "STOCK_NOT_FOUND"),
        PipelineError::RunNotFound(_) => (StatusCode::NOT_FOUND, "RUN_NOT_FOUND"),
        PipelineError::BulkRunNotFound(_) => (StatusCode::NOT_FOUND, "BULK_QUEUE_RUN_NOT_FOUND"),
        PipelineError::InvalidStateTransition(_) => {
            (StatusCode::BAD_REQUEST, "INVALID_STATE_TRANSITION")
        }
        PipelineError::DuplicateActiveRun(_) => (StatusCode::CONFLICT, "RACE_CONDITION"),
        PipelineError::Broker(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BROKER_ERROR"),
        PipelineError::StorageAuthentication(_) => (StatusCode::UNAUTHORIZED, "STORAGE_AUTH_ERROR"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "UNEXPECTED_ERROR"),
    };
    error_response(status, code, &e.to_string(), details)
}
