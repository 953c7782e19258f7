mod common;

use httpmock::prelude::*;
use sip_schemas::{IngestionState, PipelineError};
use sip_workers::Task;

/// Upstream 404: non-retryable, run fails with API_ERROR, red notification
/// queued, exactly one request made.
#[tokio::test]
async fn api_404_fails_immediately_without_retry() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(404);
        })
        .await;

    let fx = common::fixture(&server.base_url());
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::QueuedForFetch, 0);

    let err = fx
        .workers
        .fetch
        .run(&run.id.to_string(), "AAPL")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ApiNotFound(_)));
    assert!(!err.is_retryable());
    assert_eq!(upstream.hits_async().await, 1);

    let updated = &fx.store.all_runs()[0];
    assert_eq!(updated.state, IngestionState::Failed);
    assert_eq!(updated.error_code.as_deref(), Some("API_ERROR"));
    assert!(updated.error_message.is_some());
    assert!(updated.failed_at.is_some());

    let tasks = fx.queue.tasks();
    assert_eq!(tasks.len(), 1);
    assert!(matches!(&tasks[0], Task::Notify { state, .. }
        if *state == IngestionState::Failed));
}

#[tokio::test]
async fn api_401_is_authentication_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(401);
        })
        .await;

    let fx = common::fixture(&server.base_url());
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::QueuedForFetch, 0);

    let err = fx
        .workers
        .fetch
        .run(&run.id.to_string(), "AAPL")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ApiAuthentication(_)));
    assert_eq!(
        fx.store.all_runs()[0].state,
        IngestionState::Failed
    );
}

/// 429 and 5xx are retryable: the worker leaves the run in FETCHING for the
/// queue to retry; no FAILED transition yet.
#[tokio::test]
async fn rate_limit_and_server_errors_are_retryable() {
    for status in [429u16, 500, 503] {
        let server = MockServer::start_async().await;
        server
            .mock_async(move |when, then| {
                when.method(GET);
                then.status(status);
            })
            .await;

        let fx = common::fixture(&server.base_url());
        let stock = fx.store.seed_stock("AAPL");
        let run = fx.store.seed_run(&stock, IngestionState::QueuedForFetch, 0);

        let err = fx
            .workers
            .fetch
            .run(&run.id.to_string(), "AAPL")
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "status {status} must be retryable");
        assert_eq!(fx.store.all_runs()[0].state, IngestionState::Fetching);
        assert!(fx.queue.tasks().is_empty());
    }
}

#[tokio::test]
async fn other_4xx_is_non_retryable_client_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(418);
        })
        .await;

    let fx = common::fixture(&server.base_url());
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::QueuedForFetch, 0);

    let err = fx
        .workers
        .fetch
        .run(&run.id.to_string(), "AAPL")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ApiClient(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn non_json_body_is_invalid_data_format() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(200).body("<html>definitely not json</html>");
        })
        .await;

    let fx = common::fixture(&server.base_url());
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::QueuedForFetch, 0);

    let err = fx
        .workers
        .fetch
        .run(&run.id.to_string(), "AAPL")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidDataFormat(_)));
    assert_eq!(
        fx.store.all_runs()[0].error_code.as_deref(),
        Some("DATA_TRANSFORMATION_ERROR")
    );
}

#[tokio::test]
async fn empty_body_is_invalid_data_format() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(200).body("");
        })
        .await;

    let fx = common::fixture(&server.base_url());
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::QueuedForFetch, 0);

    let err = fx
        .workers
        .fetch
        .run(&run.id.to_string(), "AAPL")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidDataFormat(_)));
}
