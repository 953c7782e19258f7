mod common;

use bytes::Bytes;
use sip_schemas::{IngestionState, PipelineError};
use sip_workers::Task;

async fn seed_fetched_run(
    fx: &common::Fixture,
    ticker: &str,
) -> (uuid::Uuid, String) {
    let stock = fx.store.seed_stock(ticker);
    let run = fx.store.seed_run(&stock, IngestionState::QueuedForTransform, 0);
    let payload = serde_json::to_vec(&common::sample_payload()).unwrap();
    let uri = fx
        .raw
        .put_raw(ticker, &run.id.to_string(), Bytes::from(payload))
        .await
        .unwrap();
    fx.store.set_raw_uri(run.id, &uri);
    (run.id, uri)
}

#[tokio::test]
async fn transform_reshapes_merges_and_finishes() {
    let fx = common::fixture("http://127.0.0.1:1");
    let (run_id, _) = seed_fetched_run(&fx, "AAPL").await;

    let result = fx
        .workers
        .transform
        .run(&run_id.to_string(), "AAPL")
        .await
        .unwrap();

    assert!(!result.skipped);
    assert_eq!(result.state, IngestionState::Done);
    // 3 financials + 1 metadata + 1 ttm.
    assert_eq!(result.records_processed, 5);
    assert_eq!(result.processed_uri.as_deref(), Some("s3://lake/stocks"));

    let updated = &fx.store.all_runs()[0];
    assert_eq!(updated.state, IngestionState::Done);
    assert_eq!(updated.processed_data_uri.as_deref(), Some("s3://lake/stocks"));
    assert!(updated.transform_started_at.is_some());
    assert!(updated.transform_finished_at.is_some());
    assert!(updated.done_at.is_some());

    // The table holds the reshaped rows.
    let commit = fx.table.latest_commit().await.unwrap().unwrap();
    assert_eq!(commit.version, 0);
    assert_eq!(commit.rows, 5);

    // Metadata projection and the green notification were queued.
    assert_eq!(fx.queue.count_of("project_metadata"), 1);
    let notifies: Vec<_> = fx
        .queue
        .tasks()
        .into_iter()
        .filter(|t| t.kind() == "notify")
        .collect();
    assert_eq!(notifies.len(), 1);
    assert!(matches!(&notifies[0], Task::Notify { state, .. }
        if *state == IngestionState::Done));
}

/// Re-ingesting the same ticker merges on the composite key instead of
/// duplicating rows; a second ticker accumulates.
#[tokio::test]
async fn repeated_transforms_upsert_into_the_unified_table() {
    let fx = common::fixture("http://127.0.0.1:1");

    let (run_a, _) = seed_fetched_run(&fx, "AAPL").await;
    fx.workers
        .transform
        .run(&run_a.to_string(), "AAPL")
        .await
        .unwrap();

    let (run_b, _) = seed_fetched_run(&fx, "MSFT").await;
    fx.workers
        .transform
        .run(&run_b.to_string(), "MSFT")
        .await
        .unwrap();

    // Second AAPL ingestion run over the same periods.
    let (run_c, _) = seed_fetched_run(&fx, "AAPL").await;
    fx.workers
        .transform
        .run(&run_c.to_string(), "AAPL")
        .await
        .unwrap();

    let commit = fx.table.latest_commit().await.unwrap().unwrap();
    assert_eq!(commit.version, 2);
    // 5 AAPL rows (replaced, not duplicated) + 5 MSFT rows.
    assert_eq!(commit.rows, 10);
}

#[tokio::test]
async fn missing_raw_data_uri_terminalizes_the_run() {
    let fx = common::fixture("http://127.0.0.1:1");
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::QueuedForTransform, 0);

    let err = fx
        .workers
        .transform
        .run(&run.id.to_string(), "AAPL")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState(_)));

    let updated = &fx.store.all_runs()[0];
    assert_eq!(updated.state, IngestionState::Failed);
    assert_eq!(updated.error_code.as_deref(), Some("MISSING_RAW_DATA"));
}

#[tokio::test]
async fn unparseable_payload_fails_with_transformation_error() {
    let fx = common::fixture("http://127.0.0.1:1");
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::QueuedForTransform, 0);
    let uri = fx
        .raw
        .put_raw("AAPL", &run.id.to_string(), Bytes::from_static(b"{\"data\": {}}"))
        .await
        .unwrap();
    fx.store.set_raw_uri(run.id, &uri);

    let err = fx
        .workers
        .transform
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
async fn finished_run_is_skipped_without_table_writes() {
    let fx = common::fixture("http://127.0.0.1:1");
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::Done, 0);

    let result = fx
        .workers
        .transform
        .run(&run.id.to_string(), "AAPL")
        .await
        .unwrap();
    assert!(result.skipped);
    assert!(fx.table.latest_commit().await.unwrap().is_none());
    assert!(fx.queue.tasks().is_empty());
}

#[tokio::test]
async fn failed_run_is_not_retried() {
    let fx = common::fixture("http://127.0.0.1:1");
    let stock = fx.store.seed_stock("AAPL");
    let run = fx.store.seed_run(&stock, IngestionState::Failed, 0);

    let err = fx
        .workers
        .transform
        .run(&run.id.to_string(), "AAPL")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState(_)));
    assert!(!err.is_retryable());
}
