use std::sync::Arc;

use sip_db::{RunStore, StateUpdate};
use sip_ingest::StockIngestionService;
use sip_schemas::{IngestionState, PipelineError};
use sip_testkit::MemoryRunStore;

fn service() -> (Arc<MemoryRunStore>, StockIngestionService) {
    let store = Arc::new(MemoryRunStore::new());
    let service = StockIngestionService::new(store.clone() as Arc<dyn RunStore>);
    (store, service)
}

#[tokio::test]
async fn first_queue_creates_second_returns_existing() {
    let (_, svc) = service();

    let (run1, created1) = svc.queue_for_fetch("aapl", Some("ops"), None).await.unwrap();
    assert!(created1);
    assert_eq!(run1.ticker, "AAPL");
    assert_eq!(run1.state, IngestionState::QueuedForFetch);
    assert!(run1.queued_for_fetch_at.is_some());
    assert!(run1.request_id.is_some());

    let (run2, created2) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();
    assert!(!created2);
    assert_eq!(run2.id, run1.id);
}

#[tokio::test]
async fn ticker_case_variants_resolve_to_one_stock() {
    let (store, svc) = service();

    svc.queue_for_fetch(" aapl ", None, None).await.unwrap();
    svc.queue_for_fetch("AaPl", None, None).await.unwrap();
    svc.queue_for_fetch("AAPL", None, None).await.unwrap();

    assert_eq!(store.all_runs().len(), 1);
    assert!(store.get_stock_by_ticker("AAPL").await.unwrap().is_some());
}

#[tokio::test]
async fn terminal_run_allows_a_fresh_queue() {
    let (store, svc) = service();

    let (run, _) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();
    walk_to_failed(&store, run.id).await;

    let (run2, created) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();
    assert!(created);
    assert_ne!(run2.id, run.id);
}

#[tokio::test]
async fn stale_active_run_surfaces_as_duplicate() {
    let (store, svc) = service();

    // An old run is still active while a newer one is terminal; the
    // uniqueness backstop must reject a fresh insert.
    let stock = store.seed_stock("AAPL");
    store.seed_run(&stock, IngestionState::Fetching, 120);
    store.seed_run(&stock, IngestionState::Failed, 10);

    let err = svc.queue_for_fetch("AAPL", None, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateActiveRun(_)));
}

/// The idempotent fast-path creates nothing and must not dirty the stock
/// list view: only a freshly created stock row publishes a change event.
#[tokio::test]
async fn duplicate_queue_publishes_no_stock_event() {
    let (tx, mut rx) = tokio::sync::broadcast::channel(8);
    let store = Arc::new(MemoryRunStore::with_events(tx));
    let svc = StockIngestionService::new(store.clone() as Arc<dyn RunStore>);

    let (_, created) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();
    assert!(created);
    assert!(rx.try_recv().is_ok(), "stock creation must publish an event");
    assert!(rx.try_recv().is_err(), "exactly one event per creation");

    let (_, created) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();
    assert!(!created);
    assert!(
        rx.try_recv().is_err(),
        "the no-op duplicate queue must not publish"
    );
}

#[tokio::test]
async fn active_runs_excludes_terminal_states() {
    let (store, svc) = service();
    svc.queue_for_fetch("AAPL", None, None).await.unwrap();
    let (msft_run, _) = svc.queue_for_fetch("MSFT", None, None).await.unwrap();
    walk_to_failed(&store, msft_run.id).await;

    let active = store.active_runs().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].ticker, "AAPL");
}

#[tokio::test]
async fn status_for_unknown_ticker_is_not_found() {
    let (_, svc) = service();
    let err = svc.get_status("GHOST").await.unwrap_err();
    assert!(matches!(err, PipelineError::StockNotFound(_)));
}

#[tokio::test]
async fn status_reports_latest_run() {
    let (_, svc) = service();
    let (run, _) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();

    let status = svc.get_status("aapl").await.unwrap();
    assert_eq!(status.ticker, "AAPL");
    assert_eq!(status.run_id, Some(run.id));
    assert_eq!(status.state, Some(IngestionState::QueuedForFetch));
}

#[tokio::test]
async fn status_with_no_runs_has_null_run_fields() {
    let (store, svc) = service();
    store.seed_stock("AAPL");

    let status = svc.get_status("AAPL").await.unwrap();
    assert!(status.run_id.is_none());
    assert!(status.state.is_none());
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let (_, svc) = service();
    let (run, _) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();

    // Skipping straight to DONE is illegal.
    let err = svc
        .update_run_state(run.id, IngestionState::Done, StateUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition(_)));

    // FAILED without error fields is illegal.
    let err = svc
        .update_run_state(run.id, IngestionState::Failed, StateUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition(_)));
}

#[tokio::test]
async fn terminal_runs_accept_no_transitions() {
    let (store, svc) = service();
    let (run, _) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();
    walk_to_failed(&store, run.id).await;

    for target in [
        IngestionState::QueuedForFetch,
        IngestionState::Fetching,
        IngestionState::Done,
    ] {
        let err = svc
            .update_run_state(run.id, target, StateUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStateTransition(_)));
    }
}

#[tokio::test]
async fn happy_path_stamps_every_phase_timestamp() {
    let (store, svc) = service();
    let (run, _) = svc.queue_for_fetch("AAPL", None, None).await.unwrap();

    for state in [
        IngestionState::Fetching,
        IngestionState::Fetched,
        IngestionState::QueuedForTransform,
        IngestionState::TransformRunning,
        IngestionState::TransformFinished,
        IngestionState::Done,
    ] {
        svc.update_run_state(run.id, state, StateUpdate::default())
            .await
            .unwrap();
    }

    let done = &store.all_runs()[0];
    assert_eq!(done.state, IngestionState::Done);
    assert!(done.queued_for_fetch_at.is_some());
    assert!(done.fetching_started_at.is_some());
    assert!(done.fetching_finished_at.is_some());
    assert!(done.queued_for_transform_at.is_some());
    assert!(done.transform_started_at.is_some());
    assert!(done.transform_finished_at.is_some());
    assert!(done.done_at.is_some());
    assert!(done.failed_at.is_none());
}

async fn walk_to_failed(store: &Arc<MemoryRunStore>, run_id: uuid::Uuid) {
    store
        .update_run_state(
            run_id,
            IngestionState::Failed,
            StateUpdate {
                error_code: Some("API_ERROR".to_string()),
                error_message: Some("upstream said no".to_string()),
                ..StateUpdate::default()
            },
        )
        .await
        .unwrap();
}
