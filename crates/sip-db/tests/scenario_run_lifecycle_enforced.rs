use sip_db::{PgRunStore, RunStore, StateUpdate};
use sip_schemas::{IngestionState, PipelineError};

/// Full-lifecycle DB test. Skips when SIP_DATABASE_URL is not set
/// (local + CI friendly).
#[tokio::test]
async fn run_lifecycle_enforced() -> anyhow::Result<()> {
    if std::env::var("SIP_DATABASE_URL").is_err() {
        eprintln!("SKIP: SIP_DATABASE_URL not set");
        return Ok(());
    }
    let pool = sip_db::testkit_db_pool().await?;
    let store = PgRunStore::new(pool);

    // Unique suffix so repeated local runs never collide on the ticker.
    let ticker = format!("LC{}", &uuid::Uuid::new_v4().simple().to_string()[..6].to_uppercase());

    let (run, created) = store.queue_for_fetch(&ticker, Some("test"), "req-1").await?;
    assert!(created);
    assert_eq!(run.state, IngestionState::QueuedForFetch);
    assert!(run.queued_for_fetch_at.is_some());

    // Second queue returns the same active run, and the idempotent
    // fast-path leaves the stock row completely untouched.
    let before = store.get_stock_by_ticker(&ticker).await?.unwrap();
    let (again, created2) = store.queue_for_fetch(&ticker, None, "req-2").await?;
    assert!(!created2);
    assert_eq!(again.id, run.id);
    let after = store.get_stock_by_ticker(&ticker).await?.unwrap();
    assert_eq!(before.updated_at, after.updated_at);

    // Happy path transitions stamp each phase timestamp.
    store
        .update_run_state(run.id, IngestionState::Fetching, StateUpdate::default())
        .await?;
    store
        .update_run_state(
            run.id,
            IngestionState::Fetched,
            StateUpdate {
                raw_data_uri: Some(format!("s3://raw/{ticker}/{}.json", run.id)),
                ..StateUpdate::default()
            },
        )
        .await?;
    store
        .update_run_state(run.id, IngestionState::QueuedForTransform, StateUpdate::default())
        .await?;
    store
        .update_run_state(run.id, IngestionState::TransformRunning, StateUpdate::default())
        .await?;
    store
        .update_run_state(
            run.id,
            IngestionState::TransformFinished,
            StateUpdate {
                processed_data_uri: Some("s3://lake/stocks".to_string()),
                ..StateUpdate::default()
            },
        )
        .await?;
    let done = store
        .update_run_state(run.id, IngestionState::Done, StateUpdate::default())
        .await?;

    assert_eq!(done.state, IngestionState::Done);
    assert!(done.fetching_started_at.is_some());
    assert!(done.fetching_finished_at.is_some());
    assert!(done.queued_for_transform_at.is_some());
    assert!(done.transform_started_at.is_some());
    assert!(done.transform_finished_at.is_some());
    assert!(done.done_at.is_some());
    assert!(done.raw_data_uri.is_some());
    assert_eq!(done.processed_data_uri.as_deref(), Some("s3://lake/stocks"));

    // Terminal: nothing further is legal.
    let err = store
        .update_run_state(run.id, IngestionState::Fetching, StateUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition(_)));

    // A fresh queue after the terminal run creates a new one.
    let (fresh, created3) = store.queue_for_fetch(&ticker, None, "req-3").await?;
    assert!(created3);
    assert_ne!(fresh.id, run.id);

    // FAILED requires error fields.
    let err = store
        .update_run_state(fresh.id, IngestionState::Failed, StateUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition(_)));

    // With error fields it lands, stamping failed_at.
    let failed = store
        .update_run_state(
            fresh.id,
            IngestionState::Failed,
            StateUpdate {
                error_code: Some("API_ERROR".to_string()),
                error_message: Some("boom".to_string()),
                ..StateUpdate::default()
            },
        )
        .await?;
    assert!(failed.failed_at.is_some());
    assert_eq!(failed.error_code.as_deref(), Some("API_ERROR"));

    Ok(())
}
