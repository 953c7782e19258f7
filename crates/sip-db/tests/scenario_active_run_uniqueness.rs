use sip_db::{PgRunStore, RunStore};
use sip_schemas::normalize_ticker;

/// The partial unique index is the backstop for "at most one active run per
/// stock": a direct second active insert must violate
/// `unique_active_run_per_stock` regardless of application-level checks.
#[tokio::test]
async fn partial_unique_index_rejects_second_active_run() -> anyhow::Result<()> {
    if std::env::var("SIP_DATABASE_URL").is_err() {
        eprintln!("SKIP: SIP_DATABASE_URL not set");
        return Ok(());
    }
    let pool = sip_db::testkit_db_pool().await?;
    let store = PgRunStore::new(pool.clone());

    let ticker = format!("UQ{}", &uuid::Uuid::new_v4().simple().to_string()[..6].to_uppercase());
    let stock = store.get_or_create_stock(&ticker).await?;
    let (_run, created) = store.queue_for_fetch(&ticker, None, "req-1").await?;
    assert!(created);

    // Bypass the fast-path and insert a second active row directly.
    let res = sqlx::query(
        "insert into ingestion_runs (id, stock_id, state, queued_for_fetch_at)
         values ($1, $2, 'QUEUED_FOR_FETCH', now())",
    )
    .bind(uuid::Uuid::new_v4())
    .bind(stock.id)
    .execute(&pool)
    .await;

    let err = res.unwrap_err();
    let msg = format!("{err}").to_lowercase();
    assert!(
        msg.contains("unique_active_run_per_stock")
            || msg.contains("duplicate")
            || msg.contains("unique"),
        "expected unique active run constraint; got: {msg}"
    );

    // Terminal rows are unconstrained and may accumulate.
    sqlx::query(
        "insert into ingestion_runs
             (id, stock_id, state, failed_at, error_code, error_message)
         values ($1, $2, 'FAILED', now(), 'SEEDED', 'seeded')",
    )
    .bind(uuid::Uuid::new_v4())
    .bind(stock.id)
    .execute(&pool)
    .await?;
    sqlx::query(
        "insert into ingestion_runs (id, stock_id, state, done_at)
         values ($1, $2, 'DONE', now())",
    )
    .bind(uuid::Uuid::new_v4())
    .bind(stock.id)
    .execute(&pool)
    .await?;

    Ok(())
}

#[tokio::test]
async fn ticker_upsert_is_case_stable() -> anyhow::Result<()> {
    if std::env::var("SIP_DATABASE_URL").is_err() {
        eprintln!("SKIP: SIP_DATABASE_URL not set");
        return Ok(());
    }
    let pool = sip_db::testkit_db_pool().await?;
    let store = PgRunStore::new(pool);

    let raw = format!("cs{}", &uuid::Uuid::new_v4().simple().to_string()[..6]);
    let normalized = normalize_ticker(&format!(" {raw} "));

    let first = store.get_or_create_stock(&normalized).await?;
    let second = store.get_or_create_stock(&normalized).await?;
    assert_eq!(first.id, second.id);
    assert_eq!(first.ticker, normalized);

    Ok(())
}
