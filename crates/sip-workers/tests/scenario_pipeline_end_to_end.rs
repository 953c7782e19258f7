//! Whole-pipeline test over the real lane runtime: queue → fetch →
//! transform → metadata projection → notification, with in-memory stores
//! and a mocked upstream.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use object_store::memory::InMemory;
use sip_config::UpstreamConfig;
use sip_db::RunStore;
use sip_ingest::StockIngestionService;
use sip_schemas::IngestionState;
use sip_store::{ObjectRawStore, RawStore};
use sip_table::{TableEngine, VersionedStockTable};
use sip_testkit::{CapturingNotifier, MemoryRunStore};
use sip_workers::bulk::BulkOrchestrator;
use sip_workers::fetch::FetchWorker;
use sip_workers::metadata::MetadataProjector;
use sip_workers::notify::Notifier;
use sip_workers::runtime::{spawn_runtime, TokioQueue, Workers};
use sip_workers::transform::TransformWorker;
use sip_workers::{Queue, Task};

mod common;

#[tokio::test]
async fn queued_ticker_reaches_done_with_metadata_projected() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).query_param("ticker", "AAPL");
            then.status(200).json_body(common::sample_payload());
        })
        .await;

    let store = Arc::new(MemoryRunStore::new());
    let notifier = Arc::new(CapturingNotifier::new());
    let raw: Arc<dyn RawStore> = Arc::new(ObjectRawStore::new(Arc::new(InMemory::new()), "raw"));
    let table = Arc::new(VersionedStockTable::new(
        Arc::new(InMemory::new()),
        "lake",
        false,
    ));

    let (queue, lanes) = TokioQueue::channel();
    let queue: Arc<dyn Queue> = queue;
    let dyn_store: Arc<dyn RunStore> = store.clone();
    let dyn_table: Arc<dyn TableEngine> = table.clone();
    let service = StockIngestionService::new(dyn_store.clone());

    let upstream = UpstreamConfig {
        url: server.base_url(),
        api_token: None,
        timeout_secs: 5,
    };
    let workers = Arc::new(Workers {
        store: dyn_store.clone(),
        queue: queue.clone(),
        fetch: FetchWorker::new(dyn_store.clone(), raw.clone(), queue.clone(), upstream),
        transform: TransformWorker::new(
            dyn_store.clone(),
            raw.clone(),
            dyn_table.clone(),
            queue.clone(),
        ),
        metadata: MetadataProjector::new(dyn_store.clone(), dyn_table),
        bulk: BulkOrchestrator::new(dyn_store.clone(), service.clone(), queue.clone()),
        notifier: notifier.clone() as Arc<dyn Notifier>,
    });
    spawn_runtime(workers, lanes);

    // Client path: queue the ticker, then hand off post-commit.
    let (run, created) = service.queue_for_fetch("aapl", Some("e2e"), None).await.unwrap();
    assert!(created);
    queue
        .enqueue(Task::Fetch {
            run_id: run.id,
            ticker: run.ticker.clone(),
        })
        .await
        .unwrap();

    // Wait for the pipeline to drain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = store.get_run(run.id).await.unwrap();
        let stock = store.get_stock_by_ticker("AAPL").await.unwrap().unwrap();
        if current.state == IngestionState::Done && stock.sector.is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not finish; state={}",
            current.state
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let finished = store.get_run(run.id).await.unwrap();
    assert_eq!(finished.state, IngestionState::Done);
    assert_eq!(
        finished.raw_data_uri.as_deref(),
        Some(format!("s3://raw/AAPL/{}.json", run.id).as_str())
    );
    assert_eq!(finished.processed_data_uri.as_deref(), Some("s3://lake/stocks"));

    // The table holds the full unified row set.
    let commit = table.latest_commit().await.unwrap().unwrap();
    assert_eq!(commit.rows, 5);

    // Metadata was projected back, including the exchange upsert.
    let stock = store.get_stock_by_ticker("AAPL").await.unwrap().unwrap();
    assert_eq!(stock.name.as_deref(), Some("Apple Inc."));
    assert_eq!(stock.exchange.as_deref(), Some("NASDAQ"));

    // The green notification went out.
    let wait_notify = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let sent = notifier.sent();
        if sent
            .iter()
            .any(|n| n.state == IngestionState::Done && n.ticker == "AAPL")
        {
            break;
        }
        assert!(tokio::time::Instant::now() < wait_notify, "no DONE notification");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
