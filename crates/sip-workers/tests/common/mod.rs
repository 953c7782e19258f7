//! Shared fixtures for worker scenario tests.
#![allow(dead_code)]

use std::sync::Arc;

use object_store::memory::InMemory;
use sip_config::{NotifierConfig, UpstreamConfig};
use sip_db::RunStore;
use sip_ingest::StockIngestionService;
use sip_store::{ObjectRawStore, RawStore};
use sip_table::{TableEngine, VersionedStockTable};
use sip_testkit::{CapturingNotifier, CapturingQueue, MemoryRunStore};
use sip_workers::bulk::BulkOrchestrator;
use sip_workers::fetch::FetchWorker;
use sip_workers::metadata::MetadataProjector;
use sip_workers::notify::Notifier;
use sip_workers::runtime::Workers;
use sip_workers::transform::TransformWorker;
use sip_workers::Queue;

pub struct Fixture {
    pub store: Arc<MemoryRunStore>,
    pub queue: Arc<CapturingQueue>,
    pub notifier: Arc<CapturingNotifier>,
    pub raw: Arc<dyn RawStore>,
    pub table: Arc<VersionedStockTable>,
    pub workers: Arc<Workers>,
}

pub fn upstream(url: &str) -> UpstreamConfig {
    UpstreamConfig {
        url: url.to_string(),
        api_token: Some("test-token".to_string()),
        timeout_secs: 5,
    }
}

/// Wire a full worker set over in-memory fakes. `upstream_url` points at an
/// httpmock server (or a dead address for tests that never fetch).
pub fn fixture(upstream_url: &str) -> Fixture {
    let store = Arc::new(MemoryRunStore::new());
    let queue = Arc::new(CapturingQueue::new());
    let notifier = Arc::new(CapturingNotifier::new());
    let raw: Arc<dyn RawStore> = Arc::new(ObjectRawStore::new(Arc::new(InMemory::new()), "raw"));
    let table = Arc::new(VersionedStockTable::new(
        Arc::new(InMemory::new()),
        "lake",
        false,
    ));

    let dyn_store: Arc<dyn RunStore> = store.clone();
    let dyn_queue: Arc<dyn Queue> = queue.clone();
    let dyn_table: Arc<dyn TableEngine> = table.clone();
    let dyn_notifier: Arc<dyn Notifier> = notifier.clone();

    let workers = Arc::new(Workers {
        store: dyn_store.clone(),
        queue: dyn_queue.clone(),
        fetch: FetchWorker::new(
            dyn_store.clone(),
            raw.clone(),
            dyn_queue.clone(),
            upstream(upstream_url),
        ),
        transform: TransformWorker::new(
            dyn_store.clone(),
            raw.clone(),
            dyn_table.clone(),
            dyn_queue.clone(),
        ),
        metadata: MetadataProjector::new(dyn_store.clone(), dyn_table),
        bulk: BulkOrchestrator::new(
            dyn_store.clone(),
            StockIngestionService::new(dyn_store),
            dyn_queue,
        ),
        notifier: dyn_notifier,
    });

    Fixture {
        store,
        queue,
        notifier,
        raw,
        table,
        workers,
    }
}

/// The upstream payload used across scenarios: three quarterly periods,
/// metadata, and a TTM block.
pub fn sample_payload() -> serde_json::Value {
    serde_json::json!({
        "data": {
            "financials": {
                "quarterly": {
                    "period_end_date": ["2023-12-31", "2024-03-31", "2024-06-30"],
                    "revenue": [100, 110, 120],
                    "net_income": [10.5, "N/A", 12.25]
                },
                "ttm": {
                    "period_end_date": "TTM",
                    "revenue": 450,
                    "net_income": 45.5
                }
            },
            "metadata": {
                "name": "Apple Inc.",
                "sector": "Technology",
                "exchange": "NASDAQ",
                "country": "US"
            }
        }
    })
}

/// The `NotifierConfig` for webhook tests.
#[allow(dead_code)]
pub fn notifier_config(url: Option<&str>, thread_id: Option<&str>) -> NotifierConfig {
    NotifierConfig {
        webhook_url: url.map(|s| s.to_string()),
        thread_id: thread_id.map(|s| s.to_string()),
    }
}
