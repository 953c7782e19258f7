//! Shared handler state.

use std::sync::Arc;

use sip_cache::CacheBackend;
use sip_db::RunStore;
use sip_ingest::StockIngestionService;
use sip_store::RawStore;
use sip_workers::Queue;

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub service: StockIngestionService,
    pub queue: Arc<dyn Queue>,
    pub cache: Arc<dyn CacheBackend>,
    pub raw: Arc<dyn RawStore>,
    /// Static bearer token; `None` leaves the API open (dev).
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn Queue>,
        cache: Arc<dyn CacheBackend>,
        raw: Arc<dyn RawStore>,
        api_token: Option<String>,
    ) -> Self {
        AppState {
            service: StockIngestionService::new(Arc::clone(&store)),
            store,
            queue,
            cache,
            raw,
            api_token,
        }
    }
}
