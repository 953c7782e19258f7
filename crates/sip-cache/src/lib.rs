//! Cache-invalidation fabric for list-view responses.
//!
//! List responses are cached under keys of the form
//! `cache.page.<view>.GET.<path_hash>.<query_hash>.<locale>.<tz>` with a
//! mirrored `cache.header.<view>.<header_hash>.<locale>.<tz>` entry. Since
//! cursors and filters vary per page, eviction is pattern-based: after a
//! committed write to Stock/Exchange/Sector the fabric deletes every key
//! matching `*cache.page.<view>.GET.*` and `*cache.header.<view>.*` for
//! each affected view.
//!
//! The Redis backend uses cursor-based SCAN (non-blocking, safe in
//! production; never KEYS) plus DEL. Backends without pattern scan log a
//! warning and no-op.

use std::sync::Arc;

use async_trait::async_trait;
use sip_schemas::{EntityChanged, PipelineError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub mod backend;

pub use backend::{NoopCache, RedisCache};

/// View identifiers used in cache keys.
pub const TICKER_LIST_VIEW: &str = "ticker-list";
pub const EXCHANGE_LIST_VIEW: &str = "exchange-list";
pub const SECTOR_LIST_VIEW: &str = "sector-list";

/// Which list views one entity mutation invalidates.
pub fn views_for(entity: EntityChanged) -> &'static [&'static str] {
    match entity {
        EntityChanged::Stock => &[TICKER_LIST_VIEW],
        EntityChanged::Exchange => &[EXCHANGE_LIST_VIEW, TICKER_LIST_VIEW],
        EntityChanged::Sector => &[SECTOR_LIST_VIEW, TICKER_LIST_VIEW],
    }
}

/// The two eviction patterns for one view id.
pub fn patterns_for(view: &str) -> [String; 2] {
    [
        format!("*cache.page.{view}.GET.*"),
        format!("*cache.header.{view}.*"),
    ]
}

/// Cache backend contract: pattern eviction plus TTL'd JSON get/set (used
/// by the bulk-stats endpoint).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Whether this backend can pattern-scan. When `false`, eviction is a
    /// warn-and-noop.
    fn supports_pattern_scan(&self) -> bool;

    /// Delete every key matching `pattern`; returns how many were deleted.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, PipelineError>;

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, PipelineError>;

    async fn set_json(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_secs: u64,
    ) -> Result<(), PipelineError>;
}

/// Evict all cached pages and headers for one view.
pub async fn invalidate_list_view(cache: &dyn CacheBackend, view: &str) {
    if !cache.supports_pattern_scan() {
        warn!(view, "cache backend does not support pattern-based invalidation");
        return;
    }
    let mut deleted = 0u64;
    for pattern in patterns_for(view) {
        match cache.delete_pattern(&pattern).await {
            Ok(n) => deleted += n,
            Err(e) => {
                // Never let cache trouble propagate into write paths.
                warn!(view, %pattern, error = %e, "cache invalidation failed");
                return;
            }
        }
    }
    debug!(view, deleted, "invalidated list view cache");
}

/// Subscribe to the entity-change bus and evict per the catalogue until the
/// bus closes. Spawn this once at startup.
pub async fn run_invalidation_listener(
    cache: Arc<dyn CacheBackend>,
    mut events: broadcast::Receiver<EntityChanged>,
) {
    info!("cache invalidation listener started");
    loop {
        match events.recv().await {
            Ok(entity) => {
                for view in views_for(entity) {
                    invalidate_list_view(cache.as_ref(), view).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed events: evict everything the catalogue knows about.
                warn!(skipped, "invalidation listener lagged, flushing all views");
                for view in [TICKER_LIST_VIEW, EXCHANGE_LIST_VIEW, SECTOR_LIST_VIEW] {
                    invalidate_list_view(cache.as_ref(), view).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("cache invalidation listener stopped");
}
