//! sip-api entry point.
//!
//! This file is intentionally thin: it sets up tracing, wires the stores,
//! the worker lanes and the cache fabric, builds the router and serves.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sip_api::{build_router, AppState};
use sip_cache::{CacheBackend, NoopCache, RedisCache};
use sip_config::Config;
use sip_db::{PgRunStore, RunStore};
use sip_ingest::StockIngestionService;
use sip_schemas::EntityChanged;
use sip_store::{ObjectRawStore, RawStore};
use sip_table::{TableEngine, VersionedStockTable};
use sip_workers::bulk::BulkOrchestrator;
use sip_workers::fetch::FetchWorker;
use sip_workers::metadata::MetadataProjector;
use sip_workers::notify::{Notifier, WebhookNotifier};
use sip_workers::runtime::{spawn_runtime, TokioQueue, Workers};
use sip_workers::transform::TransformWorker;
use sip_workers::Queue;
use tokio::sync::broadcast;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sip_config::bootstrap_dotenv();
    init_tracing();

    let config = Config::from_env()?;

    let pool = sip_db::connect(&config.database_url).await?;
    sip_db::migrate(&pool).await?;

    // Entity-change bus: run-store writes on one end, cache eviction on the
    // other.
    let (events_tx, events_rx) = broadcast::channel::<EntityChanged>(1024);
    let store: Arc<dyn RunStore> =
        Arc::new(PgRunStore::with_events(pool, events_tx));

    let raw: Arc<dyn RawStore> = Arc::new(ObjectRawStore::from_config(&config.storage)?);
    let table: Arc<dyn TableEngine> = Arc::new(VersionedStockTable::from_config(&config.storage)?);
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(config.notifier.clone()));

    let cache: Arc<dyn CacheBackend> = match &config.cache_url {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => {
            info!("no cache DSN configured, list-view caching disabled");
            Arc::new(NoopCache)
        }
    };
    tokio::spawn(sip_cache::run_invalidation_listener(
        Arc::clone(&cache),
        events_rx,
    ));

    // Worker lanes. The transform lane is single-consumer by construction;
    // the versioned-table writer must never run concurrently.
    let (queue, lanes) = TokioQueue::channel();
    let queue: Arc<dyn Queue> = queue;
    let service = StockIngestionService::new(Arc::clone(&store));
    let workers = Arc::new(Workers {
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        fetch: FetchWorker::new(
            Arc::clone(&store),
            Arc::clone(&raw),
            Arc::clone(&queue),
            config.upstream.clone(),
        ),
        transform: TransformWorker::new(
            Arc::clone(&store),
            Arc::clone(&raw),
            Arc::clone(&table),
            Arc::clone(&queue),
        ),
        metadata: MetadataProjector::new(Arc::clone(&store), Arc::clone(&table)),
        bulk: BulkOrchestrator::new(Arc::clone(&store), service, Arc::clone(&queue)),
        notifier,
    });
    spawn_runtime(workers, lanes);

    let state = Arc::new(AppState::new(
        store,
        queue,
        cache,
        raw,
        config.api_token.clone(),
    ));
    let app = build_router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind addr {}", config.bind_addr))?;
    info!("sip-api listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
