//! Axum router and all HTTP handlers.
//!
//! Middleware layers (tracing) are **not** applied here; `main.rs` attaches
//! them after this call so tests can use the bare router. The static-bearer
//! gate is part of the router because it is behavior, not instrumentation.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sip_db::{Page, RunFilter, StateUpdate};
use sip_schemas::{normalize_ticker, IngestionState, PipelineError};
use sip_workers::Task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{error_response, map_pipeline_error};
use crate::filters::{RunListQuery, StockListQuery};
use crate::pagination::next_cursor;
use crate::state::AppState;

/// Stats responses are cached for 5 minutes.
const STATS_CACHE_TTL_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tickers", get(list_tickers))
        .route("/ticker/:ticker/detail", get(ticker_detail))
        .route("/ticker/:ticker/status", get(ticker_status))
        .route("/ticker/queue", post(queue_for_fetch))
        .route("/ticker/queue/all", post(queue_all_stocks))
        .route("/runs", get(list_runs))
        .route("/runs/ticker/:ticker", get(runs_for_ticker))
        .route("/run/:run_id/detail", get(run_detail))
        .route("/bulk-queue-runs", get(list_bulk_runs))
        .route("/bulk-queue-runs/:id/stats", get(bulk_run_stats))
        .route("/data/all-data/:ticker", get(all_data))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer,
        ))
        .with_state(state)
}

/// 403 on anonymous requests when a token is configured.
async fn require_bearer(
    State(st): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &st.api_token {
        let authorized = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected);
        if !authorized {
            return error_response(
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "authentication required",
                serde_json::Value::Null,
            );
        }
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// GET /tickers
// ---------------------------------------------------------------------------

pub(crate) async fn list_tickers(
    State(st): State<Arc<AppState>>,
    Query(query): Query<StockListQuery>,
) -> Response {
    let Ok(page) = query.page_params().to_page() else {
        return validation_error("invalid cursor");
    };
    match st.store.list_stocks(&query.to_filter(), &page).await {
        Ok(stocks) => {
            let next = next_cursor(&stocks, page.limit, |s| (s.created_at, s.id));
            (
                StatusCode::OK,
                Json(serde_json::json!({ "results": stocks, "next": next })),
            )
                .into_response()
        }
        Err(e) => map_pipeline_error(&e, serde_json::Value::Null),
    }
}

// ---------------------------------------------------------------------------
// GET /ticker/{t}/detail
// ---------------------------------------------------------------------------

pub(crate) async fn ticker_detail(
    State(st): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> Response {
    let ticker = normalize_ticker(&ticker);
    match st.store.get_stock_by_ticker(&ticker).await {
        Ok(Some(stock)) => (StatusCode::OK, Json(stock)).into_response(),
        Ok(None) => map_pipeline_error(
            &PipelineError::StockNotFound(ticker.clone()),
            serde_json::json!({ "ticker": ticker }),
        ),
        Err(e) => map_pipeline_error(&e, serde_json::Value::Null),
    }
}

// ---------------------------------------------------------------------------
// GET /ticker/{t}/status
// ---------------------------------------------------------------------------

pub(crate) async fn ticker_status(
    State(st): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> Response {
    match st.service.get_status(&ticker).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => map_pipeline_error(&e, serde_json::json!({ "ticker": normalize_ticker(&ticker) })),
    }
}

// ---------------------------------------------------------------------------
// POST /ticker/queue
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct QueueForFetchRequest {
    ticker: String,
    requested_by: Option<String>,
    request_id: Option<String>,
}

fn validation_error(message: &str) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        "VALIDATION_ERROR",
        "Validation failed",
        serde_json::json!({ "detail": message }),
    )
}

pub(crate) async fn queue_for_fetch(
    State(st): State<Arc<AppState>>,
    Json(body): Json<QueueForFetchRequest>,
) -> Response {
    let ticker = body.ticker.trim();
    if ticker.is_empty() || ticker.len() > 10 || !ticker.chars().all(|c| c.is_ascii_alphanumeric())
    {
        warn!(ticker, "queue for fetch validation failed");
        return error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "Validation failed",
            serde_json::json!({ "ticker": "must be 1-10 alphanumeric characters" }),
        );
    }

    let result = st
        .service
        .queue_for_fetch(ticker, body.requested_by.as_deref(), body.request_id.as_deref())
        .await;

    let (run, created) = match result {
        Ok(r) => r,
        Err(e @ PipelineError::DuplicateActiveRun(_)) => {
            warn!(ticker, "race condition detected while queuing stock for fetch");
            return map_pipeline_error(
                &e,
                serde_json::json!({ "ticker": normalize_ticker(ticker) }),
            );
        }
        Err(e) => return map_pipeline_error(&e, serde_json::Value::Null),
    };

    if !created {
        info!(ticker, run_id = %run.id, state = %run.state, "stock already queued, returning existing run");
        return (StatusCode::OK, Json(run)).into_response();
    }

    // The service transaction has committed; safe to hand off to the
    // broker now.
    match st
        .queue
        .enqueue(Task::Fetch {
            run_id: run.id,
            ticker: run.ticker.clone(),
        })
        .await
    {
        Ok(()) => {
            info!(ticker, run_id = %run.id, "stock queued for fetch, new run created");
            (StatusCode::CREATED, Json(run)).into_response()
        }
        Err(e) => {
            error!(run_id = %run.id, error = %e, "failed to queue fetch task for run");
            // The run can never be processed; terminalize it.
            if let Err(state_err) = st
                .service
                .update_run_state(
                    run.id,
                    IngestionState::Failed,
                    StateUpdate {
                        error_code: Some("BROKER_ERROR".to_string()),
                        error_message: Some(format!(
                            "failed to queue task to message broker: {e}"
                        )),
                        ..StateUpdate::default()
                    },
                )
                .await
            {
                error!(run_id = %run.id, error = %state_err, "failed to transition run to FAILED after broker error");
            }
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "BROKER_ERROR",
                "Failed to queue task to message broker",
                serde_json::json!({ "run_id": run.id }),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// POST /ticker/queue/all
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub(crate) struct QueueAllRequest {
    requested_by: Option<String>,
    exchange: Option<String>,
}

pub(crate) async fn queue_all_stocks(
    State(st): State<Arc<AppState>>,
    body: Option<Json<QueueAllRequest>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    if let Some(exchange) = &body.exchange {
        if exchange.trim().is_empty() {
            return validation_error("exchange filter must not be empty");
        }
    }

    let bulk = match st.store.create_bulk_run(body.requested_by.as_deref()).await {
        Ok(b) => b,
        Err(e) => return map_pipeline_error(&e, serde_json::Value::Null),
    };

    let exchange = body
        .exchange
        .as_deref()
        .map(normalize_ticker);
    match st
        .queue
        .enqueue(Task::BulkFanOut {
            bulk_run_id: bulk.id,
            exchange,
        })
        .await
    {
        Ok(()) => {
            info!(bulk_run_id = %bulk.id, "bulk queue run accepted");
            (StatusCode::ACCEPTED, Json(bulk)).into_response()
        }
        Err(e) => {
            error!(bulk_run_id = %bulk.id, error = %e, "failed to enqueue bulk fan-out");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "BROKER_ERROR",
                "Failed to queue bulk task to message broker",
                serde_json::json!({ "bulk_queue_run_id": bulk.id }),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// GET /runs, GET /runs/ticker/{t}
// ---------------------------------------------------------------------------

async fn run_listing(
    st: &AppState,
    query: &RunListQuery,
    base_filter: Option<RunFilter>,
    page: Page,
) -> Response {
    let filter = match query.to_filter() {
        Ok(mut f) => {
            if let Some(base) = base_filter {
                f.ticker = base.ticker;
            }
            f
        }
        Err(invalid) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "Validation failed",
                serde_json::json!({ "state": format!("invalid state value: {}", invalid.0) }),
            )
        }
    };
    match st.store.list_runs(&filter, &page).await {
        Ok(runs) => {
            let next = next_cursor(&runs, page.limit, |r| (r.created_at, r.id));
            (
                StatusCode::OK,
                Json(serde_json::json!({ "results": runs, "next": next })),
            )
                .into_response()
        }
        Err(e) => map_pipeline_error(&e, serde_json::Value::Null),
    }
}

pub(crate) async fn list_runs(
    State(st): State<Arc<AppState>>,
    Query(query): Query<RunListQuery>,
) -> Response {
    let Ok(page) = query.page_params().to_page() else {
        return validation_error("invalid cursor");
    };
    run_listing(&st, &query, None, page).await
}

pub(crate) async fn runs_for_ticker(
    State(st): State<Arc<AppState>>,
    Path(ticker): Path<String>,
    Query(query): Query<RunListQuery>,
) -> Response {
    let ticker = normalize_ticker(&ticker);
    match st.store.get_stock_by_ticker(&ticker).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return map_pipeline_error(
                &PipelineError::StockNotFound(ticker.clone()),
                serde_json::json!({ "ticker": ticker }),
            )
        }
        Err(e) => return map_pipeline_error(&e, serde_json::Value::Null),
    }
    let Ok(page) = query.page_params().to_page() else {
        return validation_error("invalid cursor");
    };
    let base = RunFilter {
        ticker: Some(ticker),
        ..RunFilter::default()
    };
    run_listing(&st, &query, Some(base), page).await
}

// ---------------------------------------------------------------------------
// GET /run/{id}/detail
// ---------------------------------------------------------------------------

pub(crate) async fn run_detail(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    let Ok(run_uuid) = Uuid::parse_str(&run_id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_UUID",
            "run id is not a valid UUID",
            serde_json::json!({ "run_id": run_id }),
        );
    };
    match st.store.get_run(run_uuid).await {
        Ok(run) => (StatusCode::OK, Json(run)).into_response(),
        Err(e) => map_pipeline_error(&e, serde_json::json!({ "run_id": run_id })),
    }
}

// ---------------------------------------------------------------------------
// GET /bulk-queue-runs, GET /bulk-queue-runs/{id}/stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BulkListQuery {
    cursor: Option<String>,
    page_size: Option<i64>,
}

pub(crate) async fn list_bulk_runs(
    State(st): State<Arc<AppState>>,
    Query(query): Query<BulkListQuery>,
) -> Response {
    let params = crate::pagination::PageParams {
        cursor: query.cursor,
        page_size: query.page_size,
    };
    let Ok(page) = params.to_page() else {
        return validation_error("invalid cursor");
    };
    match st.store.list_bulk_runs(&page).await {
        Ok(bulks) => {
            let next = next_cursor(&bulks, page.limit, |b| (b.created_at, b.id));
            (
                StatusCode::OK,
                Json(serde_json::json!({ "results": bulks, "next": next })),
            )
                .into_response()
        }
        Err(e) => map_pipeline_error(&e, serde_json::Value::Null),
    }
}

pub(crate) async fn bulk_run_stats(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(bulk_uuid) = Uuid::parse_str(&id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_UUID",
            "bulk queue run id is not a valid UUID",
            serde_json::json!({ "bulk_queue_run_id": id }),
        );
    };

    let cache_key = format!("bulk_queue_run_stats:{bulk_uuid}");
    match st.cache.get_json(&cache_key).await {
        Ok(Some(cached)) => {
            info!(%cache_key, "bulk queue run stats served from cache");
            return (StatusCode::OK, Json(cached)).into_response();
        }
        Ok(None) => {}
        Err(e) => warn!(%cache_key, error = %e, "stats cache read failed"),
    }

    let bulk = match st.store.get_bulk_run(bulk_uuid).await {
        Ok(b) => b,
        Err(e) => return map_pipeline_error(&e, serde_json::json!({ "bulk_queue_run_id": id })),
    };
    let counts = match st.store.bulk_state_counts(bulk_uuid).await {
        Ok(c) => c,
        Err(e) => return map_pipeline_error(&e, serde_json::Value::Null),
    };

    let mut state_counts = serde_json::Map::new();
    for (state, n) in counts {
        state_counts.insert(state.as_str().to_string(), serde_json::json!(n));
    }
    let payload = serde_json::json!({
        "bulk_queue_run": bulk,
        "state_counts": state_counts,
    });

    if let Err(e) = st
        .cache
        .set_json(&cache_key, &payload, STATS_CACHE_TTL_SECS)
        .await
    {
        warn!(%cache_key, error = %e, "stats cache write failed");
    }

    (StatusCode::OK, Json(payload)).into_response()
}

// ---------------------------------------------------------------------------
// GET /data/all-data/{t}
// ---------------------------------------------------------------------------

pub(crate) async fn all_data(
    State(st): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> Response {
    let ticker = normalize_ticker(&ticker);
    let stock = match st.store.get_stock_by_ticker(&ticker).await {
        Ok(Some(stock)) => stock,
        Ok(None) => {
            return map_pipeline_error(
                &PipelineError::StockNotFound(ticker.clone()),
                serde_json::json!({ "ticker": ticker }),
            )
        }
        Err(e) => return map_pipeline_error(&e, serde_json::Value::Null),
    };

    let run = match st.store.latest_done_run(stock.id).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "RUN_NOT_FOUND",
                "no completed ingestion run for ticker",
                serde_json::json!({ "ticker": ticker }),
            )
        }
        Err(e) => return map_pipeline_error(&e, serde_json::Value::Null),
    };

    let Some(uri) = run.raw_data_uri.clone() else {
        return error_response(
            StatusCode::NOT_FOUND,
            "RUN_NOT_FOUND",
            "completed run has no raw data",
            serde_json::json!({ "ticker": ticker, "run_id": run.id }),
        );
    };

    match st.raw.get_raw(&uri).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(e) => map_pipeline_error(&e, serde_json::json!({ "ticker": ticker, "uri": uri })),
    }
}
