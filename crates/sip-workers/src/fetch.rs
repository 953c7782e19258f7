//! Fetch worker: upstream download + raw upload.
//!
//! Safely parallel per ticker; every run writes to its own object key and
//! all state transitions go through the row-locked transition authority.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sip_config::UpstreamConfig;
use sip_db::{RunStore, StateUpdate};
use sip_schemas::{IngestionState, PipelineError};
use sip_store::RawStore;
use tracing::{info, warn};

use crate::queue::{Queue, Task};
use crate::{parse_run_id, transition_to_failed};

/// Result object returned by a fetch task execution.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub run_id: String,
    pub ticker: String,
    pub state: IngestionState,
    pub skipped: bool,
    pub data_uri: Option<String>,
}

pub struct FetchWorker {
    store: Arc<dyn RunStore>,
    raw: Arc<dyn RawStore>,
    queue: Arc<dyn Queue>,
    http: reqwest::Client,
    upstream: UpstreamConfig,
}

impl FetchWorker {
    pub fn new(
        store: Arc<dyn RunStore>,
        raw: Arc<dyn RawStore>,
        queue: Arc<dyn Queue>,
        upstream: UpstreamConfig,
    ) -> Self {
        FetchWorker {
            store,
            raw,
            queue,
            http: reqwest::Client::new(),
            upstream,
        }
    }

    /// Execute one fetch task.
    ///
    /// Retryable errors propagate so the lane runtime can back off and
    /// retry; non-retryable errors transition the run to FAILED here and
    /// then propagate.
    pub async fn run(&self, run_id: &str, ticker: &str) -> Result<FetchResult, PipelineError> {
        let run_uuid = parse_run_id(run_id)?;
        info!(run_id, ticker, "starting fetch task");

        // Step 1: validate state, transition to FETCHING.
        let run = self.store.get_run(run_uuid).await?;

        // Idempotency guard: already fetched (or further along) means a
        // duplicate task delivery; report the existing URI and stop.
        if matches!(
            run.state,
            IngestionState::Fetched
                | IngestionState::QueuedForTransform
                | IngestionState::TransformRunning
                | IngestionState::TransformFinished
                | IngestionState::Done
        ) {
            info!(run_id, state = %run.state, "run already past fetch, skipping");
            return Ok(FetchResult {
                run_id: run_id.to_string(),
                ticker: ticker.to_string(),
                state: run.state,
                skipped: true,
                data_uri: run.raw_data_uri,
            });
        }

        if run.state == IngestionState::Failed {
            return Err(PipelineError::InvalidState(format!(
                "run {run_id} is in FAILED state and cannot be retried"
            )));
        }

        if run.state == IngestionState::QueuedForFetch {
            self.store
                .update_run_state(run_uuid, IngestionState::Fetching, StateUpdate::default())
                .await?;
        }

        // Step 2: fetch from the upstream API.
        let payload = match self.fetch_from_api(ticker).await {
            Ok(payload) => payload,
            Err(e) if e.is_retryable() => {
                warn!(run_id, ticker, error = %e, "retryable API error");
                return Err(e);
            }
            Err(e) => {
                transition_to_failed(
                    &self.store,
                    &self.queue,
                    run_uuid,
                    ticker,
                    e.failure_code(),
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };
        info!(ticker, bytes = payload.len(), "fetched upstream payload");

        // Step 3: upload raw bytes to the object store.
        let data_uri = match self.raw.put_raw(ticker, run_id, payload).await {
            Ok(uri) => uri,
            Err(e) if e.is_retryable() => {
                warn!(run_id, ticker, error = %e, "retryable storage error");
                return Err(e);
            }
            Err(e) => {
                transition_to_failed(
                    &self.store,
                    &self.queue,
                    run_uuid,
                    ticker,
                    e.failure_code(),
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };

        // Step 4: FETCHED with the raw URI, then hand off to the transform
        // lane.
        self.store
            .update_run_state(
                run_uuid,
                IngestionState::Fetched,
                StateUpdate {
                    raw_data_uri: Some(data_uri.clone()),
                    ..StateUpdate::default()
                },
            )
            .await?;
        self.store
            .update_run_state(
                run_uuid,
                IngestionState::QueuedForTransform,
                StateUpdate::default(),
            )
            .await?;

        if let Err(e) = self
            .queue
            .enqueue(Task::Transform {
                run_id: run_uuid,
                ticker: ticker.to_string(),
            })
            .await
        {
            transition_to_failed(
                &self.store,
                &self.queue,
                run_uuid,
                ticker,
                e.failure_code(),
                &e.to_string(),
            )
            .await;
            return Err(e);
        }

        info!(run_id, ticker, %data_uri, "completed fetch task");
        Ok(FetchResult {
            run_id: run_id.to_string(),
            ticker: ticker.to_string(),
            state: IngestionState::QueuedForTransform,
            skipped: false,
            data_uri: Some(data_uri),
        })
    }

    /// GET the upstream source with a bounded timeout and classify the
    /// response into the error taxonomy.
    async fn fetch_from_api(&self, ticker: &str) -> Result<Bytes, PipelineError> {
        let mut req = self
            .http
            .get(&self.upstream.url)
            .query(&[("ticker", ticker)])
            .timeout(Duration::from_secs(self.upstream.timeout_secs));
        if let Some(token) = &self.upstream.api_token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::ApiTimeout(format!("API request timed out for {ticker}"))
            } else {
                PipelineError::ApiFetch(format!("connection error fetching data for {ticker}: {e}"))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(PipelineError::ApiAuthentication(format!(
                "API authentication failed for {ticker}"
            )));
        }
        if status.as_u16() == 404 {
            return Err(PipelineError::ApiNotFound(format!(
                "ticker {ticker} not found in API"
            )));
        }
        if status.as_u16() == 429 {
            return Err(PipelineError::ApiRateLimit(format!(
                "API rate limit exceeded for {ticker}"
            )));
        }
        if status.is_server_error() {
            return Err(PipelineError::ApiFetch(format!(
                "API server error for {ticker}: {status}"
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::ApiClient(format!(
                "API client error for {ticker}: {status}"
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            PipelineError::ApiFetch(format!("error reading response body for {ticker}: {e}"))
        })?;

        if body.is_empty() {
            return Err(PipelineError::InvalidDataFormat(
                "received empty response from API".to_string(),
            ));
        }
        if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
            return Err(PipelineError::InvalidDataFormat(
                "received data is not valid JSON".to_string(),
            ));
        }
        Ok(body)
    }
}
