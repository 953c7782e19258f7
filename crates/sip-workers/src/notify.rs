//! Outbound status notifications.
//!
//! Fire-and-forget: the lane runtime logs and swallows every notifier
//! error, so a broken webhook can never affect the pipeline. Embeds are
//! color-coded by state; green for DONE, red for FAILED (with full run
//! detail), yellow for anything in progress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sip_config::NotifierConfig;
use sip_schemas::{IngestionRun, IngestionState, PipelineError};
use tracing::{info, warn};
use uuid::Uuid;

const GREEN: u32 = 0x00FF00;
const RED: u32 = 0xFF0000;
const YELLOW: u32 = 0xFFFF00;

/// Error messages are truncated to this length inside embeds.
const ERROR_MESSAGE_LIMIT: usize = 1000;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// What the notify task knows about a run. `detail` is loaded for FAILED
/// runs so the red embed can carry timestamps, URIs and request metadata;
/// when the load fails the basic embed is sent instead.
#[derive(Debug, Clone)]
pub struct RunNotification {
    pub run_id: Uuid,
    pub ticker: String,
    pub state: IngestionState,
    pub detail: Option<IngestionRun>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, note: &RunNotification) -> Result<(), PipelineError>;
}

/// Webhook-backed notifier. With no webhook configured every send is a
/// logged no-op.
pub struct WebhookNotifier {
    http: reqwest::Client,
    config: NotifierConfig,
}

impl WebhookNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        WebhookNotifier {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, note: &RunNotification) -> Result<(), PipelineError> {
        let Some(base_url) = self.config.webhook_url.as_deref() else {
            warn!(run_id = %note.run_id, "webhook not configured, skipping notification");
            return Ok(());
        };

        let url = match &self.config.thread_id {
            Some(thread) => format!("{base_url}?thread_id={thread}"),
            None => base_url.to_string(),
        };

        let embed = build_embed(note);
        let payload = serde_json::json!({ "embeds": [embed] });

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .timeout(WEBHOOK_TIMEOUT)
            .send()
            .await
            .map_err(|e| PipelineError::Unexpected(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Unexpected(format!(
                "webhook returned {status}"
            )));
        }

        info!(run_id = %note.run_id, ticker = %note.ticker, state = %note.state, "sent notification");
        Ok(())
    }
}

/// Clamp an error message to the embed limit, on a char boundary.
fn truncate_message(msg: &str) -> String {
    if msg.len() <= ERROR_MESSAGE_LIMIT {
        return msg.to_string();
    }
    let mut end = ERROR_MESSAGE_LIMIT - 3;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &msg[..end])
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn field(name: &str, value: String, inline: bool) -> serde_json::Value {
    serde_json::json!({ "name": name, "value": value, "inline": inline })
}

/// Convert `QUEUED_FOR_FETCH` into `Queued For Fetch` for embed titles.
fn title_case(state: IngestionState) -> String {
    state
        .as_str()
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the embed for one notification. Pure, so tests can assert shapes
/// without a webhook server.
pub fn build_embed(note: &RunNotification) -> serde_json::Value {
    let ticker = &note.ticker;
    let (color, title, description) = match note.state {
        IngestionState::Done => (
            GREEN,
            format!("{ticker} - Ingestion Complete"),
            format!("Stock ingestion for {ticker} has completed successfully."),
        ),
        IngestionState::Failed => (
            RED,
            format!("{ticker} - Ingestion Failed"),
            format!("Stock ingestion for {ticker} has failed."),
        ),
        other => (
            YELLOW,
            format!("{ticker} - {}", title_case(other)),
            format!("Stock ingestion for {ticker} is in progress."),
        ),
    };

    let mut fields = vec![
        field("Ticker", ticker.clone(), true),
        field("State", note.state.as_str().to_string(), true),
        field("Run ID", note.run_id.to_string(), false),
    ];

    if note.state == IngestionState::Failed {
        if let Some(run) = &note.detail {
            if run.error_code.is_some() || run.error_message.is_some() {
                let mut lines = Vec::new();
                if let Some(code) = &run.error_code {
                    lines.push(format!("**Code:** {code}"));
                }
                if let Some(msg) = &run.error_message {
                    lines.push(format!("**Message:** {}", truncate_message(msg)));
                }
                fields.push(field("Error Details", lines.join("\n"), false));
            }

            if run.requested_by.is_some() || run.request_id.is_some() {
                let mut lines = Vec::new();
                if let Some(by) = &run.requested_by {
                    lines.push(format!("**Requested By:** {by}"));
                }
                if let Some(id) = &run.request_id {
                    lines.push(format!("**Request ID:** {id}"));
                }
                fields.push(field("Request Information", lines.join("\n"), false));
            }

            let phases: [(&str, Option<DateTime<Utc>>); 8] = [
                ("Queued for Fetch", run.queued_for_fetch_at),
                ("Fetching Started", run.fetching_started_at),
                ("Fetching Finished", run.fetching_finished_at),
                ("Queued for Transform", run.queued_for_transform_at),
                ("Transform Started", run.transform_started_at),
                ("Transform Finished", run.transform_finished_at),
                ("Done", run.done_at),
                ("Failed", run.failed_at),
            ];
            let phase_lines: Vec<String> = phases
                .iter()
                .filter_map(|(label, ts)| ts.map(|t| format!("**{label}:** {}", format_ts(t))))
                .collect();
            if !phase_lines.is_empty() {
                fields.push(field("Pipeline Phases", phase_lines.join("\n"), false));
            }

            let mut locations = Vec::new();
            if let Some(uri) = &run.raw_data_uri {
                locations.push(format!("**Raw Data:** {uri}"));
            }
            if let Some(uri) = &run.processed_data_uri {
                locations.push(format!("**Processed Data:** {uri}"));
            }
            if !locations.is_empty() {
                fields.push(field("Data Locations", locations.join("\n"), false));
            }
        }
    }

    serde_json::json!({
        "title": title,
        "description": description,
        "color": color,
        "fields": fields,
        "footer": { "text": "Stock Ingestion Pipeline" }
    })
}

/// Load the run detail for FAILED notifications, then send.
pub async fn send_run_notification(
    store: &Arc<dyn sip_db::RunStore>,
    notifier: &Arc<dyn Notifier>,
    run_id: Uuid,
    ticker: &str,
    state: IngestionState,
) -> Result<(), PipelineError> {
    let detail = if state == IngestionState::Failed {
        match store.get_run(run_id).await {
            Ok(run) => Some(run),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "run not found for failed notification, using basic embed");
                None
            }
        }
    } else {
        None
    };

    notifier
        .notify(&RunNotification {
            run_id,
            ticker: ticker.to_string(),
            state,
            detail,
        })
        .await
}
