//! Environment configuration for the ingestion pipeline.
//!
//! Production injects `SIP_*` environment variables directly; development
//! uses `.env.local` via [`bootstrap_dotenv`]. Every consumer takes a
//! [`Config`] value; nothing else in the workspace reads the environment.

use anyhow::{Context, Result};

pub const ENV_DB_URL: &str = "SIP_DATABASE_URL";

/// Load `.env.local` if present. Silent when the file does not exist.
pub fn bootstrap_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
}

/// Upstream data-source settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the stock-data API.
    pub url: String,
    /// Optional bearer token sent as `Authorization: Bearer <token>`.
    pub api_token: Option<String>,
    /// Request timeout in seconds (default 30).
    pub timeout_secs: u64,
}

/// S3/MinIO object-store settings shared by the raw bucket and the table
/// bucket.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Required for plain-HTTP endpoints (MinIO).
    pub allow_http: bool,
    /// When set, table commits skip conditional-put and overwrite blindly.
    /// Needed on object stores without create-if-absent semantics.
    pub allow_unsafe_rename: bool,
    pub raw_bucket: String,
    pub table_bucket: String,
}

/// Outbound webhook notifier settings.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
    /// Appended as `?thread_id=<id>` when present.
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    pub notifier: NotifierConfig,
    /// Redis DSN for the list-view cache; `None` disables caching (the
    /// fabric warns and no-ops).
    pub cache_url: Option<String>,
    /// Static bearer token for the HTTP API; `None` leaves the API open.
    pub api_token: Option<String>,
    /// Bind address for the HTTP server (default `127.0.0.1:8780`).
    pub bind_addr: String,
}

impl Config {
    /// Read the full configuration from `SIP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: require(ENV_DB_URL)?,
            upstream: UpstreamConfig {
                url: require("SIP_STOCK_DATA_API_URL")?,
                api_token: optional("SIP_STOCK_DATA_API_KEY"),
                timeout_secs: optional("SIP_STOCK_DATA_API_TIMEOUT")
                    .map(|v| v.parse::<u64>())
                    .transpose()
                    .context("SIP_STOCK_DATA_API_TIMEOUT must be an integer")?
                    .unwrap_or(30),
            },
            storage: StorageConfig {
                endpoint: require("SIP_S3_ENDPOINT_URL")?,
                region: optional("SIP_S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                access_key_id: require("SIP_S3_ACCESS_KEY_ID")?,
                secret_access_key: require("SIP_S3_SECRET_ACCESS_KEY")?,
                allow_http: flag("SIP_S3_ALLOW_HTTP"),
                allow_unsafe_rename: flag("SIP_S3_ALLOW_UNSAFE_RENAME"),
                raw_bucket: require("SIP_RAW_DATA_BUCKET")?,
                table_bucket: require("SIP_TABLE_BUCKET")?,
            },
            notifier: NotifierConfig {
                webhook_url: optional("SIP_WEBHOOK_URL"),
                thread_id: optional("SIP_WEBHOOK_THREAD_ID"),
            },
            cache_url: optional("SIP_CACHE_URL"),
            api_token: optional("SIP_API_TOKEN"),
            bind_addr: optional("SIP_API_ADDR").unwrap_or_else(|| "127.0.0.1:8780".to_string()),
        })
    }
}

fn require(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing env var {key}"))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
