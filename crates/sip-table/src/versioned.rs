//! Object-store-backed versioned table.
//!
//! Layout under `{prefix}` inside the table bucket:
//!
//! ```text
//! stocks/_log/00000000000000000000.json   commit 0
//! stocks/_log/00000000000000000001.json   commit 1
//! stocks/_data/part-00000-<uuid>.parquet  snapshot written by commit 0
//! stocks/_data/part-00001-<uuid>.parquet  snapshot written by commit 1
//! ```
//!
//! Each commit records the full-snapshot parquet file for its version; the
//! reader resolves the highest committed version and loads that snapshot.
//! Commits are create-if-absent by default, so a racing second writer gets
//! a hard `TableMerge` error instead of corrupting the log. Object stores
//! without conditional-put can opt out via the unsafe-rename flag, which is
//! exactly why the transform lane must stay single-consumer.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use sip_config::StorageConfig;
use sip_schemas::PipelineError;
use sip_store::{classify_storage_error, s3_store};
use tracing::info;
use uuid::Uuid;

use crate::merge::merge_frames;
use crate::TableEngine;

/// One entry of the commit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub version: u64,
    pub data_path: String,
    pub rows: u64,
    /// `"create"` for version 0, `"merge"` afterwards.
    pub operation: String,
    pub committed_at: chrono::DateTime<Utc>,
}

pub struct VersionedStockTable {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    /// `false` only when unsafe rename is allowed by configuration.
    conditional_commit: bool,
}

fn read_err(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::TableRead(format!("{context}: {e}"))
}

fn write_err(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::TableWrite(format!("{context}: {e}"))
}

impl VersionedStockTable {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, allow_unsafe_rename: bool) -> Self {
        VersionedStockTable {
            store,
            bucket: bucket.into(),
            prefix: "stocks".to_string(),
            conditional_commit: !allow_unsafe_rename,
        }
    }

    pub fn from_config(cfg: &StorageConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(
            s3_store(cfg, &cfg.table_bucket)?,
            cfg.table_bucket.clone(),
            cfg.allow_unsafe_rename,
        ))
    }

    /// `s3://{bucket}/{prefix}`, recorded as `processed_data_uri`.
    pub fn table_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn log_path(&self, version: u64) -> ObjectPath {
        ObjectPath::from(format!("{}/_log/{version:020}.json", self.prefix))
    }

    /// Highest committed version, or `None` for a table that does not exist.
    pub async fn latest_commit(&self) -> Result<Option<CommitInfo>, PipelineError> {
        let log_prefix = ObjectPath::from(format!("{}/_log", self.prefix));
        let entries: Vec<_> = self
            .store
            .list(Some(&log_prefix))
            .try_collect()
            .await
            .map_err(|e| read_err("list commit log", e))?;

        let latest = entries
            .iter()
            .filter_map(|meta| {
                meta.location
                    .filename()
                    .and_then(|f| f.strip_suffix(".json"))
                    .and_then(|v| v.parse::<u64>().ok())
            })
            .max();

        let Some(version) = latest else {
            return Ok(None);
        };

        let bytes = self
            .store
            .get(&self.log_path(version))
            .await
            .map_err(|e| read_err("read commit entry", e))?
            .bytes()
            .await
            .map_err(|e| read_err("read commit entry body", e))?;
        let commit: CommitInfo =
            serde_json::from_slice(&bytes).map_err(|e| read_err("decode commit entry", e))?;
        Ok(Some(commit))
    }

    /// Load the full snapshot behind a commit.
    pub async fn load_snapshot(&self, commit: &CommitInfo) -> Result<DataFrame, PipelineError> {
        let bytes = self
            .store
            .get(&ObjectPath::from(commit.data_path.as_str()))
            .await
            .map_err(|e| read_err("read snapshot", e))?
            .bytes()
            .await
            .map_err(|e| read_err("read snapshot body", e))?;
        ParquetReader::new(Cursor::new(bytes.to_vec()))
            .finish()
            .map_err(|e| read_err("decode snapshot parquet", e))
    }

    /// Current table contents, or `None` when the table does not exist.
    pub async fn snapshot(&self) -> Result<Option<DataFrame>, PipelineError> {
        match self.latest_commit().await? {
            Some(commit) => Ok(Some(self.load_snapshot(&commit).await?)),
            None => Ok(None),
        }
    }

    async fn write_version(
        &self,
        version: u64,
        mut frame: DataFrame,
        operation: &str,
    ) -> Result<(), PipelineError> {
        let data_path = format!(
            "{}/_data/part-{version:05}-{}.parquet",
            self.prefix,
            Uuid::new_v4()
        );

        let mut buf = Cursor::new(Vec::new());
        ParquetWriter::new(&mut buf)
            .finish(&mut frame)
            .map_err(|e| write_err("encode snapshot parquet", e))?;
        self.store
            .put(
                &ObjectPath::from(data_path.as_str()),
                PutPayload::from_bytes(Bytes::from(buf.into_inner())),
            )
            .await
            .map_err(|e| write_err("upload snapshot", e))?;

        let commit = CommitInfo {
            version,
            data_path,
            rows: frame.height() as u64,
            operation: operation.to_string(),
            committed_at: Utc::now(),
        };
        let body = serde_json::to_vec(&commit).map_err(|e| write_err("encode commit", e))?;

        let opts = if self.conditional_commit {
            PutOptions::from(PutMode::Create)
        } else {
            PutOptions::default()
        };
        let res = self
            .store
            .put_opts(
                &self.log_path(version),
                PutPayload::from_bytes(Bytes::from(body)),
                opts,
            )
            .await;
        match res {
            Ok(_) => {
                info!(
                    version,
                    rows = commit.rows,
                    operation,
                    table = %self.table_uri(),
                    "committed table version"
                );
                Ok(())
            }
            Err(object_store::Error::AlreadyExists { .. }) => {
                Err(PipelineError::TableMerge(format!(
                    "concurrent commit detected for version {version}; \
                     the table writer must be single-consumer"
                )))
            }
            Err(e) => Err(match classify_storage_error("commit table version", e) {
                PipelineError::StorageConnection(msg) => PipelineError::TableWrite(msg),
                other => other,
            }),
        }
    }
}

#[async_trait]
impl TableEngine for VersionedStockTable {
    async fn merge(&self, source: DataFrame) -> Result<String, PipelineError> {
        match self.latest_commit().await? {
            None => {
                self.write_version(0, source, "create").await?;
            }
            Some(commit) => {
                let target = self.load_snapshot(&commit).await?;
                let merged = merge_frames(&target, &source)?;
                self.write_version(commit.version + 1, merged, "merge")
                    .await?;
            }
        }
        Ok(self.table_uri())
    }

    async fn read_metadata(&self, ticker: &str) -> Result<Option<DataFrame>, PipelineError> {
        let Some(df) = self.snapshot().await? else {
            return Ok(None);
        };

        let tickers = df
            .column("ticker")
            .map_err(|e| read_err("ticker column", e))?
            .str()
            .map_err(|e| read_err("ticker column type", e))?;
        let record_types = df
            .column("record_type")
            .map_err(|e| read_err("record_type column", e))?
            .str()
            .map_err(|e| read_err("record_type column type", e))?;

        let mask: BooleanChunked = tickers
            .into_iter()
            .zip(record_types.into_iter())
            .map(|(t, r)| t == Some(ticker) && r == Some("metadata"))
            .collect();
        let filtered = df
            .filter(&mask)
            .map_err(|e| read_err("filter metadata rows", e))?;
        Ok(Some(filtered))
    }
}
