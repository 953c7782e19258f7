//! Raw-blob boundary for the object store.
//!
//! This crate defines **only** the raw store trait, its S3/MinIO-backed
//! implementation, and the shared storage error classification. No table
//! logic and no frame logic belong here; the versioned table engine has
//! its own crate.
//!
//! Raw payloads are keyed `{TICKER}/{run_id}.json` inside the raw bucket;
//! distinct keys per run make the store multi-writer safe.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use sip_config::StorageConfig;
use sip_schemas::PipelineError;
use tracing::info;

/// Classify an `object_store` error into the pipeline taxonomy.
///
/// Auth failures and missing buckets/objects are permanent; everything else
/// is treated as a transient connection problem and retried.
pub fn classify_storage_error(context: &str, e: object_store::Error) -> PipelineError {
    match e {
        object_store::Error::Unauthenticated { .. } | object_store::Error::PermissionDenied { .. } => {
            PipelineError::StorageAuthentication(format!("{context}: {e}"))
        }
        object_store::Error::NotFound { .. } => {
            PipelineError::StorageBucketNotFound(format!("{context}: {e}"))
        }
        other => PipelineError::StorageConnection(format!("{context}: {other}")),
    }
}

/// Build an S3/MinIO client scoped to one bucket.
pub fn s3_store(cfg: &StorageConfig, bucket: &str) -> Result<Arc<dyn ObjectStore>, PipelineError> {
    let store = AmazonS3Builder::new()
        .with_endpoint(&cfg.endpoint)
        .with_region(&cfg.region)
        .with_access_key_id(&cfg.access_key_id)
        .with_secret_access_key(&cfg.secret_access_key)
        .with_bucket_name(bucket)
        .with_allow_http(cfg.allow_http)
        .build()
        .map_err(|e| classify_storage_error("build s3 client", e))?;
    Ok(Arc::new(store))
}

/// Raw JSON blob store contract.
///
/// Implementations must be `Send + Sync` so workers can share them across
/// task boundaries; tests use the same [`RawStore`] over
/// `object_store::memory::InMemory`.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Upload one raw payload and return its `s3://` URI.
    async fn put_raw(
        &self,
        ticker: &str,
        run_id: &str,
        data: Bytes,
    ) -> Result<String, PipelineError>;

    /// Download a payload previously stored under `uri`.
    async fn get_raw(&self, uri: &str) -> Result<Bytes, PipelineError>;
}

/// [`RawStore`] over any `object_store` backend.
pub struct ObjectRawStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectRawStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        ObjectRawStore {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn from_config(cfg: &StorageConfig) -> Result<Self, PipelineError> {
        Ok(ObjectRawStore {
            store: s3_store(cfg, &cfg.raw_bucket)?,
            bucket: cfg.raw_bucket.clone(),
        })
    }
}

/// Split `s3://bucket/key` into `(bucket, key)`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str), PipelineError> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| PipelineError::InvalidDataFormat(format!("invalid S3 URI: {uri}")))?;
    rest.split_once('/')
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| PipelineError::InvalidDataFormat(format!("invalid S3 URI: {uri}")))
}

#[async_trait]
impl RawStore for ObjectRawStore {
    async fn put_raw(
        &self,
        ticker: &str,
        run_id: &str,
        data: Bytes,
    ) -> Result<String, PipelineError> {
        let key = format!("{ticker}/{run_id}.json");
        let path = ObjectPath::from(key.as_str());
        let size = data.len();
        self.store
            .put(&path, PutPayload::from_bytes(data))
            .await
            .map_err(|e| match classify_storage_error("upload raw payload", e) {
                // A failed write on a reachable store is an upload error,
                // which retries, not a connection error masquerade.
                PipelineError::StorageConnection(msg) => PipelineError::StorageUpload(msg),
                other => other,
            })?;

        let uri = format!("s3://{}/{}", self.bucket, key);
        info!(ticker, %uri, bytes = size, "uploaded raw payload");
        Ok(uri)
    }

    async fn get_raw(&self, uri: &str) -> Result<Bytes, PipelineError> {
        let (bucket, key) = parse_s3_uri(uri)?;
        if bucket != self.bucket {
            return Err(PipelineError::StorageBucketNotFound(format!(
                "uri bucket '{bucket}' does not match configured raw bucket '{}'",
                self.bucket
            )));
        }
        let path = ObjectPath::from(key);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| classify_storage_error("download raw payload", e))?;
        let data = result
            .bytes()
            .await
            .map_err(|e| classify_storage_error("read raw payload body", e))?;
        if data.is_empty() {
            return Err(PipelineError::InvalidDataFormat(
                "downloaded file is empty".to_string(),
            ));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn memory_store() -> ObjectRawStore {
        ObjectRawStore::new(Arc::new(InMemory::new()), "raw")
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = memory_store();
        let uri = store
            .put_raw("AAPL", "run-1", Bytes::from_static(b"{\"x\":1}"))
            .await
            .unwrap();
        assert_eq!(uri, "s3://raw/AAPL/run-1.json");

        let data = store.get_raw(&uri).await.unwrap();
        assert_eq!(&data[..], b"{\"x\":1}");
    }

    #[tokio::test]
    async fn get_missing_object_is_bucket_not_found_class() {
        let store = memory_store();
        let err = store.get_raw("s3://raw/MISSING/x.json").await.unwrap_err();
        assert!(matches!(err, PipelineError::StorageBucketNotFound(_)));
    }

    #[tokio::test]
    async fn get_rejects_foreign_bucket() {
        let store = memory_store();
        let err = store.get_raw("s3://other/AAPL/x.json").await.unwrap_err();
        assert!(matches!(err, PipelineError::StorageBucketNotFound(_)));
    }

    #[test]
    fn parse_s3_uri_variants() {
        assert_eq!(
            parse_s3_uri("s3://bucket/a/b.json").unwrap(),
            ("bucket", "a/b.json")
        );
        assert!(parse_s3_uri("http://bucket/a").is_err());
        assert!(parse_s3_uri("s3://bucketonly").is_err());
        assert!(parse_s3_uri("s3:///key").is_err());
    }
}
