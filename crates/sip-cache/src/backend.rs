//! Cache backends.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sip_schemas::PipelineError;

use crate::CacheBackend;

fn cache_err(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Unexpected(format!("cache {context}: {e}"))
}

/// Redis-backed cache with SCAN-based pattern eviction.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = redis::Client::open(url).map_err(|e| cache_err("open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| cache_err("connect", e))?;
        Ok(RedisCache { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn supports_pattern_scan(&self) -> bool {
        true
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, PipelineError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            // SCAN keeps eviction non-blocking; KEYS would stall Redis.
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| cache_err("scan", e))?;

            if !keys.is_empty() {
                let n: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| cache_err("del", e))?;
                deleted += n;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, PipelineError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_err("get", e))?;
        match raw {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| cache_err("decode", e)),
            None => Ok(None),
        }
    }

    async fn set_json(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_secs: u64,
    ) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(value).map_err(|e| cache_err("encode", e))?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(body)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_err("set", e))?;
        Ok(())
    }
}

/// Fallback backend for deployments without a cache DSN: no pattern scan,
/// no stored values. Eviction warns and no-ops via the fabric.
#[derive(Default, Clone)]
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    fn supports_pattern_scan(&self) -> bool {
        false
    }

    async fn delete_pattern(&self, _pattern: &str) -> Result<u64, PipelineError> {
        Ok(0)
    }

    async fn get_json(&self, _key: &str) -> Result<Option<serde_json::Value>, PipelineError> {
        Ok(None)
    }

    async fn set_json(
        &self,
        _key: &str,
        _value: &serde_json::Value,
        _ttl_secs: u64,
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}
