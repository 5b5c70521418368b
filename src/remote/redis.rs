//! Redis Remote Store
//!
//! Commands go through a `deadpool-redis` pool; each subscription opens a
//! dedicated pub/sub connection from a plain `redis::Client`.

use crate::error::{Error, Result};
use crate::remote::RemoteStore;
use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings for the Redis adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisRemoteConfig {
    pub url: String,
    pub pool_size: usize,
    /// Keys fetched per SCAN round trip when clearing by prefix
    pub scan_count: usize,
}

impl Default for RedisRemoteConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            scan_count: 500,
        }
    }
}

/// Remote tier backed by Redis
pub struct RedisRemoteStore {
    pool: Pool,
    client: redis::Client,
    scan_count: usize,
}

impl std::fmt::Debug for RedisRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRemoteStore")
            .field("pool", &self.pool.status())
            .field("scan_count", &self.scan_count)
            .finish()
    }
}

impl RedisRemoteStore {
    /// Build the pool and pub/sub client; no connection is opened yet
    pub fn new(config: &RedisRemoteConfig) -> Result<Self> {
        let mut pool_config = PoolConfig::from_url(config.url.clone());
        pool_config.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Configuration(format!("invalid Redis pool settings: {}", e)))?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::Configuration(format!("invalid Redis URL: {}", e)))?;

        info!(pool_size = config.pool_size, "Redis remote store configured");
        Ok(Self {
            pool,
            client,
            scan_count: config.scan_count.max(1),
        })
    }

    async fn connection(&self, operation: &str) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::remote(operation, e))
    }
}

/// Escape glob metacharacters so a literal prefix can be used in `MATCH`
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection("GET").await?;
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(|e| Error::remote("GET", e))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection("SET").await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::remote("SET", e))?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.connection("SETNX").await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref()).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::remote("SETNX", e))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection("DEL").await?;
        let _: u64 = conn.del(key).await.map_err(|e| Error::remote("DEL", e))?;
        Ok(())
    }

    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.connection("SCAN").await?;
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::remote("SCAN", e))?;

            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await.map_err(|e| Error::remote("DEL", e))?;
                deleted += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, deleted = deleted, "Cleared remote keys by prefix");
        Ok(deleted)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.connection("PUBLISH").await?;
        let _: u64 = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(|e| Error::remote("PUBLISH", e))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::remote("SUBSCRIBE", e))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| Error::remote("SUBSCRIBE", e))?;

        info!(topic = %topic, "Subscribed to Redis channel");
        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(stream.boxed())
    }
}
