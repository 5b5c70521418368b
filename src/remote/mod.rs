//! Remote Tier
//!
//! The shared, authoritative key/value store plus its publish/subscribe
//! channel. Coordinators hold it as an `Arc<dyn RemoteStore>`, so tests can
//! substitute any implementation.
//!
//! Adapters:
//! - [`InMemoryRemoteStore`]: process-local, shareable between registries
//! - `RedisRemoteStore`: Redis commands and pub/sub (feature `redis`)

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryRemoteStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisRemoteConfig, RedisRemoteStore};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// RemoteStore Trait
// =============================================================================

/// Capability consumed by the coordinator for its remote tier
///
/// Every call may fail with a transport error. Callers bound each call with
/// the circuit breaker's timeout, so implementations need not time out
/// themselves.
#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    /// Short adapter name for logs
    fn name(&self) -> &'static str;

    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a value, expiring after `ttl` when given
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Store a value only if the key is absent
    ///
    /// Returns `true` if this call stored the value.
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`, returning the number deleted
    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64>;

    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a topic
    ///
    /// The stream ends when the underlying subscription is lost.
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>>;
}

/// Shared handle to a remote store
pub type RemoteStoreRef = Arc<dyn RemoteStore>;
