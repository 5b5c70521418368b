//! Multi-Level Cache
//!
//! A two-tier cache: a bounded in-process tier in front of a shared remote
//! tier, kept coherent across processes by eviction broadcasts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     MultiLevelCacheManager (per process)                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────┐      ┌──────────────────────────────┐   │
//! │  │  MultiLevelCache "orders"  │ ...  │  MultiLevelCache "users"     │   │
//! │  │  ┌──────────┐ ┌──────────┐ │      │                              │   │
//! │  │  │  Local   │ │ Key lock │ │      │                              │   │
//! │  │  │  (moka)  │ │ registry │ │      │                              │   │
//! │  │  └──────────┘ └──────────┘ │      │                              │   │
//! │  └─────────────┬──────────────┘      └───────────────┬──────────────┘   │
//! │                └──────────────┬──────────────────────┘                  │
//! │                      ┌────────┴────────┐      ┌───────────────────────┐ │
//! │                      │ Circuit Breaker │      │ InvalidationListener  │ │
//! │                      └────────┬────────┘      └───────────┬───────────┘ │
//! ├───────────────────────────────┼───────────────────────────┼─────────────┤
//! │                      RemoteStore (key/value + pub/sub topic)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads go local, then remote, then the caller's loader. Evictions and
//! clears remove local state, remove remote state, then broadcast so every
//! other process drops its local copy.
//!
//! # Usage
//!
//! ```ignore
//! use multilevel_cache::cache::{CacheKey, MultiLevelCacheManager};
//! use bytes::Bytes;
//!
//! let manager = MultiLevelCacheManager::new(config, remote, breaker)?;
//! let orders = manager.get_cache("orders")?.expect("allowed");
//!
//! let key = CacheKey::from("order:1");
//! let value = orders
//!     .get(&key, async { Ok(Some(Bytes::from("loaded"))) })
//!     .await?;
//!
//! orders.evict(&key).await;
//! println!("Hit ratio: {:.2}%", orders.stats().hit_ratio() * 100.0);
//! ```

pub mod coordinator;
pub mod entry;
pub mod events;
pub mod expiry;
pub mod listener;
pub mod local;
pub mod locks;
pub mod manager;
pub mod metrics;

// Re-export main types
pub use coordinator::MultiLevelCache;
pub use entry::{CacheKey, CacheValue, KEY_PART_SEPARATOR};
pub use events::{CacheEvictMessage, EvictScope};
pub use expiry::RandomizedExpiry;
pub use listener::{IgnoreReason, InvalidationListener, ListenerOutcome};
pub use local::LocalCache;
pub use locks::{KeyLockGuard, KeyLockRegistry};
pub use manager::MultiLevelCacheManager;
pub use metrics::{CacheMetrics, CacheStatsSnapshot, TierCounters, TierStatsSnapshot};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Loader passed to [`Cache::get`], run only when neither tier has the key
pub type ValueLoader<'a> = BoxFuture<'a, anyhow::Result<Option<Bytes>>>;

// =============================================================================
// Cache Trait
// =============================================================================

/// Named cache operations, object safe
///
/// Remote faults never surface here; only [`Cache::get`] can fail, and only
/// when the loader does.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Cache name
    fn name(&self) -> &str;

    /// Look up without loading. `Some(CacheValue::Null)` is a cached null.
    async fn lookup(&self, key: &CacheKey) -> Option<CacheValue>;

    /// Look up, running `loader` on a miss in both tiers
    async fn get(&self, key: &CacheKey, loader: ValueLoader<'_>) -> Result<Option<Bytes>>;

    /// Store in both tiers; `None` evicts
    async fn put(&self, key: &CacheKey, value: Option<Bytes>);

    /// Store unless present, returning the previous value
    async fn put_if_absent(&self, key: &CacheKey, value: Option<Bytes>) -> Option<CacheValue>;

    /// Remove from both tiers and broadcast
    async fn evict(&self, key: &CacheKey);

    /// Like `evict`, reporting whether a local mapping existed
    async fn evict_if_present(&self, key: &CacheKey) -> bool;

    /// Remove every entry from both tiers and broadcast
    async fn clear(&self);

    /// Like `clear`, reporting whether any local entry existed
    async fn invalidate(&self) -> bool;
}

/// Shared handle to a cache
pub type CacheRef = Arc<dyn Cache>;

/// Lookup of caches by name
pub trait CacheRegistry: Send + Sync {
    /// Get or create; `Ok(None)` when the name is not allowed
    fn get_cache(&self, name: &str) -> Result<Option<CacheRef>>;

    /// Names of the caches created so far
    fn get_cache_names(&self) -> Vec<String>;
}
