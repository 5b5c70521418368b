//! Local In-Process Tier
//!
//! Bounded in-memory cache backed by Moka. Never authoritative: entries are
//! only ever populated from a successful remote read or a local write.

use crate::cache::entry::CacheValue;
use crate::cache::expiry::RandomizedExpiry;
use crate::cache::metrics::CacheMetrics;
use crate::config::{ExpireMode, LocalCacheConfig};
use crate::error::{Error, Result};
use moka::future::Cache;
use moka::notification::RemovalCause;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// In-process tier of one coordinator
#[derive(Clone)]
pub struct LocalCache {
    inner: Cache<String, CacheValue>,
    expire_mode: ExpireMode,
}

impl LocalCache {
    /// Build the local tier for a named cache
    ///
    /// `time_to_live` is the remote TTL, used as the base of the jittered
    /// lifetime when the expiry mode is `Random`. Policy validation happens
    /// here so an invalid policy never produces a cache.
    pub fn new(
        name: &str,
        config: &LocalCacheConfig,
        time_to_live: Duration,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        if config.max_size == 0 {
            return Err(Error::Configuration(format!(
                "local cache '{}' needs a max_size of at least 1",
                name
            )));
        }

        let mut builder = Cache::builder()
            .name(name)
            .initial_capacity(config.initial_capacity)
            .max_capacity(config.max_size);

        builder = match config.expire_mode {
            ExpireMode::Write => {
                Self::require_positive(name, "expire_after_write", config.expire_after_write)?;
                builder.time_to_live(config.expire_after_write)
            }
            ExpireMode::Access => {
                Self::require_positive(name, "expire_after_access", config.expire_after_access)?;
                builder.time_to_idle(config.expire_after_access)
            }
            ExpireMode::Random => {
                builder.expire_after(RandomizedExpiry::new(time_to_live, config.expiry_jitter)?)
            }
        };

        builder = builder.eviction_listener(move |_key, _value, cause| match cause {
            RemovalCause::Expired => metrics.record_expiration(),
            RemovalCause::Size => metrics.record_capacity_eviction(),
            RemovalCause::Explicit | RemovalCause::Replaced => {}
        });

        debug!(
            cache = %name,
            max_size = config.max_size,
            expire_mode = %config.expire_mode,
            "Local cache tier built"
        );

        Ok(Self {
            inner: builder.build(),
            expire_mode: config.expire_mode,
        })
    }

    fn require_positive(name: &str, field: &str, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(Error::Configuration(format!(
                "local cache '{}' needs a positive {}",
                name, field
            )));
        }
        Ok(())
    }

    /// Get a value if present and not expired
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        self.inner.get(key).await
    }

    /// Store a value
    pub async fn insert(&self, key: String, value: CacheValue) {
        self.inner.insert(key, value).await;
    }

    /// Remove a single entry
    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    /// Remove every entry
    pub async fn invalidate_all(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
    }

    /// Check if a live mapping exists
    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Check if any live entry exists
    pub fn has_entries(&self) -> bool {
        self.inner.iter().next().is_some()
    }

    /// Approximate number of entries
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Expiry strategy of this tier
    pub fn expire_mode(&self) -> ExpireMode {
        self.expire_mode
    }

    /// Apply pending maintenance (expirations, evictions, counters)
    pub async fn sync(&self) {
        self.inner.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("name", &self.inner.name())
            .field("expire_mode", &self.expire_mode)
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn local(config: LocalCacheConfig) -> LocalCache {
        LocalCache::new(
            "test",
            &config,
            Duration::from_secs(60),
            Arc::new(CacheMetrics::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let cache = local(LocalCacheConfig::default());
        assert!(!cache.has_entries());

        cache
            .insert("k1".into(), CacheValue::Value(Bytes::from("v1")))
            .await;
        assert_eq!(
            cache.get("k1").await,
            Some(CacheValue::Value(Bytes::from("v1")))
        );
        assert!(cache.contains("k1"));
        assert!(cache.has_entries());

        cache.invalidate("k1").await;
        assert_eq!(cache.get("k1").await, None);
        assert!(!cache.contains("k1"));
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = local(LocalCacheConfig::default());
        cache.insert("a".into(), CacheValue::Null).await;
        cache.insert("b".into(), CacheValue::from("b")).await;
        assert!(cache.has_entries());

        cache.invalidate_all().await;
        assert!(!cache.has_entries());
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_write_expiry() {
        let cache = local(LocalCacheConfig {
            expire_mode: ExpireMode::Write,
            expire_after_write: Duration::from_millis(50),
            ..Default::default()
        });
        cache.insert("k".into(), CacheValue::from("v")).await;
        assert!(cache.get("k").await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_access_expiry_extended_by_reads() {
        let cache = local(LocalCacheConfig {
            expire_mode: ExpireMode::Access,
            expire_after_access: Duration::from_millis(200),
            ..Default::default()
        });
        cache.insert("k".into(), CacheValue::from("v")).await;

        // outlives its idle time as long as it keeps being read
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(cache.get("k").await.is_some());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let cache = local(LocalCacheConfig {
            max_size: 10,
            initial_capacity: 10,
            ..Default::default()
        });
        for i in 0..200 {
            cache.insert(format!("k{}", i), CacheValue::Null).await;
        }
        cache.sync().await;
        assert!(cache.entry_count() <= 10);
    }

    #[test]
    fn test_invalid_policy_fails_fast() {
        let metrics = Arc::new(CacheMetrics::new());
        let config = LocalCacheConfig {
            expiry_jitter: 150,
            ..Default::default()
        };
        assert!(matches!(
            LocalCache::new("bad", &config, Duration::from_secs(1), metrics.clone()),
            Err(Error::InvalidExpiry(_))
        ));
        assert!(matches!(
            LocalCache::new("bad", &LocalCacheConfig::default(), Duration::ZERO, metrics.clone()),
            Err(Error::InvalidExpiry(_))
        ));

        let config = LocalCacheConfig {
            expire_mode: ExpireMode::Access,
            expire_after_access: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            LocalCache::new("bad", &config, Duration::from_secs(1), metrics),
            Err(Error::Configuration(_))
        ));
    }
}
