//! Multi-Level Cache Manager
//!
//! Registry of named coordinators. Coordinators are created on first request
//! from the shared configuration, remote store, and circuit breaker. A
//! non-empty `cache_names` list restricts the registry to those names and
//! creates them up front.

use crate::cache::coordinator::MultiLevelCache;
use crate::cache::{Cache, CacheRegistry};
use crate::config::MultiLevelCacheConfig;
use crate::error::{Error, Result};
use crate::remote::RemoteStoreRef;
use crate::resilience::CircuitBreaker;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry owning every coordinator of this process
pub struct MultiLevelCacheManager {
    config: MultiLevelCacheConfig,
    remote: RemoteStoreRef,
    breaker: Arc<CircuitBreaker>,
    caches: DashMap<String, Arc<MultiLevelCache>>,
    /// `None` when unrestricted
    allowed: Option<HashSet<String>>,
}

impl MultiLevelCacheManager {
    /// Create a registry, validating the configuration
    pub fn new(
        config: MultiLevelCacheConfig,
        remote: RemoteStoreRef,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        config.validate()?;
        config.check_open_state_duration();

        let allowed = if config.cache_names.is_empty() {
            None
        } else {
            Some(config.cache_names.iter().cloned().collect::<HashSet<_>>())
        };

        let manager = Self {
            config,
            remote,
            breaker,
            caches: DashMap::new(),
            allowed,
        };

        for name in manager.config.cache_names.clone() {
            manager.get_cache(&name)?;
        }

        info!(
            remote = manager.remote.name(),
            restricted = manager.allowed.is_some(),
            caches = manager.caches.len(),
            "Cache manager initialized"
        );
        Ok(manager)
    }

    /// Get or create the coordinator for `name`
    ///
    /// `Ok(None)` when an allow-list exists and `name` is not on it. Creation
    /// is atomic per name: concurrent callers all observe the same instance.
    pub fn get_cache(&self, name: &str) -> Result<Option<Arc<MultiLevelCache>>> {
        if name.is_empty() {
            return Err(Error::Configuration("cache name must not be empty".into()));
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(name) {
                debug!(cache = %name, "Cache name outside allow-list");
                return Ok(None);
            }
        }

        if let Some(existing) = self.caches.get(name) {
            return Ok(Some(existing.value().clone()));
        }

        match self.caches.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Some(entry.get().clone())),
            Entry::Vacant(entry) => {
                let cache = Arc::new(MultiLevelCache::new(
                    name,
                    &self.config,
                    self.remote.clone(),
                    self.breaker.clone(),
                )?);
                entry.insert(cache.clone());
                Ok(Some(cache))
            }
        }
    }

    /// Get a coordinator only if it was already created
    pub fn existing_cache(&self, name: &str) -> Option<Arc<MultiLevelCache>> {
        self.caches.get(name).map(|c| c.value().clone())
    }

    /// Names of the coordinators created so far, sorted
    pub fn get_cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Every coordinator created so far
    pub fn caches(&self) -> Vec<Arc<MultiLevelCache>> {
        self.caches.iter().map(|c| c.value().clone()).collect()
    }

    pub fn config(&self) -> &MultiLevelCacheConfig {
        &self.config
    }

    pub fn remote(&self) -> &RemoteStoreRef {
        &self.remote
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl std::fmt::Debug for MultiLevelCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelCacheManager")
            .field("caches", &self.get_cache_names())
            .field("allowed", &self.allowed)
            .field("remote", &self.remote.name())
            .finish()
    }
}

impl CacheRegistry for MultiLevelCacheManager {
    fn get_cache(&self, name: &str) -> Result<Option<Arc<dyn Cache>>> {
        Ok(MultiLevelCacheManager::get_cache(self, name)?.map(|c| c as Arc<dyn Cache>))
    }

    fn get_cache_names(&self) -> Vec<String> {
        MultiLevelCacheManager::get_cache_names(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemoteStore;
    use std::time::Duration;

    fn manager(config: MultiLevelCacheConfig) -> Result<MultiLevelCacheManager> {
        let breaker = Arc::new(CircuitBreaker::new("remote", config.circuit_breaker.clone()));
        MultiLevelCacheManager::new(config, InMemoryRemoteStore::shared(), breaker)
    }

    #[test]
    fn test_lazy_creation() {
        let manager = manager(MultiLevelCacheConfig::default()).unwrap();
        assert!(manager.get_cache_names().is_empty());
        assert!(manager.existing_cache("orders").is_none());

        let first = manager.get_cache("orders").unwrap().unwrap();
        let second = manager.get_cache("orders").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "orders");

        manager.get_cache("accounts").unwrap();
        assert_eq!(manager.get_cache_names(), vec!["accounts", "orders"]);
    }

    #[test]
    fn test_allow_list() {
        let manager = manager(MultiLevelCacheConfig {
            cache_names: vec!["users".into(), "orders".into()],
            ..Default::default()
        })
        .unwrap();

        // listed caches exist up front
        assert_eq!(manager.get_cache_names(), vec!["orders", "users"]);
        assert!(manager.get_cache("orders").unwrap().is_some());
        assert!(manager.get_cache("other").unwrap().is_none());
        assert_eq!(manager.get_cache_names().len(), 2);
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let result = manager(MultiLevelCacheConfig {
            time_to_live: Duration::ZERO,
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Configuration(_))));

        let manager = manager(MultiLevelCacheConfig::default()).unwrap();
        assert!(manager.get_cache("").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_is_idempotent() {
        let manager = Arc::new(manager(MultiLevelCacheConfig::default()).unwrap());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_cache("orders").unwrap().unwrap() })
            })
            .collect();

        let mut caches = Vec::new();
        for handle in handles {
            caches.push(handle.await.unwrap());
        }
        assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));
        assert_eq!(manager.get_cache_names(), vec!["orders"]);
    }

    #[test]
    fn test_registry_trait_object() {
        let manager = manager(MultiLevelCacheConfig::default()).unwrap();
        let registry: &dyn CacheRegistry = &manager;

        let cache = registry.get_cache("orders").unwrap().unwrap();
        assert_eq!(cache.name(), "orders");
        assert_eq!(registry.get_cache_names(), vec!["orders"]);
    }
}
