//! Multi-Level Cache Coordinator
//!
//! Read/write/evict/invalidate protocol for one named cache, composing the
//! local tier, the shared remote tier, the shared circuit breaker, per-key
//! locks, and the invalidation topic.
//!
//! Remote faults never escape this module: a failed, timed out, or skipped
//! remote call degrades the operation to local-only behavior. The only error
//! a caller sees is a loader failure in [`MultiLevelCache::get`].

use crate::cache::entry::{CacheKey, CacheValue};
use crate::cache::events::{CacheEvictMessage, EvictScope};
use crate::cache::local::LocalCache;
use crate::cache::locks::KeyLockRegistry;
use crate::cache::metrics::{CacheMetrics, CacheStatsSnapshot};
use crate::cache::{Cache, ValueLoader};
use crate::config::MultiLevelCacheConfig;
use crate::error::{Error, Result};
use crate::remote::RemoteStoreRef;
use crate::resilience::CircuitBreaker;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

tokio::task_local! {
    /// Coordinators whose load lock is held by the current task
    static LOADING: Vec<u64>;
}

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(0);

/// Result of a lookup that missed the local tier
enum RemoteLookup {
    Hit(CacheValue),
    Miss,
    /// Remote tier failed, timed out, or was skipped by the breaker
    Unavailable,
}

/// Coordinator for one named cache
pub struct MultiLevelCache {
    id: u64,
    name: String,
    /// `[key_prefix]<name>::`
    remote_prefix: String,
    time_to_live: Duration,
    allow_null_values: bool,
    topic: String,
    local: LocalCache,
    remote: RemoteStoreRef,
    breaker: Arc<CircuitBreaker>,
    locks: KeyLockRegistry,
    /// Held shared by per-key compound operations, exclusively by `invalidate`
    cache_lock: RwLock<()>,
    /// Serializes `get` on this coordinator
    load_lock: Mutex<()>,
    metrics: Arc<CacheMetrics>,
}

impl MultiLevelCache {
    /// Create a coordinator
    ///
    /// Fails if the local expiry policy is invalid, so no coordinator can
    /// exist with a bad policy.
    pub fn new(
        name: impl Into<String>,
        config: &MultiLevelCacheConfig,
        remote: RemoteStoreRef,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let name = name.into();
        let metrics = Arc::new(CacheMetrics::new());
        let local = LocalCache::new(&name, &config.local, config.time_to_live, metrics.clone())?;

        info!(
            cache = %name,
            remote = remote.name(),
            expire_mode = %local.expire_mode(),
            allow_null_values = config.allow_null_values,
            "Multi-level cache created"
        );

        Ok(Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            remote_prefix: config.cache_key_prefix(&name),
            name,
            time_to_live: config.time_to_live,
            allow_null_values: config.allow_null_values,
            topic: config.topic.clone(),
            local,
            remote,
            breaker,
            locks: KeyLockRegistry::new(),
            cache_lock: RwLock::new(()),
            load_lock: Mutex::new(()),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key under which `key` is stored on the remote tier
    pub fn remote_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.remote_prefix, key)
    }

    /// Prefix shared by every remote key of this cache
    pub fn remote_prefix(&self) -> &str {
        &self.remote_prefix
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Counter snapshot including the local entry count
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.metrics.snapshot(self.local.entry_count())
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Look a key up, local tier first
    ///
    /// A remote hit populates the local tier. Remote failure reads as a miss.
    /// `Some(CacheValue::Null)` is a cached null marker.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheValue> {
        match self.lookup_tiers(key).await {
            Ok(value) => Some(value),
            Err(_) => None,
        }
    }

    /// Local tier, then remote tier; the error side reports why it missed
    async fn lookup_tiers(&self, key: &CacheKey) -> std::result::Result<CacheValue, RemoteLookup> {
        if let Some(value) = self.local.get(key.as_str()).await {
            self.metrics.record_local_hit();
            debug!(cache = %self.name, key = %key, "Local hit");
            return Ok(value);
        }
        self.metrics.record_local_miss();

        match self.lookup_remote(key).await {
            RemoteLookup::Hit(value) => {
                self.local.insert(key.as_str().to_owned(), value.clone()).await;
                Ok(value)
            }
            other => Err(other),
        }
    }

    async fn lookup_remote(&self, key: &CacheKey) -> RemoteLookup {
        let remote_key = self.remote_key(key);
        let frame = match self
            .call_remote("GET", &remote_key, || self.remote.get(&remote_key))
            .await
        {
            Some(frame) => frame,
            None => return RemoteLookup::Unavailable,
        };

        let Some(frame) = frame else {
            self.metrics.record_remote_miss();
            debug!(cache = %self.name, key = %key, "Remote miss");
            return RemoteLookup::Miss;
        };

        match CacheValue::decode(frame) {
            Ok(CacheValue::Null) if !self.allow_null_values => {
                self.metrics.record_remote_miss();
                RemoteLookup::Miss
            }
            Ok(value) => {
                self.metrics.record_remote_hit();
                debug!(cache = %self.name, key = %key, "Remote hit");
                RemoteLookup::Hit(value)
            }
            Err(e) => {
                self.metrics.record_remote_failure();
                warn!(cache = %self.name, key = %key, error = %e, "Undecodable remote value treated as miss");
                RemoteLookup::Unavailable
            }
        }
    }

    /// Look a key up, producing it with `loader` on a miss
    ///
    /// Serialized against other `get` calls on this coordinator. A loader
    /// may itself call `get` on the same coordinator from the same task; the
    /// nested call runs under the lock already held. The loader runs at most
    /// once. When the remote tier is unreachable the loaded value is kept
    /// locally only. A loader failure is the one error that reaches the
    /// caller.
    pub async fn get<F>(&self, key: &CacheKey, loader: F) -> Result<Option<Bytes>>
    where
        F: Future<Output = anyhow::Result<Option<Bytes>>> + Send,
    {
        let nested = LOADING
            .try_with(|held| held.contains(&self.id))
            .unwrap_or(false);
        if nested {
            trace!(cache = %self.name, key = %key, "Nested get under the held load lock");
            return self.load(key, loader).await;
        }

        let _serial = self.load_lock.lock().await;
        let mut held = LOADING.try_with(|held| held.clone()).unwrap_or_default();
        held.push(self.id);
        LOADING.scope(held, self.load(key, loader)).await
    }

    /// Lookup then load; caller holds the load lock
    async fn load<F>(&self, key: &CacheKey, loader: F) -> Result<Option<Bytes>>
    where
        F: Future<Output = anyhow::Result<Option<Bytes>>> + Send,
    {
        let remote_reachable = match self.lookup_tiers(key).await {
            Ok(value) => return Ok(value.into_option()),
            Err(RemoteLookup::Unavailable) => false,
            Err(_) => true,
        };

        self.metrics.record_load();
        let loaded = match loader.await {
            Ok(loaded) => loaded,
            Err(source) => {
                self.metrics.record_load_failure();
                warn!(cache = %self.name, key = %key, error = %source, "Value loader failed");
                return Err(Error::ValueRetrieval {
                    cache: self.name.clone(),
                    key: key.to_string(),
                    source,
                });
            }
        };

        if loaded.is_none() && !self.allow_null_values {
            debug!(cache = %self.name, key = %key, "Loader produced no value, nothing cached");
            return Ok(None);
        }
        let value = CacheValue::from_option(loaded);

        if remote_reachable {
            self.write_remote(key, &value).await;
        } else {
            debug!(cache = %self.name, key = %key, "Remote unavailable, loaded value kept locally");
        }
        self.local.insert(key.as_str().to_owned(), value.clone()).await;

        Ok(value.into_option())
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Store a value on both tiers; `None` evicts the key instead
    pub async fn put(&self, key: &CacheKey, value: Option<Bytes>) {
        let Some(bytes) = value else {
            self.evict(key).await;
            return;
        };

        let value = CacheValue::Value(bytes);
        self.local.insert(key.as_str().to_owned(), value.clone()).await;
        self.metrics.record_put();
        self.write_remote(key, &value).await;
    }

    /// Store a value unless the key already maps to one
    ///
    /// Returns the existing value, or `None` if this call established the
    /// value. `None` as input evicts the key and returns `None`. The
    /// check-then-act sequence holds the key's lock.
    pub async fn put_if_absent(&self, key: &CacheKey, value: Option<Bytes>) -> Option<CacheValue> {
        let Some(bytes) = value else {
            self.evict(key).await;
            return None;
        };

        let _cache_guard = self.cache_lock.read().await;
        let _key_guard = self.locks.lock(key.as_str()).await;

        if let Some(existing) = self.lookup(key).await {
            return Some(existing);
        }

        let value = CacheValue::Value(bytes);
        self.local.insert(key.as_str().to_owned(), value.clone()).await;
        self.metrics.record_put();

        let remote_key = self.remote_key(key);
        let frame = value.encode();
        let ttl = Some(self.time_to_live);
        if let Some(false) = self
            .call_remote("SETNX", &remote_key, || {
                self.remote.set_if_absent(&remote_key, frame, ttl)
            })
            .await
        {
            debug!(cache = %self.name, key = %key, "Remote already held a value");
        }

        None
    }

    /// Store a value on the remote tier only
    pub async fn remote_put(&self, key: &CacheKey, value: &CacheValue) {
        self.write_remote(key, value).await;
    }

    /// Read a value from the remote tier only, without populating the local tier
    pub async fn remote_lookup(&self, key: &CacheKey) -> Option<CacheValue> {
        match self.lookup_remote(key).await {
            RemoteLookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    async fn write_remote(&self, key: &CacheKey, value: &CacheValue) {
        let remote_key = self.remote_key(key);
        let frame = value.encode();
        let ttl = Some(self.time_to_live);
        self.call_remote("SET", &remote_key, || self.remote.set(&remote_key, frame, ttl))
            .await;
    }

    // =========================================================================
    // Eviction Path
    // =========================================================================

    /// Evict a key on both tiers and tell peers to drop it
    pub async fn evict(&self, key: &CacheKey) {
        let local_key = self.local_evict(key).await;
        self.broadcast(CacheEvictMessage::evict(&self.name, local_key))
            .await;
    }

    /// Evict a key on both tiers without broadcasting
    ///
    /// Returns the canonical key. Used by the invalidation listener.
    pub async fn local_evict(&self, key: &CacheKey) -> String {
        self.local.invalidate(key.as_str()).await;
        self.metrics.record_eviction();

        let remote_key = self.remote_key(key);
        self.call_remote("DEL", &remote_key, || self.remote.delete(&remote_key))
            .await;

        key.as_str().to_owned()
    }

    /// Evict a key, reporting whether a local mapping existed
    ///
    /// Broadcasts even when nothing was mapped locally, so peers converge.
    pub async fn evict_if_present(&self, key: &CacheKey) -> bool {
        let _cache_guard = self.cache_lock.read().await;
        let _key_guard = self.locks.lock(key.as_str()).await;

        let had_mapping = self.local.contains(key.as_str());
        let local_key = self.local_evict(key).await;
        self.broadcast(CacheEvictMessage::evict(&self.name, local_key))
            .await;

        had_mapping
    }

    /// Drop every entry on both tiers and tell peers to do the same
    pub async fn clear(&self) {
        self.local_clear().await;
        self.broadcast(CacheEvictMessage::clear(&self.name)).await;
    }

    /// Drop every entry on both tiers without broadcasting
    pub async fn local_clear(&self) {
        self.local.invalidate_all().await;
        self.metrics.record_clear();

        let prefix = self.remote_prefix.as_str();
        if let Some(removed) = self
            .call_remote("CLEAR", prefix, || self.remote.clear_by_prefix(prefix))
            .await
        {
            debug!(cache = %self.name, removed = removed, "Remote entries cleared");
        }
    }

    /// Clear both tiers under the cache-wide lock
    ///
    /// Returns whether any local entry existed beforehand.
    pub async fn invalidate(&self) -> bool {
        let _cache_guard = self.cache_lock.write().await;

        let had_entries = self.local.has_entries();
        self.local_clear().await;
        self.broadcast(CacheEvictMessage::clear(&self.name)).await;

        had_entries
    }

    /// Apply a received invalidation; never broadcasts
    pub(crate) async fn apply_invalidation(&self, message: &CacheEvictMessage) {
        match message.scope() {
            EvictScope::Entry(key) => {
                self.local_evict(&CacheKey::from(key)).await;
            }
            EvictScope::WholeCache => self.local_clear().await,
        }
        self.metrics.record_invalidation_applied();
    }

    // =========================================================================
    // Remote Plumbing
    // =========================================================================

    /// Publish an invalidation message through the breaker
    async fn broadcast(&self, message: CacheEvictMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(cache = %self.name, error = %e, "Invalidation message could not be encoded");
                return;
            }
        };

        let topic = self.topic.as_str();
        if self
            .call_remote("PUBLISH", topic, || self.remote.publish(topic, payload))
            .await
            .is_some()
        {
            self.metrics.record_broadcast();
            trace!(cache = %self.name, message = %message, "Invalidation broadcast");
        }
    }

    /// Run one remote call through the breaker
    ///
    /// `None` means the call failed, timed out, or was not permitted.
    async fn call_remote<T, F, Fut>(&self, operation: &'static str, target: &str, call: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.breaker.call(call).await {
            Ok(value) => Some(value),
            Err(err) => {
                self.metrics.record_remote_failure();
                match Error::from(err) {
                    Error::CircuitOpen { .. } => debug!(
                        cache = %self.name,
                        operation = operation,
                        target = %target,
                        "Remote call skipped, circuit breaker open"
                    ),
                    Error::RemoteTimeout { after, .. } => warn!(
                        cache = %self.name,
                        operation = operation,
                        target = %target,
                        timeout_ms = after.as_millis() as u64,
                        "Remote call timed out"
                    ),
                    e if e.is_transient() => warn!(
                        cache = %self.name,
                        operation = operation,
                        target = %target,
                        error = %e,
                        "Remote call failed"
                    ),
                    e => error!(
                        cache = %self.name,
                        operation = operation,
                        target = %target,
                        error = %e,
                        "Remote call failed unexpectedly"
                    ),
                }
                None
            }
        }
    }
}

impl std::fmt::Debug for MultiLevelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelCache")
            .field("name", &self.name)
            .field("remote_prefix", &self.remote_prefix)
            .field("topic", &self.topic)
            .field("local", &self.local)
            .field("breaker_state", &self.breaker.state())
            .finish()
    }
}

#[async_trait]
impl Cache for MultiLevelCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheValue> {
        MultiLevelCache::lookup(self, key).await
    }

    async fn get(&self, key: &CacheKey, loader: ValueLoader<'_>) -> Result<Option<Bytes>> {
        MultiLevelCache::get(self, key, loader).await
    }

    async fn put(&self, key: &CacheKey, value: Option<Bytes>) {
        MultiLevelCache::put(self, key, value).await
    }

    async fn put_if_absent(&self, key: &CacheKey, value: Option<Bytes>) -> Option<CacheValue> {
        MultiLevelCache::put_if_absent(self, key, value).await
    }

    async fn evict(&self, key: &CacheKey) {
        MultiLevelCache::evict(self, key).await
    }

    async fn evict_if_present(&self, key: &CacheKey) -> bool {
        MultiLevelCache::evict_if_present(self, key).await
    }

    async fn clear(&self) {
        MultiLevelCache::clear(self).await
    }

    async fn invalidate(&self) -> bool {
        MultiLevelCache::invalidate(self).await
    }
}
