//! In-Memory Remote Store
//!
//! Process-local stand-in for the shared remote tier, backed by DashMap with
//! one tokio broadcast channel per topic. Several registries sharing one
//! instance behave like several processes sharing one remote store.

use crate::error::{Error, Result};
use crate::remote::RemoteStore;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Buffered messages per topic before slow subscribers start lagging
const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

/// In-memory remote tier
#[derive(Debug)]
pub struct InMemoryRemoteStore {
    entries: DashMap<String, StoredValue>,
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    available: AtomicBool,
    published: AtomicU64,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            topics: DashMap::new(),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Create a shared handle
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: while unavailable every call fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Number of messages published so far, across all topics
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a value directly, bypassing the availability switch
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.data.clone())
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::remote(operation, "remote store unavailable"))
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available("GET")?;
        // Expired entries are dropped lazily on read
        let removed = self.entries.remove_if(key, |_, v| v.is_expired()).is_some();
        if removed {
            trace!(key = %key, "Remote entry expired");
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|e| e.data.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.check_available("SET")?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool> {
        self.check_available("SETNX")?;
        let mut stored = false;
        self.entries
            .entry(key.to_string())
            .and_modify(|existing| {
                if existing.is_expired() {
                    *existing = StoredValue::new(value.clone(), ttl);
                    stored = true;
                }
            })
            .or_insert_with(|| {
                stored = true;
                StoredValue::new(value.clone(), ttl)
            });
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available("DEL")?;
        self.entries.remove(key);
        Ok(())
    }

    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64> {
        self.check_available("CLEAR")?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.check_available("PUBLISH")?;
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error
        let receivers = self.sender(topic).send(payload).unwrap_or(0);
        trace!(topic = %topic, receivers = receivers, "Message published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>> {
        self.check_available("SUBSCRIBE")?;
        let receiver = self.sender(topic).subscribe();
        let topic = topic.to_string();

        let stream = stream::unfold(receiver, move |mut receiver| {
            let topic = topic.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped = skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
