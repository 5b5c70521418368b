//! Invalidation Listener
//!
//! Consumes eviction broadcasts and applies them to this process's
//! coordinators. Applying a message only ever touches local state and the
//! remote tier; it never publishes, so messages cannot bounce between
//! processes.

use crate::cache::events::CacheEvictMessage;
use crate::cache::manager::MultiLevelCacheManager;
use crate::remote::RemoteStoreRef;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why a received message was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    Malformed(String),
    EmptyCacheName,
    UnknownCache(String),
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoreReason::Malformed(reason) => write!(f, "malformed payload: {}", reason),
            IgnoreReason::EmptyCacheName => write!(f, "empty cache name"),
            IgnoreReason::UnknownCache(name) => write!(f, "unknown cache '{}'", name),
        }
    }
}

/// What handling one message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    Evicted { cache: String, key: String },
    Cleared { cache: String },
    Ignored(IgnoreReason),
}

/// Applies invalidation messages to a registry
#[derive(Debug, Clone)]
pub struct InvalidationListener {
    manager: Arc<MultiLevelCacheManager>,
    subscriptions: Arc<AtomicU64>,
}

impl InvalidationListener {
    pub fn new(manager: Arc<MultiLevelCacheManager>) -> Self {
        Self {
            manager,
            subscriptions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of successful subscriptions made by spawned loops
    pub fn subscription_count(&self) -> u64 {
        self.subscriptions.load(Ordering::Acquire)
    }

    /// Apply one received payload
    pub async fn handle(&self, payload: &[u8]) -> ListenerOutcome {
        let message = match CacheEvictMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, bytes = payload.len(), "Dropping malformed invalidation message");
                return ListenerOutcome::Ignored(IgnoreReason::Malformed(e.to_string()));
            }
        };
        trace!(message = %message, "Invalidation message received");

        if message.cache_name.is_empty() {
            return ListenerOutcome::Ignored(IgnoreReason::EmptyCacheName);
        }
        let Some(cache) = self.manager.existing_cache(&message.cache_name) else {
            debug!(cache = %message.cache_name, "Invalidation for a cache not present here");
            return ListenerOutcome::Ignored(IgnoreReason::UnknownCache(message.cache_name));
        };

        cache.apply_invalidation(&message).await;
        match message.entry_key {
            Some(key) => ListenerOutcome::Evicted {
                cache: message.cache_name,
                key,
            },
            None => ListenerOutcome::Cleared {
                cache: message.cache_name,
            },
        }
    }

    /// Run the subscribe loop on a background task
    ///
    /// Re-subscribes with exponential backoff whenever subscribing fails or
    /// the stream ends. Returns once `shutdown` is cancelled.
    pub fn spawn(
        &self,
        remote: RemoteStoreRef,
        topic: impl Into<String>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let listener = self.clone();
        let topic = topic.into();
        tokio::spawn(async move { listener.run(remote, topic, shutdown).await })
    }

    async fn run(self, remote: RemoteStoreRef, topic: String, shutdown: CancellationToken) {
        let mut backoff = ExponentialBackoff {
            current_interval: Duration::from_millis(100),
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            let subscription = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = remote.subscribe(&topic) => result,
            };

            match subscription {
                Ok(mut stream) => {
                    self.subscriptions.fetch_add(1, Ordering::AcqRel);
                    info!(topic = %topic, "Invalidation listener subscribed");
                    backoff.reset();

                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!(topic = %topic, "Invalidation listener stopped");
                                return;
                            }
                            next = stream.next() => match next {
                                Some(payload) => {
                                    self.handle(&payload).await;
                                }
                                None => {
                                    warn!(topic = %topic, "Invalidation subscription ended");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => warn!(topic = %topic, error = %e, "Invalidation subscription failed"),
            }

            let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
            warn!(topic = %topic, delay_ms = delay.as_millis() as u64, "Re-subscribing to invalidation topic");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(topic = %topic, "Invalidation listener stopped");
    }
}
