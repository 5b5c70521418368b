//! Multi-Level Cache - Two-Tier Cache Coordinator
//!
//! A fast in-process cache backed by an authoritative shared remote store,
//! kept consistent across processes by publish/subscribe invalidation, with a
//! circuit breaker that degrades to local-only operation when the remote
//! store is unreachable or slow.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                    Process A                 Process B                       │
//! │  ┌─────────────────────────────┐   ┌─────────────────────────────┐          │
//! │  │ MultiLevelCacheManager      │   │ MultiLevelCacheManager      │          │
//! │  │  ├─ MultiLevelCache(orders) │   │  ├─ MultiLevelCache(orders) │          │
//! │  │  │   └─ LocalCache (moka)   │   │  │   └─ LocalCache (moka)   │          │
//! │  │  ├─ CircuitBreaker          │   │  ├─ CircuitBreaker          │          │
//! │  │  └─ InvalidationListener    │   │  └─ InvalidationListener    │          │
//! │  └──────────────┬──────────────┘   └──────────────┬──────────────┘          │
//! │                 │     get/set/del/clear/publish    │                         │
//! │                 └─────────────────┬────────────────┘                         │
//! │                       ┌───────────┴───────────┐                              │
//! │                       │      RemoteStore      │                              │
//! │                       │ (Redis or in-memory)  │                              │
//! │                       │  keys + pub/sub topic │                              │
//! │                       └───────────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: Coordinators, local tier, registry, and invalidation listener
//! - [`remote`]: Remote store capability and adapters
//! - [`resilience`]: Circuit breaker and sliding windows
//! - [`config`]: Configuration types and validation
//! - [`error`]: Error types and handling

pub mod cache;
pub mod config;
pub mod error;
pub mod remote;
pub mod resilience;

// Re-export commonly used types
pub use cache::{
    Cache, CacheEvictMessage, CacheKey, CacheRef, CacheRegistry, CacheStatsSnapshot, CacheValue,
    InvalidationListener, ListenerOutcome, MultiLevelCache, MultiLevelCacheManager, ValueLoader,
};

pub use config::{
    CircuitBreakerConfig, ExpireMode, LocalCacheConfig, MultiLevelCacheConfig, SlidingWindowType,
    DEFAULT_TOPIC,
};

pub use error::{Error, Result};

pub use remote::{InMemoryRemoteStore, RemoteStore, RemoteStoreRef};
#[cfg(feature = "redis")]
pub use remote::{RedisRemoteConfig, RedisRemoteStore};

pub use resilience::{CircuitBreaker, CircuitBreakerError, CircuitBreakerMetrics, CircuitState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
