//! Cache Metrics
//!
//! Per-coordinator counters, cache-line aligned so hot counters touched by
//! many tasks do not false-share.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Tier Counters (Cache-Line Aligned)
// =============================================================================

/// Hit/miss counters for one tier
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct TierCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    /// Calls that failed or were rejected by the breaker (remote tier only)
    pub failures: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<TierCounters>() <= CACHE_LINE_SIZE);

impl TierCounters {
    #[inline]
    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    pub fn snapshot(&self) -> TierStatsSnapshot {
        TierStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of one tier's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

impl TierStatsSnapshot {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Coordinator Metrics
// =============================================================================

/// All counters of one coordinator
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub local: TierCounters,
    pub remote: TierCounters,
    pub loads: AtomicU64,
    pub load_failures: AtomicU64,
    pub puts: AtomicU64,
    pub evictions: AtomicU64,
    pub clears: AtomicU64,
    pub broadcasts: AtomicU64,
    pub invalidations_applied: AtomicU64,
    pub expirations: AtomicU64,
    pub capacity_evictions: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_local_hit(&self) {
        self.local.bump(&self.local.hits);
    }

    #[inline]
    pub fn record_local_miss(&self) {
        self.local.bump(&self.local.misses);
    }

    #[inline]
    pub fn record_remote_hit(&self) {
        self.remote.bump(&self.remote.hits);
    }

    #[inline]
    pub fn record_remote_miss(&self) {
        self.remote.bump(&self.remote.misses);
    }

    #[inline]
    pub fn record_remote_failure(&self) {
        self.remote.bump(&self.remote.failures);
    }

    #[inline]
    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalidation_applied(&self) {
        self.invalidations_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_capacity_eviction(&self) {
        self.capacity_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot of all counters
    pub fn snapshot(&self, entry_count: u64) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            local: self.local.snapshot(),
            remote: self.remote.snapshot(),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            invalidations_applied: self.invalidations_applied.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            capacity_evictions: self.capacity_evictions.load(Ordering::Relaxed),
            local_entry_count: entry_count,
        }
    }
}

/// Point-in-time statistics of one coordinator
#[derive(Debug, Clone, Default)]
pub struct CacheStatsSnapshot {
    pub local: TierStatsSnapshot,
    pub remote: TierStatsSnapshot,
    pub loads: u64,
    pub load_failures: u64,
    pub puts: u64,
    pub evictions: u64,
    pub clears: u64,
    pub broadcasts: u64,
    pub invalidations_applied: u64,
    pub expirations: u64,
    pub capacity_evictions: u64,
    pub local_entry_count: u64,
}

impl CacheStatsSnapshot {
    /// Hit ratio across both tiers: a lookup misses only if both tiers missed
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.local.hits + self.remote.hits;
        let total = self.local.hits + self.local.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(std::mem::align_of::<TierCounters>(), CACHE_LINE_SIZE);
        assert!(std::mem::size_of::<TierCounters>() <= CACHE_LINE_SIZE);
    }

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = CacheMetrics::new();

        metrics.record_local_hit();
        metrics.record_local_hit();
        metrics.record_local_miss();
        metrics.record_remote_hit();
        metrics.record_remote_failure();
        metrics.record_broadcast();

        let snapshot = metrics.snapshot(7);
        assert_eq!(snapshot.local.hits, 2);
        assert_eq!(snapshot.local.misses, 1);
        assert_eq!(snapshot.remote.hits, 1);
        assert_eq!(snapshot.remote.failures, 1);
        assert_eq!(snapshot.broadcasts, 1);
        assert_eq!(snapshot.local_entry_count, 7);
        assert!((snapshot.local.hit_ratio() - 0.666).abs() < 0.01);
        // two local hits plus one remote hit out of three lookups
        assert!((snapshot.hit_ratio() - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_empty_ratios() {
        let snapshot = CacheMetrics::new().snapshot(0);
        assert_eq!(snapshot.hit_ratio(), 0.0);
        assert_eq!(snapshot.local.hit_ratio(), 0.0);
    }
}
