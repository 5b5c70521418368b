//! Randomized Local Expiry
//!
//! Staggers local-tier lifetimes so entries created together do not all
//! expire together. The lifetime is drawn once, at creation:
//!
//! ```text
//! expiry = (ttl / 2) * (1 + sign * (jitter / 100) * U)    sign ∈ {-1, +1}, U ∈ [0, 1)
//! ```
//!
//! Reads and updates keep the remaining duration unchanged.

use crate::cache::entry::CacheValue;
use crate::error::{Error, Result};
use moka::Expiry;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tracing::trace;

/// Expiry policy computing a jittered lifetime at creation time
#[derive(Debug)]
pub struct RandomizedExpiry {
    time_to_live: Duration,
    /// Jitter as a fraction in `[0, 1)`
    jitter: f64,
    rng: Mutex<StdRng>,
}

impl RandomizedExpiry {
    /// Create a policy, validating `time_to_live > 0` and `jitter ∈ [0, 100)`
    pub fn new(time_to_live: Duration, expiry_jitter: i32) -> Result<Self> {
        Self::with_rng(time_to_live, expiry_jitter, StdRng::from_entropy())
    }

    /// Create a policy with a caller-supplied random source
    pub fn with_rng(time_to_live: Duration, expiry_jitter: i32, rng: StdRng) -> Result<Self> {
        if time_to_live.is_zero() {
            return Err(Error::InvalidExpiry(
                "time to live duration must not be zero".into(),
            ));
        }
        if expiry_jitter < 0 {
            return Err(Error::InvalidExpiry(format!(
                "expiry jitter must not be negative, got {}",
                expiry_jitter
            )));
        }
        if expiry_jitter >= 100 {
            return Err(Error::InvalidExpiry(format!(
                "expiry jitter must be below 100 percent, got {}",
                expiry_jitter
            )));
        }

        Ok(Self {
            time_to_live,
            jitter: f64::from(expiry_jitter) / 100.0,
            rng: Mutex::new(rng),
        })
    }

    /// Draw a fresh jittered lifetime
    pub fn sample(&self) -> Duration {
        let (sign, draw) = {
            let mut rng = self.rng.lock();
            let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            (sign, rng.gen::<f64>())
        };
        let factor = 1.0 + sign * self.jitter * draw;
        self.time_to_live.mul_f64(factor / 2.0)
    }

    /// Inclusive bounds every sampled lifetime falls within
    pub fn bounds(&self) -> (Duration, Duration) {
        (
            self.time_to_live.mul_f64((1.0 - self.jitter) / 2.0),
            self.time_to_live.mul_f64((1.0 + self.jitter) / 2.0),
        )
    }

    /// Base time to live
    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }
}

impl Expiry<String, CacheValue> for RandomizedExpiry {
    fn expire_after_create(
        &self,
        key: &String,
        _value: &CacheValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        let expiry = self.sample();
        trace!(key = %key, expiry = ?expiry, "Local entry expiry computed");
        Some(expiry)
    }

    fn expire_after_read(
        &self,
        _key: &String,
        _value: &CacheValue,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        duration_until_expiry
    }

    fn expire_after_update(
        &self,
        _key: &String,
        _value: &CacheValue,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        duration_until_expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rejects_invalid_policy() {
        assert!(matches!(
            RandomizedExpiry::new(Duration::ZERO, 50),
            Err(Error::InvalidExpiry(_))
        ));
        assert!(RandomizedExpiry::new(Duration::from_secs(1), -1).is_err());
        assert!(RandomizedExpiry::new(Duration::from_secs(1), 100).is_err());
        assert!(RandomizedExpiry::new(Duration::from_secs(1), 200).is_err());
        assert!(RandomizedExpiry::new(Duration::from_secs(1), 0).is_ok());
        assert!(RandomizedExpiry::new(Duration::from_secs(1), 99).is_ok());
    }

    #[test]
    fn test_zero_jitter_is_half_ttl() {
        let expiry = RandomizedExpiry::new(Duration::from_secs(10), 0).unwrap();
        for _ in 0..100 {
            assert_eq!(expiry.sample(), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_samples_cover_both_sides() {
        let ttl = Duration::from_secs(100);
        let expiry = RandomizedExpiry::with_rng(ttl, 50, StdRng::seed_from_u64(7)).unwrap();
        let half = ttl / 2;
        let (low, high) = expiry.bounds();
        assert_eq!(low, Duration::from_secs(25));
        assert_eq!(high, Duration::from_secs(75));

        let samples: Vec<Duration> = (0..2000).map(|_| expiry.sample()).collect();
        assert!(samples.iter().all(|d| *d >= low && *d <= high));
        assert!(samples.iter().any(|d| *d < half - Duration::from_secs(15)));
        assert!(samples.iter().any(|d| *d > half + Duration::from_secs(15)));
    }

    #[test]
    fn test_read_and_update_keep_remaining_duration() {
        let expiry = RandomizedExpiry::new(Duration::from_secs(60), 50).unwrap();
        let key = "k".to_string();
        let value = CacheValue::Null;
        let now = Instant::now();
        let remaining = Some(Duration::from_millis(1234));

        assert_eq!(
            expiry.expire_after_read(&key, &value, now, remaining, now),
            remaining
        );
        assert_eq!(
            expiry.expire_after_update(&key, &value, now, remaining),
            remaining
        );
        assert_eq!(expiry.expire_after_update(&key, &value, now, None), None);
    }

    proptest! {
        #[test]
        fn prop_created_expiry_within_jitter_range(
            ttl_ms in 1u64..10_000_000,
            jitter in 0i32..100,
            seed in any::<u64>(),
        ) {
            let ttl = Duration::from_millis(ttl_ms);
            let expiry = RandomizedExpiry::with_rng(ttl, jitter, StdRng::seed_from_u64(seed)).unwrap();
            let (low, high) = expiry.bounds();
            let key = "key".to_string();
            for _ in 0..32 {
                let created = expiry
                    .expire_after_create(&key, &CacheValue::Null, Instant::now())
                    .unwrap();
                // allow one nanosecond of float rounding at the edges
                prop_assert!(created + Duration::from_nanos(1) >= low);
                prop_assert!(created <= high + Duration::from_nanos(1));
            }
        }
    }
}
