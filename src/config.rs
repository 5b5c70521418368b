//! Cache Configuration
//!
//! Settings shared by every coordinator a manager creates. All values are
//! fixed once a coordinator is constructed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default pub/sub topic for invalidation messages
pub const DEFAULT_TOPIC: &str = "cache:multilevel:topic";

// =============================================================================
// Local Expiry Mode
// =============================================================================

/// Expiry strategy for local-tier entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpireMode {
    /// Jittered lifetime computed once at creation
    #[default]
    Random,
    /// Fixed lifetime after the last write
    Write,
    /// Fixed lifetime after the last read or write
    Access,
}

impl std::fmt::Display for ExpireMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpireMode::Random => write!(f, "random"),
            ExpireMode::Write => write!(f, "write"),
            ExpireMode::Access => write!(f, "access"),
        }
    }
}

// =============================================================================
// Local Tier Configuration
// =============================================================================

/// Configuration for the in-process tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Maximum number of entries per coordinator
    pub max_size: u64,
    /// Pre-sized capacity
    pub initial_capacity: usize,
    /// Jitter percentage for `ExpireMode::Random`, in `[0, 100)`
    pub expiry_jitter: i32,
    /// Expiry strategy
    pub expire_mode: ExpireMode,
    #[serde(with = "humantime_serde")]
    pub expire_after_write: Duration,
    #[serde(with = "humantime_serde")]
    pub expire_after_access: Duration,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 4000,
            initial_capacity: 1000,
            expiry_jitter: 50,
            expire_mode: ExpireMode::Random,
            expire_after_write: Duration::from_secs(1800),
            expire_after_access: Duration::from_secs(1800),
        }
    }
}

// =============================================================================
// Circuit Breaker Configuration
// =============================================================================

/// How the breaker's sliding window is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowType {
    /// Window holds the last N call outcomes
    #[default]
    CountBased,
    /// Window holds the outcomes of the last N seconds
    TimeBased,
}

/// Tunables for the remote-tier circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent) at or above which the breaker opens
    pub failure_rate_threshold: f32,
    /// Slow call rate (percent) at or above which the breaker opens
    pub slow_call_rate_threshold: f32,
    /// Calls taking at least this long are recorded as slow
    #[serde(with = "humantime_serde")]
    pub slow_call_duration_threshold: Duration,
    pub sliding_window_type: SlidingWindowType,
    /// Number of calls (count based) or seconds (time based)
    pub sliding_window_size: u32,
    /// Rates are only evaluated once this many calls are in the window
    pub minimum_number_of_calls: u32,
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// Zero keeps the breaker half-open until the trial calls complete
    #[serde(with = "humantime_serde")]
    pub max_wait_duration_in_half_open_state: Duration,
    #[serde(with = "humantime_serde")]
    pub wait_duration_in_open_state: Duration,
    /// Hard upper bound on any single remote call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        let slow_call = Duration::from_millis(250);
        let half_open_calls = (Duration::from_secs(5).as_nanos() / slow_call.as_nanos()) as u32;
        let minimum_calls = half_open_calls / 2;

        Self {
            failure_rate_threshold: 25.0,
            slow_call_rate_threshold: 25.0,
            slow_call_duration_threshold: slow_call,
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: half_open_calls * 2,
            minimum_number_of_calls: minimum_calls,
            permitted_number_of_calls_in_half_open_state: half_open_calls,
            max_wait_duration_in_half_open_state: slow_call * half_open_calls,
            wait_duration_in_open_state: slow_call * minimum_calls,
            call_timeout: slow_call * 4,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate breaker tunables
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("failure_rate_threshold", self.failure_rate_threshold),
            ("slow_call_rate_threshold", self.slow_call_rate_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(Error::Configuration(format!(
                    "{} must be in (0, 100], got {}",
                    name, value
                )));
            }
        }
        if self.sliding_window_size == 0 {
            return Err(Error::Configuration(
                "sliding_window_size must be at least 1".into(),
            ));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(Error::Configuration(
                "minimum_number_of_calls must be at least 1".into(),
            ));
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(Error::Configuration(
                "permitted_number_of_calls_in_half_open_state must be at least 1".into(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Configuration("call_timeout must not be zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// Configuration shared by all coordinators of a manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiLevelCacheConfig {
    /// Remote entry TTL and base of the jittered local lifetime
    #[serde(with = "humantime_serde")]
    pub time_to_live: Duration,
    pub key_prefix: Option<String>,
    pub use_key_prefix: bool,
    /// Cache a null marker when a loader produces no value
    pub allow_null_values: bool,
    /// Pub/sub topic for invalidation messages
    pub topic: String,
    /// Allow-list of cache names; empty means unrestricted
    pub cache_names: Vec<String>,
    pub local: LocalCacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for MultiLevelCacheConfig {
    fn default() -> Self {
        Self {
            time_to_live: Duration::from_secs(3600),
            key_prefix: None,
            use_key_prefix: false,
            allow_null_values: true,
            topic: DEFAULT_TOPIC.to_string(),
            cache_names: Vec::new(),
            local: LocalCacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl MultiLevelCacheConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        if self.time_to_live.is_zero() {
            return Err(Error::Configuration(
                "time_to_live must be strictly positive".into(),
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(Error::Configuration("topic must not be empty".into()));
        }
        if self.use_key_prefix && self.key_prefix.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Configuration(
                "use_key_prefix requires a non-empty key_prefix".into(),
            ));
        }
        if self.local.max_size == 0 {
            return Err(Error::Configuration("local.max_size must be at least 1".into()));
        }
        if self.local.expire_mode == ExpireMode::Random
            && !(0..100).contains(&self.local.expiry_jitter)
        {
            return Err(Error::Configuration(format!(
                "local.expiry_jitter must be in [0, 100), got {}",
                self.local.expiry_jitter
            )));
        }
        self.circuit_breaker.validate()
    }

    /// Remote key prefix for a named cache: `[key_prefix]<name>::`
    pub fn cache_key_prefix(&self, cache_name: &str) -> String {
        match (&self.key_prefix, self.use_key_prefix) {
            (Some(prefix), true) => format!("{}{}::", prefix, cache_name),
            _ => format!("{}::", cache_name),
        }
    }

    /// Shortest lifetime a jittered local entry can have
    pub fn min_local_lifetime(&self) -> Duration {
        let jitter = self.local.expiry_jitter.clamp(0, 99) as u32;
        self.time_to_live * (100 - jitter) / 200
    }

    /// Warn when the breaker may stay open longer than local entries live
    ///
    /// While the breaker is open the local tier is the only source of data,
    /// so entries expiring in that window turn into loader calls.
    pub fn check_open_state_duration(&self) -> bool {
        let open_for = self.circuit_breaker.wait_duration_in_open_state;
        let recommended = self.min_local_lifetime();
        if self.local.expire_mode == ExpireMode::Random && open_for > recommended {
            warn!(
                wait_in_open = ?open_for,
                recommended_max = ?recommended,
                "Circuit breaker wait duration in open state exceeds the shortest local entry \
                 lifetime; local entries may expire while the breaker is still open"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_slow_call_threshold() {
        let cb = CircuitBreakerConfig::default();
        assert_eq!(cb.permitted_number_of_calls_in_half_open_state, 20);
        assert_eq!(cb.sliding_window_size, 40);
        assert_eq!(cb.minimum_number_of_calls, 10);
        assert_eq!(cb.wait_duration_in_open_state, Duration::from_millis(2500));
        assert_eq!(cb.max_wait_duration_in_half_open_state, Duration::from_secs(5));
        assert!(cb.validate().is_ok());

        let config = MultiLevelCacheConfig::default();
        assert_eq!(config.topic, DEFAULT_TOPIC);
        assert_eq!(config.local.max_size, 4000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_key_prefix() {
        let mut config = MultiLevelCacheConfig::default();
        assert_eq!(config.cache_key_prefix("orders"), "orders::");

        config.key_prefix = Some("app:".into());
        assert_eq!(config.cache_key_prefix("orders"), "orders::");

        config.use_key_prefix = true;
        assert_eq!(config.cache_key_prefix("orders"), "app:orders::");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = MultiLevelCacheConfig::default();
        config.time_to_live = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = MultiLevelCacheConfig::default();
        config.local.expiry_jitter = 100;
        assert!(config.validate().is_err());

        let mut config = MultiLevelCacheConfig::default();
        config.local.expiry_jitter = 100;
        config.local.expire_mode = ExpireMode::Write;
        assert!(config.validate().is_ok());

        let mut config = MultiLevelCacheConfig::default();
        config.use_key_prefix = true;
        assert!(config.validate().is_err());

        let mut config = MultiLevelCacheConfig::default();
        config.circuit_breaker.failure_rate_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
time_to_live: 10m
allow_null_values: false
cache_names: [orders, users]
local:
  max_size: 10
  expire_mode: write
  expire_after_write: 30s
circuit_breaker:
  sliding_window_type: time_based
  slow_call_duration_threshold: 100ms
"#;
        let config = MultiLevelCacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.time_to_live, Duration::from_secs(600));
        assert!(!config.allow_null_values);
        assert_eq!(config.cache_names, vec!["orders", "users"]);
        assert_eq!(config.local.expire_mode, ExpireMode::Write);
        assert_eq!(config.local.expire_after_write, Duration::from_secs(30));
        assert_eq!(config.local.initial_capacity, 1000);
        assert_eq!(
            config.circuit_breaker.sliding_window_type,
            SlidingWindowType::TimeBased
        );
        assert_eq!(
            config.circuit_breaker.slow_call_duration_threshold,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.yaml");
        std::fs::write(&path, "topic: custom:topic\n").unwrap();

        let config = MultiLevelCacheConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.topic, "custom:topic");
    }

    #[test]
    fn test_open_state_duration_check() {
        let mut config = MultiLevelCacheConfig::default();
        assert!(config.check_open_state_duration());

        config.time_to_live = Duration::from_secs(2);
        config.local.expiry_jitter = 50;
        // shortest local lifetime is 0.5s, breaker stays open 2.5s
        assert_eq!(config.min_local_lifetime(), Duration::from_millis(500));
        assert!(!config.check_open_state_duration());
    }
}
