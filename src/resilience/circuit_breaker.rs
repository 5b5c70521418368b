//! # Circuit Breaker
//!
//! Guards every remote-tier call. Three states:
//!
//! - `Closed`: calls pass; outcomes feed a sliding window. Once the window
//!   holds at least `minimum_number_of_calls`, a failure rate or slow call
//!   rate at or above its threshold opens the breaker.
//! - `Open`: calls are rejected without executing. The first call attempt
//!   after `wait_duration_in_open_state` moves the breaker to half-open.
//! - `HalfOpen`: up to `permitted_number_of_calls_in_half_open_state` trial
//!   calls pass. Any failed trial reopens the breaker; once every trial has
//!   completed it closes, unless the trials' slow call rate reached the
//!   threshold. With a non-zero `max_wait_duration_in_half_open_state` the
//!   breaker reopens if the trials take longer than that. A trial whose
//!   caller drops it before it completes also reopens the breaker.
//!
//! Every call runs under `call_timeout`; a timeout counts as a failure.

use crate::config::CircuitBreakerConfig;
use crate::resilience::window::{CallOutcome, SlidingWindow, WindowCounts};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - limited calls allowed to test remote health
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Errors returned by [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Breaker is open (or out of half-open permits); the call did not run
    #[error("Circuit breaker '{name}' does not permit further calls")]
    CallNotPermitted { name: String },

    /// Call exceeded the configured timeout and was abandoned
    #[error("Call through circuit breaker '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    /// Call ran and failed
    #[error("Operation failed: {0}")]
    Failed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, CircuitBreakerError::CallNotPermitted { .. })
    }
}

/// Snapshot of breaker counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    pub timed_out_calls: u64,
    pub not_permitted_calls: u64,
    pub state_transitions: u64,
    /// Calls currently in the sliding window
    pub buffered_calls: u32,
    /// Window failure rate in percent, once the minimum number of calls is reached
    pub failure_rate: Option<f32>,
    /// Window slow call rate in percent, once the minimum number of calls is reached
    pub slow_call_rate: Option<f32>,
}

#[derive(Debug, Default)]
struct AtomicBreakerCounters {
    successful: AtomicU64,
    failed: AtomicU64,
    slow: AtomicU64,
    timed_out: AtomicU64,
    not_permitted: AtomicU64,
    transitions: AtomicU64,
}

/// Mutable breaker state, guarded by one lock so transitions are atomic
#[derive(Debug)]
struct BreakerInner {
    window: SlidingWindow,
    /// Bumped on every transition; outcomes from an older generation only
    /// update counters
    generation: u64,
    opened_at: Option<Instant>,
    half_open_since: Option<Instant>,
    half_open_permits: u32,
    half_open_counts: WindowCounts,
}

/// Admission ticket for one call
///
/// Dropping it unsettled (the call future was cancelled mid-flight) reports
/// the call as abandoned, so a half-open trial slot is never leaked.
#[derive(Debug)]
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, elapsed: Duration, failed: bool) {
        self.settled = true;
        self.breaker.on_result(self.generation, elapsed, failed);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.generation);
        }
    }
}

/// Resilience4j-style circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    /// Mirrors the state held in `inner` for lock-free reads
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
    counters: AtomicBreakerCounters,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_rate_threshold = config.failure_rate_threshold,
            slow_call_rate_threshold = config.slow_call_rate_threshold,
            sliding_window_size = config.sliding_window_size,
            wait_in_open_ms = config.wait_duration_in_open_state.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            inner: Mutex::new(BreakerInner {
                window: SlidingWindow::new(config.sliding_window_type, config.sliding_window_size),
                generation: 0,
                opened_at: None,
                half_open_since: None,
                half_open_permits: 0,
                half_open_counts: WindowCounts::default(),
            }),
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            counters: AtomicBreakerCounters::default(),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection and the call timeout
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.try_acquire() {
            Some(permit) => permit,
            None => {
                self.counters.not_permitted.fetch_add(1, Ordering::Relaxed);
                return Err(CircuitBreakerError::CallNotPermitted {
                    name: self.name.clone(),
                });
            }
        };

        let timeout = self.config.call_timeout;
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, operation()).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(value)) => {
                permit.settle(elapsed, false);
                Ok(value)
            }
            Ok(Err(err)) => {
                permit.settle(elapsed, true);
                Err(CircuitBreakerError::Failed(err))
            }
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                permit.settle(elapsed, true);
                Err(CircuitBreakerError::Timeout {
                    name: self.name.clone(),
                    after: timeout,
                })
            }
        }
    }

    /// Decide whether a call may run, performing time-driven transitions
    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.inner.lock();
        match self.state() {
            CircuitState::Closed => Some(self.permit(inner.generation)),
            CircuitState::Open => {
                let waited = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.wait_duration_in_open_state);
                if !waited {
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.half_open_permits = 1;
                Some(self.permit(inner.generation))
            }
            CircuitState::HalfOpen => {
                let max_wait = self.config.max_wait_duration_in_half_open_state;
                let overdue = !max_wait.is_zero()
                    && inner.half_open_since.map_or(false, |at| at.elapsed() >= max_wait);
                if overdue {
                    debug!(component = %self.name, "Half-open trials took too long");
                    self.transition(&mut inner, CircuitState::Open);
                    return None;
                }
                if inner.half_open_permits
                    < self.config.permitted_number_of_calls_in_half_open_state
                {
                    inner.half_open_permits += 1;
                    Some(self.permit(inner.generation))
                } else {
                    None
                }
            }
        }
    }

    fn permit(&self, generation: u64) -> Permit<'_> {
        Permit {
            breaker: self,
            generation,
            settled: false,
        }
    }

    /// Record the outcome of an admitted call
    fn on_result(&self, generation: u64, elapsed: Duration, failed: bool) {
        let slow = elapsed >= self.config.slow_call_duration_threshold;
        if failed {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.successful.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.counters.slow.fetch_add(1, Ordering::Relaxed);
        }

        let outcome = CallOutcome { failed, slow };
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            return;
        }

        match self.state() {
            CircuitState::Closed => {
                let counts = inner.window.record(outcome);
                if self.exceeds_thresholds(&counts) {
                    warn!(
                        component = %self.name,
                        failure_rate = counts.failure_rate(),
                        slow_call_rate = counts.slow_call_rate(),
                        buffered_calls = counts.calls,
                        "Remote call thresholds exceeded"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_counts.add(outcome);
                let counts = inner.half_open_counts;
                if failed {
                    self.transition(&mut inner, CircuitState::Open);
                } else if counts.calls >= self.config.permitted_number_of_calls_in_half_open_state {
                    if counts.slow_call_rate() >= self.config.slow_call_rate_threshold {
                        self.transition(&mut inner, CircuitState::Open);
                    } else {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    /// An admitted call was dropped before it completed
    ///
    /// A cancelled half-open trial can no longer vouch for recovery, so the
    /// breaker reopens and waits out `wait_duration_in_open_state` again. In
    /// the closed state nothing is recorded.
    fn on_abandoned(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation != inner.generation || self.state() != CircuitState::HalfOpen {
            return;
        }
        debug!(component = %self.name, "Half-open trial call abandoned");
        self.transition(&mut inner, CircuitState::Open);
    }

    fn exceeds_thresholds(&self, counts: &WindowCounts) -> bool {
        counts.calls >= self.config.minimum_number_of_calls
            && (counts.failure_rate() >= self.config.failure_rate_threshold
                || counts.slow_call_rate() >= self.config.slow_call_rate_threshold)
    }

    /// Move to `to`, resetting the per-state bookkeeping. Caller holds the lock.
    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = self.state();
        inner.generation += 1;
        inner.half_open_permits = 0;
        inner.half_open_counts = WindowCounts::default();

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.half_open_since = None;
            }
            CircuitState::HalfOpen => {
                inner.half_open_since = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.half_open_since = None;
                inner.window.reset();
            }
        }

        self.state.store(to as u8, Ordering::Release);
        self.counters.transitions.fetch_add(1, Ordering::Relaxed);

        match to {
            CircuitState::Open => warn!(
                component = %self.name,
                from = %from,
                to = %to,
                wait_in_open_ms = self.config.wait_duration_in_open_state.as_millis() as u64,
                "Circuit breaker opened (remote calls skipped)"
            ),
            _ => info!(component = %self.name, from = %from, to = %to, "Circuit breaker state transition"),
        }
    }

    /// Force circuit to open state
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Force circuit to closed state
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let counts = self.inner.lock().window.counts();
        let evaluated = counts.calls >= self.config.minimum_number_of_calls;

        CircuitBreakerMetrics {
            state: self.state(),
            successful_calls: self.counters.successful.load(Ordering::Relaxed),
            failed_calls: self.counters.failed.load(Ordering::Relaxed),
            slow_calls: self.counters.slow.load(Ordering::Relaxed),
            timed_out_calls: self.counters.timed_out.load(Ordering::Relaxed),
            not_permitted_calls: self.counters.not_permitted.load(Ordering::Relaxed),
            state_transitions: self.counters.transitions.load(Ordering::Relaxed),
            buffered_calls: counts.calls,
            failure_rate: evaluated.then(|| counts.failure_rate()),
            slow_call_rate: evaluated.then(|| counts.slow_call_rate()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlidingWindowType;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(10),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 4,
            minimum_number_of_calls: 4,
            permitted_number_of_calls_in_half_open_state: 2,
            max_wait_duration_in_half_open_state: Duration::ZERO,
            wait_duration_in_open_state: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
        }
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| async { Ok::<_, &'static str>(()) }).await
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| async { Err::<(), _>("boom") }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_only_after_minimum_calls() {
        let cb = CircuitBreaker::new("test", config());

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        // 100% failures but only three calls recorded
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failure_rate, None);

        succeed(&cb).await.unwrap();
        // 3/4 = 75% >= 50%
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_is_inclusive() {
        let cb = CircuitBreaker::new("test", config());
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_running() {
        let cb = CircuitBreaker::new("test", config());
        cb.force_open();

        let mut ran = false;
        let result = cb
            .call(|| {
                ran = true;
                async { Ok::<_, &'static str>(()) }
            })
            .await;
        assert!(!ran);
        assert!(result.unwrap_err().is_not_permitted());
        assert_eq!(cb.metrics().not_permitted_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let cb = CircuitBreaker::new("test", config());
        cb.force_open();

        tokio::time::advance(Duration::from_millis(1100)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", config());
        cb.force_open();

        tokio::time::advance(Duration::from_millis(1100)).await;
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_not_permitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_permits_are_limited() {
        let cb = std::sync::Arc::new(CircuitBreaker::new("test", config()));
        cb.force_open();
        tokio::time::advance(Duration::from_millis(1100)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let blocked = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| async {
                    let _ = rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // second permit
        let second = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| std::future::pending::<Result<(), &'static str>>())
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert!(succeed(&cb).await.unwrap_err().is_not_permitted());
        tx.send(()).unwrap();
        blocked.await.unwrap().unwrap();
        second.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_in_half_open_reopens() {
        let cb = std::sync::Arc::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                max_wait_duration_in_half_open_state: Duration::from_secs(2),
                ..config()
            },
        ));
        cb.force_open();
        tokio::time::advance(Duration::from_millis(1100)).await;

        // a trial that never completes
        let stuck = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| std::future::pending::<Result<(), &'static str>>())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(succeed(&cb).await.unwrap_err().is_not_permitted());
        assert_eq!(cb.state(), CircuitState::Open);
        stuck.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                call_timeout: Duration::from_millis(100),
                minimum_number_of_calls: 1,
                sliding_window_size: 1,
                ..config()
            },
        );

        let result = cb
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().timed_out_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_calls_open_breaker() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                slow_call_rate_threshold: 50.0,
                slow_call_duration_threshold: Duration::from_millis(50),
                minimum_number_of_calls: 2,
                sliding_window_size: 2,
                ..config()
            },
        );

        for _ in 0..2 {
            cb.call(|| async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok::<_, &'static str>(())
            })
            .await
            .unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().slow_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_does_not_strand_half_open() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                permitted_number_of_calls_in_half_open_state: 1,
                ..config()
            },
        );
        cb.force_open();
        tokio::time::advance(Duration::from_millis(1100)).await;

        // the caller gives up on the only trial call
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &'static str>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(3600)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_while_closed_records_nothing() {
        let cb = CircuitBreaker::new("test", config());
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(|| std::future::pending::<Result<(), &'static str>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().buffered_calls, 0);
        assert_eq!(cb.metrics().failed_calls, 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(CircuitState::from(7), CircuitState::Open);
    }
}
