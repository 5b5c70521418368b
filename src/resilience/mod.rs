//! # Resilience
//!
//! Fault isolation for the remote tier. One [`CircuitBreaker`] guards the
//! remote store and is shared by every coordinator of a manager; each remote
//! operation, including invalidation broadcasts, runs through it.

pub mod circuit_breaker;
pub mod window;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerMetrics, CircuitState};
pub use window::{CallOutcome, SlidingWindow, WindowCounts};
