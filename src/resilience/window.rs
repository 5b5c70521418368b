//! Sliding Windows
//!
//! Aggregates call outcomes over the last N calls or the last N seconds.

use crate::config::SlidingWindowType;
use std::collections::VecDeque;
use tokio::time::Instant;

/// Outcome of one completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOutcome {
    pub failed: bool,
    pub slow: bool,
}

/// Aggregated counts over a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub calls: u32,
    pub failed: u32,
    pub slow: u32,
}

impl WindowCounts {
    pub fn add(&mut self, outcome: CallOutcome) {
        self.calls += 1;
        self.failed += u32::from(outcome.failed);
        self.slow += u32::from(outcome.slow);
    }

    fn sub(&mut self, other: &WindowCounts) {
        self.calls -= other.calls;
        self.failed -= other.failed;
        self.slow -= other.slow;
    }

    /// Failure rate in percent
    pub fn failure_rate(&self) -> f32 {
        Self::percent(self.failed, self.calls)
    }

    /// Slow call rate in percent
    pub fn slow_call_rate(&self) -> f32 {
        Self::percent(self.slow, self.calls)
    }

    fn percent(part: u32, total: u32) -> f32 {
        if total == 0 {
            0.0
        } else {
            part as f32 * 100.0 / total as f32
        }
    }
}

/// Sliding window over call outcomes
#[derive(Debug)]
pub enum SlidingWindow {
    Count(CountWindow),
    Time(TimeWindow),
}

impl SlidingWindow {
    pub fn new(kind: SlidingWindowType, size: u32) -> Self {
        match kind {
            SlidingWindowType::CountBased => SlidingWindow::Count(CountWindow::new(size)),
            SlidingWindowType::TimeBased => SlidingWindow::Time(TimeWindow::new(size)),
        }
    }

    /// Record an outcome and return the updated aggregate
    pub fn record(&mut self, outcome: CallOutcome) -> WindowCounts {
        match self {
            SlidingWindow::Count(window) => window.record(outcome),
            SlidingWindow::Time(window) => window.record(outcome, Instant::now()),
        }
    }

    /// Current aggregate
    pub fn counts(&mut self) -> WindowCounts {
        match self {
            SlidingWindow::Count(window) => window.totals,
            SlidingWindow::Time(window) => window.counts_at(Instant::now()),
        }
    }

    pub fn reset(&mut self) {
        match self {
            SlidingWindow::Count(window) => window.reset(),
            SlidingWindow::Time(window) => window.reset(),
        }
    }
}

// =============================================================================
// Count-Based Window
// =============================================================================

/// Holds the last `size` outcomes
#[derive(Debug)]
pub struct CountWindow {
    size: usize,
    outcomes: VecDeque<CallOutcome>,
    totals: WindowCounts,
}

impl CountWindow {
    pub fn new(size: u32) -> Self {
        let size = size.max(1) as usize;
        Self {
            size,
            outcomes: VecDeque::with_capacity(size),
            totals: WindowCounts::default(),
        }
    }

    pub fn record(&mut self, outcome: CallOutcome) -> WindowCounts {
        if self.outcomes.len() == self.size {
            if let Some(oldest) = self.outcomes.pop_front() {
                let mut evicted = WindowCounts::default();
                evicted.add(oldest);
                self.totals.sub(&evicted);
            }
        }
        self.outcomes.push_back(outcome);
        self.totals.add(outcome);
        self.totals
    }

    fn reset(&mut self) {
        self.outcomes.clear();
        self.totals = WindowCounts::default();
    }
}

// =============================================================================
// Time-Based Window
// =============================================================================

/// Holds the outcomes of the last `size` seconds in one bucket per second
#[derive(Debug)]
pub struct TimeWindow {
    size_secs: u64,
    origin: Instant,
    buckets: VecDeque<(u64, WindowCounts)>,
    totals: WindowCounts,
}

impl TimeWindow {
    pub fn new(size_secs: u32) -> Self {
        Self {
            size_secs: u64::from(size_secs.max(1)),
            origin: Instant::now(),
            buckets: VecDeque::new(),
            totals: WindowCounts::default(),
        }
    }

    fn second_of(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_secs()
    }

    fn expire(&mut self, second: u64) {
        while let Some((bucket_second, counts)) = self.buckets.front() {
            if bucket_second + self.size_secs > second {
                break;
            }
            let counts = *counts;
            self.totals.sub(&counts);
            self.buckets.pop_front();
        }
    }

    pub fn record(&mut self, outcome: CallOutcome, now: Instant) -> WindowCounts {
        let second = self.second_of(now);
        self.expire(second);
        let current = matches!(self.buckets.back(), Some((s, _)) if *s == second);
        if current {
            if let Some((_, counts)) = self.buckets.back_mut() {
                counts.add(outcome);
            }
        } else {
            let mut counts = WindowCounts::default();
            counts.add(outcome);
            self.buckets.push_back((second, counts));
        }
        self.totals.add(outcome);
        self.totals
    }

    pub fn counts_at(&mut self, now: Instant) -> WindowCounts {
        let second = self.second_of(now);
        self.expire(second);
        self.totals
    }

    fn reset(&mut self) {
        self.buckets.clear();
        self.totals = WindowCounts::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const OK: CallOutcome = CallOutcome {
        failed: false,
        slow: false,
    };
    const FAIL: CallOutcome = CallOutcome {
        failed: true,
        slow: false,
    };
    const SLOW: CallOutcome = CallOutcome {
        failed: false,
        slow: true,
    };

    #[test]
    fn test_count_window_drops_oldest() {
        let mut window = CountWindow::new(4);
        window.record(FAIL);
        window.record(FAIL);
        window.record(OK);
        let counts = window.record(SLOW);
        assert_eq!(counts.calls, 4);
        assert_eq!(counts.failure_rate(), 50.0);
        assert_eq!(counts.slow_call_rate(), 25.0);

        window.record(OK);
        let counts = window.record(OK);
        assert_eq!(counts.calls, 4);
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.slow, 1);
    }

    #[test]
    fn test_empty_rates() {
        let counts = WindowCounts::default();
        assert_eq!(counts.failure_rate(), 0.0);
        assert_eq!(counts.slow_call_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_window_expires_buckets() {
        let mut window = TimeWindow::new(2);
        let start = Instant::now();

        window.record(FAIL, start);
        window.record(OK, start + Duration::from_millis(500));
        let counts = window.record(FAIL, start + Duration::from_millis(1500));
        assert_eq!(counts.calls, 3);
        assert_eq!(counts.failed, 2);

        // second 0 falls out of a two-second window at second 2
        let counts = window.counts_at(start + Duration::from_millis(2100));
        assert_eq!(counts.calls, 1);
        assert_eq!(counts.failed, 1);

        let counts = window.counts_at(start + Duration::from_secs(10));
        assert_eq!(counts, WindowCounts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_reset() {
        let mut window = SlidingWindow::new(SlidingWindowType::TimeBased, 5);
        window.record(FAIL);
        window.record(FAIL);
        assert_eq!(window.counts().calls, 2);
        window.reset();
        assert_eq!(window.counts().calls, 0);
    }
}
