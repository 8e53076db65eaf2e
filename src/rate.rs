//! Sliding-window transfer rate estimation.
//!
//! Passive observation only; token accounting for rate *limiting* lives in a
//! collaborator outside this core. The estimator feeds the choke review and
//! the per-peer request budget. Callers thread `Instant` through explicitly
//! so the tick loop and tests control time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::constants::RATE_WINDOW;

/// A byte-rate estimator over a sliding time window.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::with_window(RATE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Records `bytes` transferred at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.prune(now);
    }

    /// Estimated rate in bytes per second over the window ending at `now`.
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.prune(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        self.total as f64 / self.window.as_secs_f64()
    }

    /// Number of events recorded inside the window ending at `now`.
    ///
    /// Used for have-message frequency when no byte rate is measurable.
    pub fn events(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.samples.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, bytes)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.total -= bytes;
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rate_is_zero() {
        let mut est = RateEstimator::new();
        assert_eq!(est.rate(Instant::now()), 0.0);
    }

    #[test]
    fn test_rate_over_window() {
        let start = Instant::now();
        let mut est = RateEstimator::with_window(Duration::from_secs(5));
        est.record(start, 5000);
        est.record(start + Duration::from_secs(1), 5000);
        let rate = est.rate(start + Duration::from_secs(1));
        assert_eq!(rate, 2000.0);
    }

    #[test]
    fn test_old_samples_pruned() {
        let start = Instant::now();
        let mut est = RateEstimator::with_window(Duration::from_secs(5));
        est.record(start, 10_000);
        assert_eq!(est.rate(start + Duration::from_secs(10)), 0.0);
        assert_eq!(est.events(start + Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_event_counting() {
        let start = Instant::now();
        let mut est = RateEstimator::with_window(Duration::from_secs(5));
        est.record(start, 0);
        est.record(start + Duration::from_secs(1), 0);
        est.record(start + Duration::from_secs(2), 0);
        assert_eq!(est.events(start + Duration::from_secs(2)), 3);
        assert_eq!(est.events(start + Duration::from_secs(7)), 1);
    }
}
