//! Aggregate counters for test runs and repairs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable metrics snapshot.
///
/// Updates build a new value which replaces the old one in the state record,
/// so a concurrent status reader can never observe a half-applied update.
/// `test_passes + test_failures` equals the number of supervised runs that
/// completed (spawn failures are excluded; retry and verification runs each
/// count).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub test_passes: u64,
    pub test_failures: u64,
    pub repair_successes: u64,
    pub repair_failures: u64,
    /// Running mean duration of completed test runs, in seconds.
    pub avg_test_secs: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            test_passes: 0,
            test_failures: 0,
            repair_successes: 0,
            repair_failures: 0,
            avg_test_secs: 0.0,
        }
    }
}

impl Metrics {
    /// Fold one completed test run into the counters and running mean.
    #[must_use]
    pub fn with_test_run(&self, passed: bool, duration: Duration) -> Self {
        let mut next = self.clone();
        if passed {
            next.test_passes += 1;
        } else {
            next.test_failures += 1;
        }
        let n = next.completed_runs() as f64;
        next.avg_test_secs = (self.avg_test_secs * (n - 1.0) + duration.as_secs_f64()) / n;
        next
    }

    #[must_use]
    pub fn with_repair_success(&self) -> Self {
        let mut next = self.clone();
        next.repair_successes += 1;
        next
    }

    #[must_use]
    pub fn with_repair_failure(&self) -> Self {
        let mut next = self.clone();
        next.repair_failures += 1;
        next
    }

    /// Total supervised test runs that ran to completion.
    pub fn completed_runs(&self) -> u64 {
        self.test_passes + self.test_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_passes_and_failures_separately() {
        let metrics = Metrics::default()
            .with_test_run(true, Duration::from_secs(1))
            .with_test_run(false, Duration::from_secs(1))
            .with_test_run(true, Duration::from_secs(1));

        assert_eq!(metrics.test_passes, 2);
        assert_eq!(metrics.test_failures, 1);
        assert_eq!(metrics.completed_runs(), 3);
    }

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let durations = [2.0, 4.0, 6.0, 8.0];
        let mut metrics = Metrics::default();
        for secs in durations {
            metrics = metrics.with_test_run(true, Duration::from_secs_f64(secs));
        }

        assert!((metrics.avg_test_secs - 5.0).abs() < 1e-9);
    }

    #[test]
    fn updates_leave_the_original_untouched() {
        let before = Metrics::default();
        let after = before.with_test_run(false, Duration::from_secs(3));

        assert_eq!(before, Metrics::default());
        assert_eq!(after.test_failures, 1);
    }

    #[test]
    fn repair_counters_are_independent() {
        let metrics = Metrics::default()
            .with_repair_success()
            .with_repair_failure()
            .with_repair_failure();

        assert_eq!(metrics.repair_successes, 1);
        assert_eq!(metrics.repair_failures, 2);
        assert_eq!(metrics.completed_runs(), 0);
    }
}
