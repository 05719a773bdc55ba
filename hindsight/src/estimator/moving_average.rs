//! Moving-Average Interval Estimator
//!
//! Keeps the end times of the most recent `W` recordings in a power-of-two
//! ring indexed by a monotonically increasing counter. The estimate is the
//! window's time span divided by `W - 1`. Until the window has filled the
//! estimate is [`IMPOSSIBLY_LARGE`](super::IMPOSSIBLY_LARGE) — a partial
//! window says nothing trustworthy about the rate.

use super::{IntervalEstimator, IMPOSSIBLY_LARGE};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::busy_wait;

/// Moving window over recording end times.
pub struct MovingAverageIntervalEstimator {
    pub(crate) interval_end_times: Box<[AtomicU64]>,
    pub(crate) window_length: usize,
    pub(crate) window_mask: u64,
    pub(crate) count: AtomicU64,
}

impl MovingAverageIntervalEstimator {
    /// Creates an estimator over a window of `requested_window_length`
    /// samples, rounded up to the nearest power of two (minimum 2).
    pub fn new(requested_window_length: usize) -> MovingAverageIntervalEstimator {
        let window_length = requested_window_length.next_power_of_two().max(2);
        let interval_end_times = (0..window_length)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        MovingAverageIntervalEstimator {
            interval_end_times,
            window_length,
            window_mask: window_length as u64 - 1,
            count: AtomicU64::new(0),
        }
    }

    /// The actual (rounded-up) window length.
    pub fn window_length(&self) -> usize {
        self.window_length
    }

    /// Number of recordings observed so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// End time stored at logical window position `logical` (the slot the
    /// counter value `logical` wrote to).
    #[inline]
    pub(crate) fn end_time_at(&self, logical: u64) -> u64 {
        self.interval_end_times[(logical & self.window_mask) as usize].load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn record_end_time(&self, end_time: u64) {
        // Racy only if enough in-flight recorders wrap the whole window
        // while the earliest is still mid-call; the window is sized far
        // above any realistic number of concurrently recording threads.
        let count_at_swap = self.count.fetch_add(1, Ordering::AcqRel);
        self.interval_end_times[(count_at_swap & self.window_mask) as usize]
            .store(end_time, Ordering::Release);
    }

    fn estimate(&self, when: u64) -> u64 {
        let window = self.window_length as u64;
        loop {
            let sampled_count = self.count.load(Ordering::Acquire);
            if sampled_count < window {
                return IMPOSSIBLY_LARGE;
            }

            let oldest = (sampled_count & self.window_mask) as usize;
            let newest = ((sampled_count + window - 1) & self.window_mask) as usize;
            let window_start = self.interval_end_times[oldest].load(Ordering::Acquire);
            // Pinning the end to the query time keeps a lull from shrinking
            // the span below the time actually elapsed.
            let window_end = self.interval_end_times[newest].load(Ordering::Acquire).max(when);

            // A concurrent recorder may have bumped the counter before its
            // slot store landed; retry on any sign of a torn window.
            let stable = self.count.load(Ordering::Acquire) == sampled_count;
            if stable && window_end >= window_start {
                return ((window_end - window_start) / (window - 1)).max(1);
            }
            busy_wait();
        }
    }
}

impl IntervalEstimator for MovingAverageIntervalEstimator {
    fn record(&self, end_time: u64) {
        self.record_end_time(end_time);
    }

    fn estimated_interval(&self, when: u64) -> u64 {
        self.estimate(when)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_length_rounds_up_to_power_of_two() {
        assert_eq!(MovingAverageIntervalEstimator::new(1000).window_length(), 1024);
        assert_eq!(MovingAverageIntervalEstimator::new(32).window_length(), 32);
        assert_eq!(MovingAverageIntervalEstimator::new(1).window_length(), 2);
    }

    #[test]
    fn partial_window_yields_no_estimate() {
        let estimator = MovingAverageIntervalEstimator::new(32);
        let mut now = 0;
        for _ in 0..31 {
            now += 20;
            estimator.record(now);
        }
        assert_eq!(estimator.estimated_interval(now), IMPOSSIBLY_LARGE);
    }

    #[test]
    fn steady_rate_estimates_the_interval() {
        let estimator = MovingAverageIntervalEstimator::new(1024);
        let mut now = 0;
        for _ in 0..10_000 {
            now += 20;
            estimator.record(now);
        }
        assert_eq!(estimator.estimated_interval(now), 20);
    }

    #[test]
    fn rate_change_blends_across_the_window() {
        let estimator = MovingAverageIntervalEstimator::new(1024);
        let mut now = 0;
        for _ in 0..10_000 {
            now += 20;
            estimator.record(now);
        }
        // Half the window at twice the interval: the average moves halfway.
        for _ in 0..512 {
            now += 40;
            estimator.record(now);
        }
        assert_eq!(estimator.estimated_interval(now), 30);

        for _ in 0..256 {
            now += 60;
            estimator.record(now);
        }
        assert_eq!(estimator.estimated_interval(now), 40);
    }

    #[test]
    fn lull_pins_the_window_end_to_the_query_time() {
        let estimator = MovingAverageIntervalEstimator::new(32);
        let mut now = 0;
        for _ in 0..32 {
            now += 100;
            estimator.record(now);
        }
        assert_eq!(estimator.estimated_interval(now), 100);

        // Nothing recorded for a long stretch: the estimate grows with the
        // elapsed time instead of reporting the stale in-window rate.
        let later = now + 31 * 900;
        assert_eq!(estimator.estimated_interval(later), 1_000);
    }

    #[test]
    fn estimate_is_never_zero() {
        let estimator = MovingAverageIntervalEstimator::new(2);
        estimator.record(5);
        estimator.record(5);
        assert_eq!(estimator.estimated_interval(5), 1);
    }
}
