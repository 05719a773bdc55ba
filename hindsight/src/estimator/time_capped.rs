//! Time-Capped Moving-Average Interval Estimator
//!
//! The moving window only describes the current rate while its samples are
//! recent. This estimator refuses to estimate once the window's samples fall
//! outside a time cap ending at the query time — and it listens for detected
//! pauses, each of which temporarily *extends* the cap by the pause length
//! (a stall is not a rate drop) until the cap no longer overlaps the pause.
//!
//! Pause bookkeeping and estimation share one short mutex; recording stays
//! on the base estimator's lock-free path.

use super::moving_average::MovingAverageIntervalEstimator;
use super::{IntervalEstimator, IMPOSSIBLY_LARGE};
use crate::config::MAX_TRACKED_PAUSES;
use crate::detector::{ListenerId, ListenerPriority, PauseDetector, PauseListener};
use crate::sync::atomic::Ordering;
use parking_lot::Mutex;
use std::sync::Arc;

/// Slot value marking an empty pause record.
const NO_PAUSE: u64 = u64::MAX;

struct PauseWindow {
    /// Current cap: the base plus the lengths of all tracked live pauses.
    time_cap: u64,
    start_times: [u64; MAX_TRACKED_PAUSES],
    lengths: [u64; MAX_TRACKED_PAUSES],
    /// Oldest live pause record (FIFO expiry order).
    earliest: usize,
    /// Next slot to write.
    next: usize,
}

/// Moving-average estimator that trusts its window only inside a
/// pause-extended time cap.
pub struct TimeCappedMovingAverageIntervalEstimator {
    inner: MovingAverageIntervalEstimator,
    base_time_cap: u64,
    pauses: Mutex<PauseWindow>,
    registration: Mutex<Option<(Arc<dyn PauseDetector>, ListenerId)>>,
}

impl TimeCappedMovingAverageIntervalEstimator {
    /// Creates an estimator over `requested_window_length` samples (rounded
    /// up to a power of two) that must all fit inside `time_cap` nanoseconds
    /// of the query time.
    pub fn new(requested_window_length: usize, time_cap: u64) -> Self {
        TimeCappedMovingAverageIntervalEstimator {
            inner: MovingAverageIntervalEstimator::new(requested_window_length),
            base_time_cap: time_cap,
            pauses: Mutex::new(PauseWindow {
                time_cap,
                start_times: [NO_PAUSE; MAX_TRACKED_PAUSES],
                lengths: [0; MAX_TRACKED_PAUSES],
                earliest: 0,
                next: 0,
            }),
            registration: Mutex::new(None),
        }
    }

    /// Creates the estimator and registers it with `detector` at high
    /// priority, so its cap reflects a pause before any normal-priority
    /// consumer asks for an estimate.
    pub fn with_detector(
        requested_window_length: usize,
        time_cap: u64,
        detector: &Arc<dyn PauseDetector>,
    ) -> Arc<Self> {
        let estimator = Arc::new(Self::new(requested_window_length, time_cap));
        let listener: Arc<dyn PauseListener> = Arc::clone(&estimator) as Arc<dyn PauseListener>;
        let id = detector.add_listener(&listener, ListenerPriority::High);
        *estimator.registration.lock() = Some((Arc::clone(detector), id));
        estimator
    }

    /// The configured (un-extended) time cap.
    pub fn base_time_cap(&self) -> u64 {
        self.base_time_cap
    }

    /// The current cap: base plus all tracked live pause lengths.
    pub fn time_cap(&self) -> u64 {
        self.pauses.lock().time_cap
    }

    /// The actual (rounded-up) window length.
    pub fn window_length(&self) -> usize {
        self.inner.window_length()
    }

    /// Tracks a detected pause, extending the cap by its length until the
    /// cap window no longer reaches back to the pause's start.
    pub fn record_pause(&self, pause_length: u64, pause_end_time: u64) {
        let pauses = &mut *self.pauses.lock();

        if pauses.start_times[pauses.next] != NO_PAUSE {
            // Overwriting a live record: retire its cap contribution first.
            pauses.time_cap -= pauses.lengths[pauses.next];
            pauses.earliest = (pauses.next + 1) % MAX_TRACKED_PAUSES;
        }

        pauses.time_cap += pause_length;

        let slot = pauses.next;
        pauses.start_times[slot] = pause_end_time.saturating_sub(pause_length);
        pauses.lengths[slot] = pause_length;
        pauses.next = (slot + 1) % MAX_TRACKED_PAUSES;
    }

    /// Deregisters from the pause detector, if registered.
    pub fn stop(&self) {
        if let Some((detector, id)) = self.registration.lock().take() {
            detector.remove_listener(id);
        }
    }

    /// Expires pauses whose start has dropped out of the cap window ending
    /// at `when`. Each eviction shrinks the cap and thereby moves the window
    /// boundary, so the loop runs to a fixpoint.
    fn expire_stale_pauses(pauses: &mut PauseWindow, when: u64) {
        loop {
            let cap_start = when.saturating_sub(pauses.time_cap);
            let slot = pauses.earliest;
            if pauses.start_times[slot] >= cap_start {
                return;
            }
            pauses.time_cap -= pauses.lengths[slot];
            pauses.start_times[slot] = NO_PAUSE;
            pauses.lengths[slot] = 0;
            pauses.earliest = (slot + 1) % MAX_TRACKED_PAUSES;
        }
    }

    fn estimate(&self, when: u64) -> u64 {
        let pauses = &mut *self.pauses.lock();
        Self::expire_stale_pauses(pauses, when);

        let window = self.inner.window_length as u64;
        let sampled_count = self.inner.count.load(Ordering::Acquire);
        if sampled_count < window {
            return IMPOSSIBLY_LARGE;
        }

        // The end times are monotonically non-decreasing in logical age from
        // the write cursor; binary-search for how many are older than the
        // cap window.
        let cap_start = when.saturating_sub(pauses.time_cap);
        let mut below = 0u64;
        let mut at_or_above = window;
        while below < at_or_above {
            let mid = (below + at_or_above) / 2;
            if self.inner.end_time_at(sampled_count.wrapping_add(mid)) < cap_start {
                below = mid + 1;
            } else {
                at_or_above = mid;
            }
        }
        let outside = below;

        let usable = window - outside;
        if usable <= 1 {
            return IMPOSSIBLY_LARGE;
        }

        let window_start = self.inner.end_time_at(sampled_count.wrapping_add(outside));
        let window_span = when as i64 - window_start as i64;
        let pause_in_window = (pauses.time_cap - self.base_time_cap) as i64;
        let active_span = window_span - pause_in_window;
        if active_span <= 0 {
            return IMPOSSIBLY_LARGE;
        }
        ((active_span as u64) / (usable - 1)).max(1)
    }
}

impl IntervalEstimator for TimeCappedMovingAverageIntervalEstimator {
    fn record(&self, end_time: u64) {
        self.inner.record_end_time(end_time);
    }

    fn estimated_interval(&self, when: u64) -> u64 {
        self.estimate(when)
    }
}

impl PauseListener for TimeCappedMovingAverageIntervalEstimator {
    fn handle_pause(&self, pause_length: u64, pause_end_time: u64) {
        self.record_pause(pause_length, pause_end_time);
    }
}
