//! Latency Statistics Recorder
//!
//! [`LatencyStats`] combines the phaser, the concurrent histogram handles,
//! the time-capped interval estimator, and a pause detector into the
//! recording pipeline:
//!
//! - `record_latency` runs under a wait-free writer critical section: it
//!   ticks the estimator and records into the *active* raw histogram.
//! - The pause detector feeds two listeners. The estimator (high priority)
//!   extends its time cap; the recorder's tracker (normal priority) then
//!   synthesises correction samples into the *active* corrections histogram
//!   using the estimator's pause-aware interval.
//! - Interval readers rotate the active/inactive pairs under the reader
//!   lock and flip the phase, which drains every writer that could still be
//!   touching the now-inactive pair before it is read.
//!
//! Both recording paths share one phaser: raw values and corrections must
//! serialise against the same rotation boundary.

use crate::detector::{ListenerId, ListenerPriority, PauseDetector, PauseListener};
use crate::estimator::{
    IntervalEstimator, TimeCappedMovingAverageIntervalEstimator, IMPOSSIBLY_LARGE,
};
use crate::histogram::ConcurrentHistogram;
use crate::phaser::{ReaderGuard, RecordingPhaser};
use crate::time::Clock;
use crate::{config, Result, SimplePauseDetector};
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::warn;

static DEFAULT_DETECTOR: LazyLock<RwLock<Option<Arc<dyn PauseDetector>>>> =
    LazyLock::new(|| RwLock::new(None));

/// Installs the process-wide default pause detector used by
/// [`LatencyStats`] instances built without an explicit one.
pub fn set_default_pause_detector(detector: Arc<dyn PauseDetector>) {
    *DEFAULT_DETECTOR.write() = Some(detector);
}

/// The process-wide default pause detector, if one has been installed or
/// lazily created.
pub fn default_pause_detector() -> Option<Arc<dyn PauseDetector>> {
    DEFAULT_DETECTOR.read().clone()
}

/// Shuts down and clears the process-wide default detector. Call once at
/// program exit if a default was ever created.
pub fn shutdown_default_pause_detector() {
    // Release the slot before joining detector threads.
    let detector = DEFAULT_DETECTOR.write().take();
    if let Some(detector) = detector {
        detector.shutdown();
    }
}

/// Returns the installed default detector, creating and caching a
/// [`SimplePauseDetector`] with default settings on first need.
fn default_or_init_detector() -> Result<Arc<dyn PauseDetector>> {
    if let Some(detector) = DEFAULT_DETECTOR.read().clone() {
        return Ok(detector);
    }
    let mut slot = DEFAULT_DETECTOR.write();
    // Double-checked: another thread may have installed one while we were
    // waiting for the write lock.
    if let Some(detector) = slot.clone() {
        return Ok(detector);
    }
    let detector: Arc<dyn PauseDetector> = Arc::new(SimplePauseDetector::new()?);
    *slot = Some(Arc::clone(&detector));
    Ok(detector)
}

/// One interval's worth of latency data: the histogram plus the wall-clock
/// window it covers. Dereferences to the histogram.
pub struct IntervalSnapshot {
    /// Recorded (and, for corrected reads, synthesised) latencies.
    pub histogram: Histogram<u64>,
    /// Wall-clock start of the interval, in milliseconds.
    pub start_time_ms: u64,
    /// Wall-clock end of the interval, in milliseconds.
    pub end_time_ms: u64,
}

impl Deref for IntervalSnapshot {
    type Target = Histogram<u64>;

    fn deref(&self) -> &Histogram<u64> {
        &self.histogram
    }
}

/// Builder for [`LatencyStats`]. All latencies are nanoseconds.
pub struct LatencyStatsBuilder {
    lowest_trackable_latency: u64,
    highest_trackable_latency: u64,
    significant_digits: u8,
    estimator_window_length: usize,
    estimator_time_cap: u64,
    pause_detector: Option<Arc<dyn PauseDetector>>,
    clock: Option<Arc<Clock>>,
}

impl LatencyStatsBuilder {
    fn new() -> LatencyStatsBuilder {
        LatencyStatsBuilder {
            lowest_trackable_latency: config::DEFAULT_LOWEST_TRACKABLE_LATENCY,
            highest_trackable_latency: config::DEFAULT_HIGHEST_TRACKABLE_LATENCY,
            significant_digits: config::DEFAULT_SIGNIFICANT_DIGITS,
            estimator_window_length: config::DEFAULT_ESTIMATOR_WINDOW,
            estimator_time_cap: config::DEFAULT_ESTIMATOR_TIME_CAP,
            pause_detector: None,
            clock: None,
        }
    }

    /// Lowest distinguishable latency value (default 1 µs).
    pub fn lowest_trackable_latency(mut self, nanos: u64) -> Self {
        self.lowest_trackable_latency = nanos;
        self
    }

    /// Highest trackable latency value (default 1 hour).
    pub fn highest_trackable_latency(mut self, nanos: u64) -> Self {
        self.highest_trackable_latency = nanos;
        self
    }

    /// Histogram precision in significant value digits (default 2).
    pub fn significant_digits(mut self, digits: u8) -> Self {
        self.significant_digits = digits;
        self
    }

    /// Interval estimator window length (default 1024; rounded up to a
    /// power of two).
    pub fn estimator_window_length(mut self, samples: usize) -> Self {
        self.estimator_window_length = samples;
        self
    }

    /// Interval estimator time cap (default 10 s).
    pub fn estimator_time_cap(mut self, nanos: u64) -> Self {
        self.estimator_time_cap = nanos;
        self
    }

    /// Pause detector to subscribe to. Without one, the process-wide
    /// default is used (created on first need).
    pub fn pause_detector(mut self, detector: Arc<dyn PauseDetector>) -> Self {
        self.pause_detector = Some(detector);
        self
    }

    /// Clock to read time from (defaults to the system clock).
    pub fn clock(mut self, clock: Arc<Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the recorder and registers its listeners with the detector.
    pub fn build(self) -> Result<LatencyStats> {
        let clock = self.clock.unwrap_or_else(Clock::system);
        let detector = match self.pause_detector {
            Some(detector) => detector,
            None => default_or_init_detector()?,
        };

        let new_handle = || {
            ConcurrentHistogram::new(
                self.lowest_trackable_latency,
                self.highest_trackable_latency,
                self.significant_digits,
            )
        };
        let template = Histogram::new_with_bounds(
            self.lowest_trackable_latency,
            self.highest_trackable_latency,
            self.significant_digits,
        )?;

        let estimator = TimeCappedMovingAverageIntervalEstimator::with_detector(
            self.estimator_window_length,
            self.estimator_time_cap,
            &detector,
        );

        let inner = Arc::new(Inner {
            clock,
            estimator,
            phaser: RecordingPhaser::new(),
            raw: [new_handle()?, new_handle()?],
            corrections: [new_handle()?, new_handle()?],
            active_index: AtomicUsize::new(0),
            template,
            lowest_trackable_latency: self.lowest_trackable_latency,
            highest_trackable_latency: self.highest_trackable_latency,
            significant_digits: self.significant_digits,
        });

        let now_ms = inner.clock.now_millis();
        inner.raw[0].set_start_time_ms(now_ms);
        inner.corrections[0].set_start_time_ms(now_ms);

        let tracker = Arc::new(PauseTracker {
            stats: Arc::clone(&inner),
        });
        let tracker_listener: Arc<dyn PauseListener> =
            Arc::clone(&tracker) as Arc<dyn PauseListener>;
        let tracker_id = detector.add_listener(&tracker_listener, ListenerPriority::Normal);

        Ok(LatencyStats {
            inner,
            detector,
            _tracker: tracker,
            tracker_id: Mutex::new(Some(tracker_id)),
        })
    }
}

/// Pause-aware latency statistics recorder.
///
/// Values are recorded wait-free from any number of threads; interval reads
/// rotate double-buffered histograms and return everything recorded (and
/// synthesised) since the previous read.
pub struct LatencyStats {
    inner: Arc<Inner>,
    detector: Arc<dyn PauseDetector>,
    /// Strong holder for the detector's weak registration; dropping the
    /// stats without `stop()` lets the dispatcher prune it.
    _tracker: Arc<PauseTracker>,
    tracker_id: Mutex<Option<ListenerId>>,
}

struct Inner {
    clock: Arc<Clock>,
    estimator: Arc<TimeCappedMovingAverageIntervalEstimator>,
    phaser: RecordingPhaser,
    raw: [ConcurrentHistogram; 2],
    corrections: [ConcurrentHistogram; 2],
    active_index: AtomicUsize,
    template: Histogram<u64>,
    lowest_trackable_latency: u64,
    highest_trackable_latency: u64,
    significant_digits: u8,
}

/// Feeds the corrections histogram whenever the detector reports a pause.
struct PauseTracker {
    stats: Arc<Inner>,
}

impl PauseListener for PauseTracker {
    fn handle_pause(&self, pause_length: u64, pause_end_time: u64) {
        self.stats.record_detected_pause(pause_length, pause_end_time);
    }
}

impl LatencyStats {
    /// A recorder with default configuration and the process-wide default
    /// pause detector.
    pub fn new() -> Result<LatencyStats> {
        Self::builder().build()
    }

    /// Starts building a recorder.
    pub fn builder() -> LatencyStatsBuilder {
        LatencyStatsBuilder::new()
    }

    /// Records a single latency observation, in nanoseconds. Wait-free up
    /// to the underlying histogram's `record`; values above the highest
    /// trackable propagate the histogram's error.
    #[inline]
    pub fn record_latency(&self, latency: u64) -> Result<()> {
        let inner = &*self.inner;
        // The guard exits the critical section on every path out of this
        // function; a leaked token would hang the next phase flip.
        let _section = inner.phaser.writer_critical_section();
        inner.estimator.record(inner.clock.now_nanos());
        inner.raw[inner.active_index.load(Ordering::Acquire)].record(latency)
    }

    /// Returns the pause-corrected interval histogram covering everything
    /// since the previous interval read, rotating the recording buffers.
    pub fn interval_histogram(&self) -> Result<IntervalSnapshot> {
        let mut histogram = self.inner.template.clone();
        let (start_time_ms, end_time_ms) = self.read_interval(&mut histogram, true)?;
        Ok(IntervalSnapshot {
            histogram,
            start_time_ms,
            end_time_ms,
        })
    }

    /// Overwrites `target` with the pause-corrected interval histogram.
    pub fn interval_histogram_into(&self, target: &mut Histogram<u64>) -> Result<()> {
        self.read_interval(target, true).map(|_| ())
    }

    /// Adds the pause-corrected interval histogram into `target`.
    pub fn add_interval_histogram_to(&self, target: &mut Histogram<u64>) -> Result<()> {
        let reader = self.inner.phaser.reader_lock();
        let drained = self.inner.rotate(&reader);
        self.inner.raw[drained].add_into(target)?;
        self.inner.corrections[drained].add_into(target)?;
        Ok(())
    }

    /// Returns the interval histogram without pause corrections. Rotates
    /// the recording buffers like the corrected variants do.
    pub fn uncorrected_interval_histogram(&self) -> Result<IntervalSnapshot> {
        let mut histogram = self.inner.template.clone();
        let (start_time_ms, end_time_ms) = self.read_interval(&mut histogram, false)?;
        Ok(IntervalSnapshot {
            histogram,
            start_time_ms,
            end_time_ms,
        })
    }

    /// Lowest distinguishable latency value, in nanoseconds.
    pub fn lowest_trackable_latency(&self) -> u64 {
        self.inner.lowest_trackable_latency
    }

    /// Highest trackable latency value, in nanoseconds.
    pub fn highest_trackable_latency(&self) -> u64 {
        self.inner.highest_trackable_latency
    }

    /// Histogram precision, in significant value digits.
    pub fn significant_digits(&self) -> u8 {
        self.inner.significant_digits
    }

    /// The (power-of-two) interval estimator window length in use.
    pub fn estimator_window_length(&self) -> usize {
        self.inner.estimator.window_length()
    }

    /// The estimator's configured time cap, in nanoseconds.
    pub fn estimator_time_cap(&self) -> u64 {
        self.inner.estimator.base_time_cap()
    }

    /// The pause detector this recorder is subscribed to.
    pub fn pause_detector(&self) -> &Arc<dyn PauseDetector> {
        &self.detector
    }

    /// Deregisters from the pause detector. Recording remains possible but
    /// pauses no longer produce corrections. Idempotent.
    pub fn stop(&self) {
        self.inner.estimator.stop();
        if let Some(id) = self.tracker_id.lock().take() {
            self.detector.remove_listener(id);
        }
    }

    fn read_interval(&self, target: &mut Histogram<u64>, corrected: bool) -> Result<(u64, u64)> {
        let reader = self.inner.phaser.reader_lock();
        let drained = self.inner.rotate(&reader);
        self.inner.raw[drained].copy_into(target)?;
        if corrected {
            self.inner.corrections[drained].add_into(target)?;
        }
        Ok((
            self.inner.raw[drained].start_time_ms(),
            self.inner.raw[drained].end_time_ms(),
        ))
    }
}

impl Inner {
    /// Rotates active and inactive histogram pairs, returning the index of
    /// the drained (now safe to read) pair. Requires the reader guard: the
    /// flip must not race another rotation.
    fn rotate(&self, reader: &ReaderGuard<'_>) -> usize {
        let retiring = self.active_index.load(Ordering::Acquire);
        let fresh = retiring ^ 1;

        // The incoming pair still holds the interval before last; clear it
        // before writers can see it.
        self.raw[fresh].reset();
        self.corrections[fresh].reset();

        self.active_index.store(fresh, Ordering::Release);

        let now_ms = self.clock.now_millis();
        self.raw[fresh].set_start_time_ms(now_ms);
        self.corrections[fresh].set_start_time_ms(now_ms);
        self.raw[retiring].set_end_time_ms(now_ms);
        self.corrections[retiring].set_end_time_ms(now_ms);

        // Writers that entered before the index switch may still be
        // recording into the retiring pair; after the flip they are done.
        reader.flip_phase();
        retiring
    }

    fn record_detected_pause(&self, pause_length: u64, pause_end_time: u64) {
        let _section = self.phaser.writer_critical_section();

        // The estimator heard about this pause first (high priority), so
        // its estimate already accounts for it.
        let estimated_interval = self.estimator.estimated_interval(pause_end_time);
        if estimated_interval == IMPOSSIBLY_LARGE {
            // No reliable rate: a correction would be fabricated, skip it.
            return;
        }

        let observed_latency_min_bar = pause_length.saturating_sub(estimated_interval);
        if observed_latency_min_bar < estimated_interval {
            return;
        }

        let active = self.active_index.load(Ordering::Acquire);
        if let Err(error) = self.corrections[active]
            .record_with_expected_interval(observed_latency_min_bar, estimated_interval)
        {
            warn!(%error, pause_length, "pause correction could not be recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorCore;

    fn manual_stats() -> (Arc<Clock>, Arc<DetectorCore>, LatencyStats) {
        let clock = Clock::manual();
        let detector = Arc::new(DetectorCore::new());
        let stats = LatencyStats::builder()
            .pause_detector(Arc::clone(&detector) as Arc<dyn PauseDetector>)
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();
        (clock, detector, stats)
    }

    #[test]
    fn records_are_visible_in_the_next_interval() {
        let (clock, detector, stats) = manual_stats();

        for _ in 0..100 {
            clock.advance(1_000_000);
            stats.record_latency(500_000).unwrap();
        }

        let interval = stats.interval_histogram().unwrap();
        assert_eq!(interval.len(), 100);

        // A second read covers only what came after the rotation.
        let empty = stats.interval_histogram().unwrap();
        assert_eq!(empty.len(), 0);

        stats.stop();
        detector.shutdown();
    }

    #[test]
    fn interval_counts_sum_across_reads() {
        let (clock, detector, stats) = manual_stats();

        let mut total = 0u64;
        for round in 1..=5u64 {
            for _ in 0..round * 10 {
                clock.advance(1_000);
                stats.record_latency(2_000).unwrap();
            }
            total += stats.interval_histogram().unwrap().len();
        }
        assert_eq!(total, 10 + 20 + 30 + 40 + 50);

        stats.stop();
        detector.shutdown();
    }

    #[test]
    fn out_of_range_value_errors_but_recording_survives() {
        let clock = Clock::manual();
        let detector = Arc::new(DetectorCore::new());
        let stats = LatencyStats::builder()
            .lowest_trackable_latency(1_000)
            .highest_trackable_latency(1_000_000)
            .significant_digits(2)
            .pause_detector(Arc::clone(&detector) as Arc<dyn PauseDetector>)
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();

        assert!(stats.record_latency(u64::MAX).is_err());

        // The failed record must have exited its critical section, or this
        // rotation's phase flip would spin forever.
        stats.record_latency(5_000).unwrap();
        let interval = stats.interval_histogram().unwrap();
        assert_eq!(interval.len(), 1);

        stats.stop();
        detector.shutdown();
    }

    #[test]
    fn accessors_reflect_the_configuration() {
        let detector = Arc::new(DetectorCore::new());
        let stats = LatencyStats::builder()
            .estimator_window_length(1_000)
            .estimator_time_cap(2_000_000_000)
            .pause_detector(Arc::clone(&detector) as Arc<dyn PauseDetector>)
            .build()
            .unwrap();

        assert_eq!(
            stats.lowest_trackable_latency(),
            config::DEFAULT_LOWEST_TRACKABLE_LATENCY
        );
        assert_eq!(
            stats.highest_trackable_latency(),
            config::DEFAULT_HIGHEST_TRACKABLE_LATENCY
        );
        assert_eq!(stats.significant_digits(), config::DEFAULT_SIGNIFICANT_DIGITS);
        // The requested window is rounded up to a power of two.
        assert_eq!(stats.estimator_window_length(), 1_024);
        assert_eq!(stats.estimator_time_cap(), 2_000_000_000);

        stats.stop();
        detector.shutdown();
    }

    #[test]
    fn builder_validates_histogram_bounds() {
        let detector = Arc::new(DetectorCore::new());
        let result = LatencyStats::builder()
            .lowest_trackable_latency(0)
            .pause_detector(Arc::clone(&detector) as Arc<dyn PauseDetector>)
            .build();
        assert!(matches!(result, Err(crate::Error::HistogramCreation(_))));
    }

    #[test]
    fn snapshot_window_stamps_advance_with_the_clock() {
        let (clock, detector, stats) = manual_stats();

        clock.advance(2_000_000_000);
        stats.record_latency(1_000_000).unwrap();
        let first = stats.interval_histogram().unwrap();
        assert_eq!(first.start_time_ms, 0);
        assert_eq!(first.end_time_ms, 2_000);

        clock.advance(3_000_000_000);
        let second = stats.interval_histogram().unwrap();
        assert_eq!(second.start_time_ms, 2_000);
        assert_eq!(second.end_time_ms, 5_000);

        stats.stop();
        detector.shutdown();
    }

    #[test]
    fn default_detector_is_created_once_and_torn_down() {
        let stats = LatencyStats::new().unwrap();
        let first = default_pause_detector().expect("default detector should be cached");

        let again = LatencyStats::new().unwrap();
        let second = default_pause_detector().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        stats.stop();
        again.stop();
        shutdown_default_pause_detector();
        assert!(default_pause_detector().is_none());
    }
}
