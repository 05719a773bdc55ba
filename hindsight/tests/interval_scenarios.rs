//! End-to-end recorder scenarios: steady-rate recording, pause correction,
//! concurrent writers against a rotating reader, and listener lifecycle.

use hdrhistogram::Histogram;
use hindsight::{
    Clock, DetectorCore, LatencyStats, ListenerPriority, PauseDetector, PauseListener,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Listener used to observe when a pause event has fully dispatched. It is
/// registered after the recorder's own listeners, so once it fires the
/// recorder has already processed the same event.
struct DispatchProbe {
    seen: AtomicU64,
}

impl PauseListener for DispatchProbe {
    fn handle_pause(&self, _pause_length: u64, _pause_end_time: u64) {
        self.seen.fetch_add(1, Ordering::SeqCst);
    }
}

/// Routes the crate's `tracing` events into the test output; run tests with
/// `RUST_LOG=hindsight=debug` to watch dispatch and consensus activity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

struct Harness {
    clock: Arc<Clock>,
    detector: Arc<DetectorCore>,
    stats: LatencyStats,
    probe: Arc<DispatchProbe>,
}

impl Harness {
    fn new() -> Harness {
        init_tracing();
        let clock = Clock::manual();
        let detector = Arc::new(DetectorCore::new());
        let stats = LatencyStats::builder()
            .pause_detector(Arc::clone(&detector) as Arc<dyn PauseDetector>)
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();
        let probe = Arc::new(DispatchProbe {
            seen: AtomicU64::new(0),
        });
        let probe_listener: Arc<dyn PauseListener> = Arc::clone(&probe) as Arc<dyn PauseListener>;
        detector.add_listener(&probe_listener, ListenerPriority::Normal);
        Harness {
            clock,
            detector,
            stats,
            probe,
        }
    }

    /// Records `count` latencies of `latency` nanoseconds, one every
    /// `spacing` nanoseconds of manual time.
    fn record_steady(&self, count: u64, latency: u64, spacing: u64) {
        for _ in 0..count {
            self.clock.advance(spacing);
            self.stats.record_latency(latency).unwrap();
        }
    }

    /// Publishes a pause and waits until the recorder has processed it.
    fn inject_pause(&self, length: u64) {
        let seen_before = self.probe.seen.load(Ordering::SeqCst);
        self.clock.advance(length);
        self.detector.notify_pause(length, self.clock.now_nanos());
        assert!(
            wait_until(Duration::from_secs(5), || {
                self.probe.seen.load(Ordering::SeqCst) > seen_before
            }),
            "pause event was never dispatched"
        );
    }
}

#[test]
fn steady_rate_without_pauses_records_exactly_the_calls() {
    let harness = Harness::new();
    harness.record_steady(2_000, 5_000_000, 5_000_000);

    let interval = harness.stats.interval_histogram().unwrap();
    assert_eq!(interval.len(), 2_000);

    // All values were 5 ms; the histogram's precision is 2 significant
    // digits, so the mean can wobble by up to 1%.
    let mean = interval.mean();
    assert!(
        (4_900_000.0..=5_100_000.0).contains(&mean),
        "unexpected mean {mean}"
    );

    harness.stats.stop();
    harness.detector.shutdown();
}

#[test]
fn detected_pause_backfills_the_missing_samples() {
    let harness = Harness::new();
    // Steady 5 ms cadence, enough to fill the default 1024-sample window.
    harness.record_steady(2_000, 5_000_000, 5_000_000);

    // A 5 s stall: at a 5 ms interval, roughly 999 operations went missing,
    // with experienced latencies from ~5 s down to one interval.
    harness.inject_pause(5_000_000_000);

    let interval = harness.stats.interval_histogram().unwrap();
    assert_eq!(interval.len(), 2_000 + 999);

    // The raw recordings all sit at ~5 ms; every synthesised sample but the
    // smallest lies above 7.5 ms.
    assert_eq!(interval.count_between(7_500_000, 3_600_000_000_000), 998);

    // The largest synthesised latency is the pause minus one interval.
    let max = interval.max();
    assert!(
        (4_900_000_000..=5_100_000_000).contains(&max),
        "unexpected max {max}"
    );

    harness.stats.stop();
    harness.detector.shutdown();
}

#[test]
fn short_pause_produces_no_correction() {
    let harness = Harness::new();
    harness.record_steady(2_000, 5_000_000, 5_000_000);

    // Shorter than two estimated intervals: nothing went missing that the
    // recorded samples do not already represent.
    harness.inject_pause(8_000_000);

    let interval = harness.stats.interval_histogram().unwrap();
    assert_eq!(interval.len(), 2_000);

    harness.stats.stop();
    harness.detector.shutdown();
}

#[test]
fn uncorrected_interval_excludes_synthesised_samples() {
    let harness = Harness::new();
    harness.record_steady(2_000, 5_000_000, 5_000_000);
    harness.inject_pause(5_000_000_000);

    let interval = harness.stats.uncorrected_interval_histogram().unwrap();
    assert_eq!(interval.len(), 2_000);

    harness.stats.stop();
    harness.detector.shutdown();
}

#[test]
fn stopped_recorder_ignores_later_pauses() {
    let harness = Harness::new();
    harness.record_steady(2_000, 5_000_000, 5_000_000);

    harness.stats.stop();
    assert!(wait_until(Duration::from_secs(5), || {
        harness.detector.listener_count() == 1 // only the probe remains
    }));

    harness.inject_pause(5_000_000_000);
    let interval = harness.stats.interval_histogram().unwrap();
    assert_eq!(interval.len(), 2_000);

    harness.detector.shutdown();
}

#[test]
fn dropped_recorder_is_pruned_from_the_detector() {
    init_tracing();
    let clock = Clock::manual();
    let detector = Arc::new(DetectorCore::new());
    let stats = LatencyStats::builder()
        .pause_detector(Arc::clone(&detector) as Arc<dyn PauseDetector>)
        .clock(Arc::clone(&clock))
        .build()
        .unwrap();

    // Estimator (high priority) plus the recorder's tracker (normal).
    assert!(wait_until(Duration::from_secs(5), || {
        detector.listener_count() == 2
    }));

    drop(stats);

    // The next event finds both weak registrations dead and prunes them.
    detector.notify_pause(50_000_000, 1_000_000_000);
    assert!(wait_until(Duration::from_secs(5), || {
        detector.listener_count() == 0
    }));

    detector.shutdown();
}

#[test]
fn concurrent_writers_and_rotating_reader_lose_nothing() {
    init_tracing();
    let detector = Arc::new(DetectorCore::new());
    let stats = Arc::new(
        LatencyStats::builder()
            .pause_detector(Arc::clone(&detector) as Arc<dyn PauseDetector>)
            .build()
            .unwrap(),
    );

    let writer_count = 4;
    let per_writer = 100_000u64;

    let mut writers = Vec::new();
    for _ in 0..writer_count {
        let stats = Arc::clone(&stats);
        writers.push(thread::spawn(move || {
            for _ in 0..per_writer {
                stats.record_latency(1_000).unwrap();
            }
        }));
    }

    // Rotate aggressively while the writers hammer the active pair.
    let mut collected = Histogram::<u64>::new_with_bounds(1_000, 3_600_000_000_000, 2).unwrap();
    for _ in 0..100 {
        stats.add_interval_histogram_to(&mut collected).unwrap();
        thread::sleep(Duration::from_micros(200));
    }

    for writer in writers {
        writer.join().unwrap();
    }
    stats.add_interval_histogram_to(&mut collected).unwrap();

    assert_eq!(collected.len(), writer_count as u64 * per_writer);

    stats.stop();
    detector.shutdown();
}
