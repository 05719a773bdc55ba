//! Consensus Pause Detector
//!
//! Discovers process-wide stalls by consensus across N observer threads. A
//! stall local to one thread (a blocked syscall, a descheduled core) delays
//! only that observer; the shared consensus time keeps moving, and nothing
//! is reported. A stall that delays *every* observer shows up as a gap in
//! the consensus time, and exactly one observer — the CAS winner that moves
//! the time forward over the gap — reports it.
//!
//! Each observer also tracks the shortest time it has ever taken around its
//! own loop, and subtracts it from the observed gap, so sleep cadence and
//! loop overhead are not misread as a pause.

use super::{DetectorCore, ListenerId, ListenerPriority, PauseDetector, PauseListener, PauseNotifier};
use crate::config::{
    DEFAULT_DETECTOR_SLEEP_INTERVAL, DEFAULT_DETECTOR_THREADS, DEFAULT_NOTIFICATION_THRESHOLD,
    MAX_DETECTOR_THREADS,
};
use crate::time::Clock;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct ObserverShared {
    clock: Arc<Clock>,
    sleep_interval: u64,
    notification_threshold: u64,
    /// Bit set covering every observer thread this detector owns.
    all_threads_mask: u64,
    consensus_latest_time: AtomicU64,
    /// Test facility: observers whose bit is set busy-loop instead of
    /// observing, simulating a stalled thread.
    stall_thread_mask: AtomicU64,
    stop_thread_mask: AtomicU64,
}

/// Pause detector backed by consensus observer threads.
pub struct SimplePauseDetector {
    core: DetectorCore,
    shared: Arc<ObserverShared>,
    observers: Mutex<Vec<thread::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl SimplePauseDetector {
    /// Creates a detector with the default sleep interval (1 ms),
    /// notification threshold (1 ms), and observer count (3), on the system
    /// clock.
    pub fn new() -> Result<SimplePauseDetector> {
        Self::with_config(
            DEFAULT_DETECTOR_SLEEP_INTERVAL,
            DEFAULT_NOTIFICATION_THRESHOLD,
            DEFAULT_DETECTOR_THREADS,
        )
    }

    /// Creates a detector on the system clock.
    ///
    /// `sleep_interval` is how long observers sleep between observations (0
    /// spins continuously); pauses shorter than `notification_threshold` are
    /// not reported; `threads` must be in `1..=64`.
    pub fn with_config(
        sleep_interval: u64,
        notification_threshold: u64,
        threads: usize,
    ) -> Result<SimplePauseDetector> {
        Self::with_clock(sleep_interval, notification_threshold, threads, Clock::system())
    }

    /// Creates a detector on an explicit clock. With a manual clock the
    /// observers advance only when the test moves time.
    pub fn with_clock(
        sleep_interval: u64,
        notification_threshold: u64,
        threads: usize,
        clock: Arc<Clock>,
    ) -> Result<SimplePauseDetector> {
        if threads == 0 || threads > MAX_DETECTOR_THREADS {
            return Err(Error::InvalidDetectorThreads(threads));
        }

        let core = DetectorCore::new();
        let shared = Arc::new(ObserverShared {
            clock,
            sleep_interval,
            notification_threshold,
            all_threads_mask: if threads == MAX_DETECTOR_THREADS {
                u64::MAX
            } else {
                (1u64 << threads) - 1
            },
            consensus_latest_time: AtomicU64::new(0),
            stall_thread_mask: AtomicU64::new(0),
            stop_thread_mask: AtomicU64::new(0),
        });

        let mut observers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = Arc::clone(&shared);
            let notifier = core.notifier();
            let handle = thread::Builder::new()
                .name(format!("hindsight-pause-observer-{index}"))
                .spawn(move || observer_loop(&shared, &notifier, 1u64 << index))
                .expect("failed to spawn pause observer thread");
            observers.push(handle);
        }

        Ok(SimplePauseDetector {
            core,
            shared,
            observers: Mutex::new(observers),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Test facility: stalls the observers selected by `thread_mask` for
    /// `stall_length` nanoseconds, then releases them.
    ///
    /// On a manual clock, time is advanced in sub-threshold steps so that
    /// the jumps themselves cannot register as pauses on unstalled
    /// observers; on the system clock this simply sleeps while the selected
    /// observers spin.
    pub fn stall_detector_threads(&self, thread_mask: u64, stall_length: u64) {
        let saved_mask = self.shared.stall_thread_mask.swap(thread_mask, Ordering::SeqCst);

        if self.shared.clock.is_manual() {
            let full = self.shared.all_threads_mask;
            let all_stalled = thread_mask & full == full;
            let end = self.shared.clock.now_nanos().saturating_add(stall_length);
            let step = (self.shared.notification_threshold / 2).max(1);
            loop {
                let now = self.shared.clock.now_nanos();
                if now >= end {
                    break;
                }
                self.shared.clock.advance(step.min(end - now));
                if all_stalled {
                    // Nobody can observe the step; just let it propagate.
                    thread::sleep(Duration::from_micros(500));
                } else {
                    // Pace the steps so every observer gets wall time to run
                    // an iteration, then wait for the consensus to cover the
                    // step before taking the next one.
                    thread::sleep(Duration::from_micros(200));
                    self.wait_for_consensus_catch_up();
                }
            }
        } else {
            thread::sleep(Duration::from_nanos(stall_length));
        }

        self.shared.stall_thread_mask.store(saved_mask, Ordering::SeqCst);
    }

    /// Waits (briefly, with a timeout) until some unstalled observer has
    /// moved the consensus up to the current manual time, so that stepped
    /// time advances are observed one step at a time.
    fn wait_for_consensus_catch_up(&self) {
        let deadline = Instant::now() + Duration::from_millis(500);
        while self.shared.consensus_latest_time.load(Ordering::SeqCst)
            < self.shared.clock.now_nanos()
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_micros(50));
        }
    }

    /// Test facility: moves the consensus time forward without the skip
    /// being reported as a pause. Useful after a large manual-time jump.
    pub fn skip_consensus_time_to(&self, new_consensus_time: u64) {
        self.shared
            .consensus_latest_time
            .store(new_consensus_time, Ordering::SeqCst);
    }

    /// The configured notification threshold, in nanoseconds.
    pub fn notification_threshold(&self) -> u64 {
        self.shared.notification_threshold
    }
}

impl PauseDetector for SimplePauseDetector {
    fn add_listener(
        &self,
        listener: &Arc<dyn PauseListener>,
        priority: ListenerPriority,
    ) -> ListenerId {
        self.core.add_listener(listener, priority)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.core.remove_listener(id)
    }

    fn listener_count(&self) -> usize {
        self.core.listener_count()
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down pause detector");
        self.shared.stop_thread_mask.store(u64::MAX, Ordering::SeqCst);

        let handles: Vec<_> = self.observers.lock().drain(..).collect();
        for handle in &handles {
            handle.thread().unpark();
        }
        for handle in handles {
            let _ = handle.join();
        }

        // Observers are gone; drain whatever they already published.
        self.core.shutdown();
    }
}

impl Drop for SimplePauseDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn observer_loop(shared: &ObserverShared, notifier: &PauseNotifier, thread_mask: u64) {
    let stopping = || shared.stop_thread_mask.load(Ordering::SeqCst) & thread_mask != 0;
    let stalled = || shared.stall_thread_mask.load(Ordering::SeqCst) & thread_mask != 0;

    let mut shortest_observed_loop = u64::MAX;

    let mut observed_last_update = shared.consensus_latest_time.load(Ordering::SeqCst);
    let mut now = shared.clock.now_nanos();
    let mut prev_now = now;
    let _ = shared.consensus_latest_time.compare_exchange(
        observed_last_update,
        now,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );

    while !stopping() {
        if shared.sleep_interval > 0 {
            shared
                .clock
                .sleep_interruptibly(shared.sleep_interval, &stopping);
        }

        while stalled() && !stopping() {
            core::hint::spin_loop();
        }

        observed_last_update = shared.consensus_latest_time.load(Ordering::SeqCst);
        // The consensus sample above happens-before this time read, so the
        // delta can only under-report a gap, never invent one.
        now = shared.clock.now_nanos();

        shortest_observed_loop =
            shortest_observed_loop.min(now.saturating_sub(prev_now));

        // Move the consensus forward as long as it is in the past. Exactly
        // one observer wins the race over any given gap.
        while now > observed_last_update {
            match shared.consensus_latest_time.compare_exchange(
                observed_last_update,
                now,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let delta = now - observed_last_update;
                    let hiccup = delta.saturating_sub(shortest_observed_loop);
                    if hiccup > shared.notification_threshold {
                        debug!(
                            hiccup_nanos = hiccup,
                            end_time = now,
                            "process-wide pause detected"
                        );
                        notifier.notify(hiccup, now);
                    }
                    break;
                }
                Err(current) => observed_last_update = current,
            }
        }

        prev_now = now;
    }

    trace!("pause observer terminating");
}
