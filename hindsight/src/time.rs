//! Clock Facade and Periodic Scheduler
//!
//! All time observed by this crate flows through a [`Clock`], which is either
//! backed by the host monotonic clock or driven manually by tests. Manual
//! time never moves on its own: sleepers park on a condvar that is notified
//! by [`Clock::advance`] / [`Clock::set_now`], and the [`Scheduler`] fires
//! periodic tasks against the same notion of time, so a test can step a whole
//! pipeline of detector threads and scheduled work deterministically.
//!
//! Clocks are injected (`Arc<Clock>`); [`Clock::system`] returns the shared
//! process-wide default.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Longest single park while sleeping on the system clock. Bounds the
/// latency of cooperative cancellation for callers that cannot unpark us.
const MAX_PARK: Duration = Duration::from_millis(10);

/// Poll interval for manual-clock waits; re-checks the cancel flag without
/// affecting when (in manual time) the sleep completes.
const MANUAL_POLL: Duration = Duration::from_millis(5);

/// A monotonic nanosecond clock, real or manually driven.
pub struct Clock {
    inner: ClockInner,
}

enum ClockInner {
    System { origin: Instant },
    Manual(ManualState),
}

struct ManualState {
    now_nanos: Mutex<u64>,
    tick: Condvar,
}

impl Clock {
    /// The shared process-wide system clock.
    pub fn system() -> Arc<Clock> {
        static SYSTEM: LazyLock<Arc<Clock>> = LazyLock::new(|| {
            Arc::new(Clock {
                inner: ClockInner::System {
                    origin: Instant::now(),
                },
            })
        });
        Arc::clone(&SYSTEM)
    }

    /// A manually driven clock starting at zero. Time moves only through
    /// [`Clock::advance`] or [`Clock::set_now`].
    pub fn manual() -> Arc<Clock> {
        Arc::new(Clock {
            inner: ClockInner::Manual(ManualState {
                now_nanos: Mutex::new(0),
                tick: Condvar::new(),
            }),
        })
    }

    /// Whether this clock is manually driven.
    pub fn is_manual(&self) -> bool {
        matches!(self.inner, ClockInner::Manual(_))
    }

    /// Current time in nanoseconds since the clock's origin.
    pub fn now_nanos(&self) -> u64 {
        match &self.inner {
            ClockInner::System { origin } => origin.elapsed().as_nanos() as u64,
            ClockInner::Manual(state) => *state.now_nanos.lock(),
        }
    }

    /// Current wall-clock time in milliseconds. For manual clocks this is
    /// simply the nanosecond time scaled down.
    pub fn now_millis(&self) -> u64 {
        match &self.inner {
            ClockInner::System { .. } => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            ClockInner::Manual(state) => *state.now_nanos.lock() / 1_000_000,
        }
    }

    /// Moves a manual clock forward by `delta_nanos` and wakes all sleepers.
    ///
    /// # Panics
    ///
    /// Panics if called on the system clock.
    pub fn advance(&self, delta_nanos: u64) {
        match &self.inner {
            ClockInner::System { .. } => {
                panic!("advance() is only available on a manual clock")
            }
            ClockInner::Manual(state) => {
                let mut now = state.now_nanos.lock();
                *now = now.saturating_add(delta_nanos);
                state.tick.notify_all();
            }
        }
    }

    /// Sets a manual clock to an absolute time and wakes all sleepers.
    ///
    /// # Panics
    ///
    /// Panics if called on the system clock.
    pub fn set_now(&self, now_nanos: u64) {
        match &self.inner {
            ClockInner::System { .. } => {
                panic!("set_now() is only available on a manual clock")
            }
            ClockInner::Manual(state) => {
                *state.now_nanos.lock() = now_nanos;
                state.tick.notify_all();
            }
        }
    }

    /// Sleeps for `duration_nanos`. On a manual clock this parks until time
    /// has been moved past the deadline.
    pub fn sleep_nanos(&self, duration_nanos: u64) {
        match &self.inner {
            ClockInner::System { .. } => thread::sleep(Duration::from_nanos(duration_nanos)),
            ClockInner::Manual(state) => {
                let mut now = state.now_nanos.lock();
                let deadline = now.saturating_add(duration_nanos);
                while *now < deadline {
                    state.tick.wait(&mut now);
                }
            }
        }
    }

    /// Blocks until the clock reads at least `deadline_nanos`.
    pub fn wait_until(&self, deadline_nanos: u64) {
        match &self.inner {
            ClockInner::System { origin } => {
                let now = origin.elapsed().as_nanos() as u64;
                if deadline_nanos > now {
                    thread::sleep(Duration::from_nanos(deadline_nanos - now));
                }
            }
            ClockInner::Manual(state) => {
                let mut now = state.now_nanos.lock();
                while *now < deadline_nanos {
                    state.tick.wait(&mut now);
                }
            }
        }
    }

    /// Sleeps for `duration_nanos`, returning early once `should_cancel`
    /// reports true. Cancellation latency is bounded even when the canceller
    /// cannot notify us: system sleeps park in bounded chunks (and wake
    /// immediately on `unpark`), manual sleeps re-poll the flag.
    pub fn sleep_interruptibly(&self, duration_nanos: u64, should_cancel: &dyn Fn() -> bool) {
        match &self.inner {
            ClockInner::System { .. } => {
                let deadline = Instant::now() + Duration::from_nanos(duration_nanos);
                loop {
                    if should_cancel() {
                        return;
                    }
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return;
                    };
                    thread::park_timeout(remaining.min(MAX_PARK));
                }
            }
            ClockInner::Manual(state) => {
                let mut now = state.now_nanos.lock();
                let deadline = now.saturating_add(duration_nanos);
                while *now < deadline && !should_cancel() {
                    state.tick.wait_for(&mut now, MANUAL_POLL);
                }
            }
        }
    }
}

impl core::fmt::Debug for Clock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.inner {
            ClockInner::System { .. } => f.debug_struct("Clock::system").finish(),
            ClockInner::Manual(_) => f
                .debug_struct("Clock::manual")
                .field("now_nanos", &self.now_nanos())
                .finish(),
        }
    }
}

/// A task the [`Scheduler`] fires periodically.
pub trait PeriodicTask: Send + Sync + 'static {
    /// Runs one firing of the task.
    fn run(&self);
}

impl<F> PeriodicTask for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn run(&self) {
        self()
    }
}

struct ScheduleEntry {
    next_due: u64,
    period: u64,
    task: Weak<dyn PeriodicTask>,
}

struct SchedulerShared {
    clock: Arc<Clock>,
    entries: Mutex<Vec<ScheduleEntry>>,
    shutdown: AtomicBool,
    /// Bumped on every schedule change so a sleeping worker re-plans
    /// instead of waiting out a stale deadline.
    wake_generation: AtomicU64,
}

/// Fires periodic tasks against a [`Clock`], honoring manual time.
///
/// Tasks are held weakly: a task whose last strong reference is dropped is
/// removed at its next due time and never fired again, so forgetting to
/// cancel does not leak work.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Idle delay when no task is scheduled.
const SCHEDULER_IDLE_NANOS: u64 = 50_000_000;

impl Scheduler {
    /// Spawns the scheduler worker against the given clock.
    pub fn new(clock: Arc<Clock>) -> Scheduler {
        let shared = Arc::new(SchedulerShared {
            clock,
            entries: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            wake_generation: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("hindsight-scheduler".into())
            .spawn(move || Self::worker_loop(&worker_shared))
            .expect("failed to spawn scheduler thread");
        Scheduler {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Schedules `task` to fire every `period_nanos`, first firing one period
    /// from now. The scheduler keeps only a weak reference.
    pub fn schedule_repeating(&self, period_nanos: u64, task: &Arc<dyn PeriodicTask>) {
        let period = period_nanos.max(1);
        let next_due = self.shared.clock.now_nanos().saturating_add(period);
        self.shared.entries.lock().push(ScheduleEntry {
            next_due,
            period,
            task: Arc::downgrade(task),
        });
        self.shared.wake_generation.fetch_add(1, Ordering::AcqRel);
        self.wake_worker();
    }

    /// Stops the worker thread. Idempotent; pending due tasks are not fired.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.wake_worker();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn wake_worker(&self) {
        if let Some(handle) = self.worker.lock().as_ref() {
            handle.thread().unpark();
        }
    }

    fn worker_loop(shared: &SchedulerShared) {
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }

            let now = shared.clock.now_nanos();
            let mut due: Vec<Arc<dyn PeriodicTask>> = Vec::new();
            let mut earliest = u64::MAX;
            {
                let mut entries = shared.entries.lock();
                entries.retain_mut(|entry| {
                    if entry.next_due <= now {
                        let Some(task) = entry.task.upgrade() else {
                            return false;
                        };
                        due.push(task);
                        // Fire once per pass; skip firings missed during a
                        // large manual-time jump rather than bursting.
                        while entry.next_due <= now {
                            entry.next_due = entry.next_due.saturating_add(entry.period);
                        }
                    }
                    earliest = earliest.min(entry.next_due);
                    true
                });
            }

            // Run outside the entries lock so a task may schedule more work.
            for task in due {
                task.run();
            }

            let delay = earliest
                .saturating_sub(shared.clock.now_nanos())
                .min(SCHEDULER_IDLE_NANOS)
                .max(1);
            let generation = shared.wake_generation.load(Ordering::Acquire);
            shared.clock.sleep_interruptibly(delay, &|| {
                shared.shutdown.load(Ordering::Acquire)
                    || shared.wake_generation.load(Ordering::Acquire) != generation
            });
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
