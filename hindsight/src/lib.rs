//! Hindsight: Pause-Aware Latency Statistics
//!
//! This crate records observed operation latencies into histograms whose tail
//! percentiles survive process-wide execution stalls. Naive latency
//! measurement only records operations that completed, silently omitting the
//! ones that *would* have run during a stall (the "coordinated omission"
//! bias). Hindsight detects such stalls by consensus across observer threads
//! and synthesises the missing samples, so reported percentiles reflect what
//! callers actually experienced.
//!
//! # Architecture
//!
//! The crate is organised into three cooperating subsystems:
//! - [`detector`]: consensus pause detection across observer threads, with
//!   prioritised listener dispatch
//! - [`estimator`]: a time-capped moving-window estimate of the expected
//!   interval between recordings, aware of reported pauses
//! - [`stats`]: the [`LatencyStats`] recorder combining wait-free value
//!   recording, pause-driven correction synthesis, and a non-blocking
//!   reader/writer phase flip over double-buffered histograms
//!
//! Supporting modules: [`phaser`] (the wait-free writer / phase-flipping
//! reader protocol), [`histogram`] (a concurrent handle over
//! [`hdrhistogram`]), [`time`] (real and manual clocks plus a periodic
//! scheduler), and [`sync`] (Loom-conditional atomics).
//!
//! # Recording guarantees
//!
//! `record_latency` is wait-free up to the underlying histogram's `record`:
//! phaser entry/exit and the estimator tick use only atomic fetch-add plus an
//! array store, and no allocation happens on the hot path. Only interval
//! readers block, and only against each other.
//!
//! # Example
//!
//! ```rust
//! # fn main() -> hindsight::Result<()> {
//! use hindsight::LatencyStats;
//!
//! let stats = LatencyStats::new()?;
//!
//! // Hot path: called from any number of threads concurrently.
//! stats.record_latency(250_000)?; // 250 µs
//! stats.record_latency(375_000)?;
//!
//! // Reader: rotates the recording histograms and returns the interval
//! // since the previous read, pause corrections included.
//! let interval = stats.interval_histogram()?;
//! assert_eq!(interval.len(), 2);
//!
//! stats.stop();
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `loom`: swap the core atomics for Loom's model-checking atomics. Used
//!   only by the model tests:
//!   `RUSTFLAGS="--cfg loom" cargo test --features loom --test loom_phaser --release`
//!
//! # References
//!
//! - Gil Tene. "How NOT to Measure Latency." QCon, 2013.
//! - The HdrHistogram value quantization scheme, as implemented by the
//!   [`hdrhistogram`] crate this crate records into.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod sync;

pub mod detector;
pub mod estimator;
pub mod histogram;
pub mod phaser;
pub mod stats;
pub mod time;

pub use detector::{
    DetectorCore, ListenerId, ListenerPriority, PauseDetector, PauseListener, SimplePauseDetector,
};
pub use estimator::{
    IntervalEstimator, MovingAverageIntervalEstimator, TimeCappedMovingAverageIntervalEstimator,
    IMPOSSIBLY_LARGE,
};
pub use histogram::ConcurrentHistogram;
pub use phaser::RecordingPhaser;
pub use stats::{
    default_pause_detector, set_default_pause_detector, shutdown_default_pause_detector,
    IntervalSnapshot, LatencyStats, LatencyStatsBuilder,
};
pub use time::{Clock, PeriodicTask, Scheduler};

/// Error type for hindsight operations
#[derive(Debug)]
pub enum Error {
    /// Histogram construction rejected the configured range or precision
    HistogramCreation(hdrhistogram::errors::CreationError),
    /// A value could not be recorded (typically above the highest trackable)
    Record(hdrhistogram::errors::RecordError),
    /// Histogram contents could not be merged into the target
    HistogramAdd(hdrhistogram::errors::AdditionError),
    /// Pause detector thread count outside the supported 1..=64 range
    InvalidDetectorThreads(usize),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::HistogramCreation(e) => write!(f, "histogram creation failed: {:?}", e),
            Error::Record(e) => write!(f, "value could not be recorded: {:?}", e),
            Error::HistogramAdd(e) => write!(f, "histogram merge failed: {:?}", e),
            Error::InvalidDetectorThreads(n) => {
                write!(f, "detector thread count must be in 1..=64, got {}", n)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<hdrhistogram::errors::CreationError> for Error {
    fn from(e: hdrhistogram::errors::CreationError) -> Self {
        Error::HistogramCreation(e)
    }
}

impl From<hdrhistogram::errors::RecordError> for Error {
    fn from(e: hdrhistogram::errors::RecordError) -> Self {
        Error::Record(e)
    }
}

impl From<hdrhistogram::errors::AdditionError> for Error {
    fn from(e: hdrhistogram::errors::AdditionError) -> Self {
        Error::HistogramAdd(e)
    }
}

/// Result type for hindsight operations
pub type Result<T> = core::result::Result<T, Error>;

/// Compile-time configuration constants
pub mod config {
    /// Default lowest trackable latency, in nanoseconds (1 µs)
    pub const DEFAULT_LOWEST_TRACKABLE_LATENCY: u64 = 1_000;

    /// Default highest trackable latency, in nanoseconds (1 hour)
    pub const DEFAULT_HIGHEST_TRACKABLE_LATENCY: u64 = 3_600_000_000_000;

    /// Default number of significant value digits kept by the histograms
    pub const DEFAULT_SIGNIFICANT_DIGITS: u8 = 2;

    /// Default interval estimator window length (rounded up to a power of 2)
    pub const DEFAULT_ESTIMATOR_WINDOW: usize = 1024;

    /// Default estimator time cap, in nanoseconds (10 s)
    pub const DEFAULT_ESTIMATOR_TIME_CAP: u64 = 10_000_000_000;

    /// Default observer thread sleep interval, in nanoseconds (1 ms)
    pub const DEFAULT_DETECTOR_SLEEP_INTERVAL: u64 = 1_000_000;

    /// Default pause notification threshold, in nanoseconds (1 ms)
    pub const DEFAULT_NOTIFICATION_THRESHOLD: u64 = 1_000_000;

    /// Default number of consensus observer threads
    pub const DEFAULT_DETECTOR_THREADS: usize = 3;

    /// Maximum number of consensus observer threads (bitmask-bounded)
    pub const MAX_DETECTOR_THREADS: usize = 64;

    /// Capacity of the estimator's ring of in-flight pause records
    pub const MAX_TRACKED_PAUSES: usize = 32;

    /// Number of writer shards in a [`crate::ConcurrentHistogram`]
    pub const HISTOGRAM_SHARDS: usize = 8;

    /// Capacity of the pause detector's dispatch queue
    pub const DETECTOR_QUEUE_CAPACITY: usize = 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_descriptive() {
        let err = Error::InvalidDetectorThreads(65);
        let text = err.to_string();
        assert!(text.contains("1..=64"));
        assert!(text.contains("65"));
    }

    #[test]
    fn creation_error_converts() {
        let res = hdrhistogram::Histogram::<u64>::new_with_bounds(0, 100, 2);
        let err: Error = res.unwrap_err().into();
        assert!(matches!(err, Error::HistogramCreation(_)));
    }
}
