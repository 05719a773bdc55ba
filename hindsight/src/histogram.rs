//! Concurrent Histogram Handle
//!
//! A thin accessor that gives [`hdrhistogram::Histogram`] a `record` usable
//! from concurrent writers. The `hdrhistogram` crate records through
//! `&mut self` and ships no atomic-bucket variant, so the handle stripes
//! writers across a small power-of-two set of cache-padded shards, each a
//! short mutex around one histogram. A writer try-locks starting at its home
//! shard and takes the first free one; with at least as many shards as
//! concurrently recording threads the probe succeeds on the first attempt
//! and recording never blocks.
//!
//! Reader-side operations (`reset`, merges, counts) lock shards in index
//! order. The recorder only calls them on a histogram pair that the phase
//! flip has already drained of writers, so they are uncontended there.

use crate::config::HISTOGRAM_SHARDS;
use crate::Result;
use crossbeam_utils::CachePadded;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Returns this thread's stable shard slot, assigned round-robin on first
/// use (the same slot is used against every handle in the process).
fn home_slot() -> usize {
    static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static SLOT: Cell<usize> = const { Cell::new(usize::MAX) };
    }

    SLOT.with(|slot| {
        let current = slot.get();
        if current != usize::MAX {
            return current;
        }
        let assigned = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
        slot.set(assigned);
        assigned
    })
}

/// A histogram that multiple threads can record into concurrently.
///
/// Construction parameters mirror the underlying histogram: lowest
/// discernible value, highest trackable value, and significant value digits.
/// Millisecond start/end stamps ride along so interval reads can report the
/// window they cover.
pub struct ConcurrentHistogram {
    shards: Box<[CachePadded<Mutex<Histogram<u64>>>]>,
    shard_mask: usize,
    start_time_ms: AtomicU64,
    end_time_ms: AtomicU64,
}

impl ConcurrentHistogram {
    /// Creates a handle whose shards all track `lowest..=highest` at
    /// `significant_digits` precision.
    pub fn new(lowest: u64, highest: u64, significant_digits: u8) -> Result<ConcurrentHistogram> {
        let mut shards = Vec::with_capacity(HISTOGRAM_SHARDS);
        for _ in 0..HISTOGRAM_SHARDS {
            shards.push(CachePadded::new(Mutex::new(Histogram::new_with_bounds(
                lowest,
                highest,
                significant_digits,
            )?)));
        }
        Ok(ConcurrentHistogram {
            shards: shards.into_boxed_slice(),
            shard_mask: HISTOGRAM_SHARDS - 1,
            start_time_ms: AtomicU64::new(0),
            end_time_ms: AtomicU64::new(0),
        })
    }

    /// Records a single value. Out-of-range values propagate the underlying
    /// histogram's error.
    #[inline]
    pub fn record(&self, value: u64) -> Result<()> {
        self.with_writer_shard(|shard| shard.record(value))
    }

    /// Records `value` and linearly back-fills synthetic samples at stride
    /// `interval` down to `interval`, compensating for samples an expected
    /// steady rate would have produced.
    pub fn record_with_expected_interval(&self, value: u64, interval: u64) -> Result<()> {
        self.with_writer_shard(|shard| shard.record_correct(value, interval))
    }

    #[inline]
    fn with_writer_shard(
        &self,
        record: impl Fn(&mut Histogram<u64>) -> core::result::Result<(), hdrhistogram::errors::RecordError>,
    ) -> Result<()> {
        let home = home_slot();
        for probe in 0..self.shards.len() {
            if let Some(mut shard) = self.shards[(home + probe) & self.shard_mask].try_lock() {
                return Ok(record(&mut shard)?);
            }
        }
        // Every shard is momentarily busy; fall back to waiting on home.
        Ok(record(&mut self.shards[home & self.shard_mask].lock())?)
    }

    /// Clears all recorded counts. Time stamps are left untouched.
    pub fn reset(&self) {
        for shard in self.shards.iter() {
            shard.lock().reset();
        }
    }

    /// Adds this handle's counts into `target`.
    pub fn add_into(&self, target: &mut Histogram<u64>) -> Result<()> {
        for shard in self.shards.iter() {
            target.add(&*shard.lock())?;
        }
        Ok(())
    }

    /// Overwrites `target` with this handle's counts.
    pub fn copy_into(&self, target: &mut Histogram<u64>) -> Result<()> {
        target.reset();
        self.add_into(target)
    }

    /// Total number of recorded values across all shards.
    pub fn total_count(&self) -> u64 {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Stamps the start of the recording window, in wall-clock milliseconds.
    pub fn set_start_time_ms(&self, millis: u64) {
        self.start_time_ms.store(millis, Ordering::Release);
    }

    /// The stamped start of the recording window.
    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms.load(Ordering::Acquire)
    }

    /// Stamps the end of the recording window, in wall-clock milliseconds.
    pub fn set_end_time_ms(&self, millis: u64) {
        self.end_time_ms.store(millis, Ordering::Release);
    }

    /// The stamped end of the recording window.
    pub fn end_time_ms(&self) -> u64 {
        self.end_time_ms.load(Ordering::Acquire)
    }
}
