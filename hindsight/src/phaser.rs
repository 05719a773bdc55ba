//! Phased Writer-Reader Lock
//!
//! An asymmetric synchronization primitive: writer critical sections are
//! wait-free (two atomic fetch-adds), readers exclude only each other, and a
//! reader-side *phase flip* returns only once every writer critical section
//! that was in flight when the flip began has completed. No CAS is needed on
//! any path; the whole protocol is fetch-add, swap, and load.
//!
//! # Protocol
//!
//! Three monotonically increasing epoch counters: `start_epoch`, and one end
//! epoch per parity (`even_end_epoch` starts at 0, `odd_end_epoch` at 1). A
//! writer bumps `start_epoch` by 2 on entry, keeping the prior value as its
//! token, and on exit bumps the end epoch matching the token's parity. The
//! flip primes the *next* phase's end epoch to its base value, swaps
//! `start_epoch` to that base (capturing the pre-flip start value), and spins
//! until the *previous* phase's end epoch catches up to the captured value —
//! at which instant every writer that entered under the previous parity has
//! exited.
//!
//! # Memory Ordering
//!
//! All epoch operations use `SeqCst`: the flip's correctness relies on a
//! total order between writer entries/exits and the swap, and the recording
//! hot path is dominated by the histogram update, not the fences.

use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::busy_wait;
use parking_lot::{Mutex, MutexGuard};

/// The phased writer-reader lock guarding histogram recording and rotation.
pub struct RecordingPhaser {
    start_epoch: AtomicU64,
    even_end_epoch: AtomicU64,
    odd_end_epoch: AtomicU64,
    reader_lock: Mutex<()>,
}

/// RAII token for one writer critical section.
///
/// The matching exit runs when this guard drops, on every path — early
/// returns and panics included. A flip can otherwise wait forever on a
/// writer that never signalled its exit.
#[must_use = "the critical section ends when this guard is dropped"]
pub struct WriterCriticalSection<'a> {
    phaser: &'a RecordingPhaser,
    token: u64,
}

/// Reader-side guard: mutual exclusion between readers, and the only
/// capability from which [`ReaderGuard::flip_phase`] can be invoked.
#[must_use = "the reader section ends when this guard is dropped"]
pub struct ReaderGuard<'a> {
    phaser: &'a RecordingPhaser,
    _lock: MutexGuard<'a, ()>,
}

impl RecordingPhaser {
    /// Creates a phaser with no writer in flight, in the even phase.
    pub fn new() -> RecordingPhaser {
        RecordingPhaser {
            start_epoch: AtomicU64::new(0),
            even_end_epoch: AtomicU64::new(0),
            odd_end_epoch: AtomicU64::new(1),
            reader_lock: Mutex::new(()),
        }
    }

    /// Enters a writer critical section. Wait-free.
    #[inline]
    pub fn writer_critical_section(&self) -> WriterCriticalSection<'_> {
        let token = self.start_epoch.fetch_add(2, Ordering::SeqCst);
        WriterCriticalSection {
            phaser: self,
            token,
        }
    }

    /// Acquires the reader lock. Readers block only against each other.
    pub fn reader_lock(&self) -> ReaderGuard<'_> {
        ReaderGuard {
            phaser: self,
            _lock: self.reader_lock.lock(),
        }
    }

    #[inline]
    fn writer_exit(&self, token: u64) {
        // Parity was sampled at entry; exits must bump the matching epoch
        // or the flip's catch-up equality never holds.
        if token & 1 == 0 {
            self.even_end_epoch.fetch_add(2, Ordering::SeqCst);
        } else {
            self.odd_end_epoch.fetch_add(2, Ordering::SeqCst);
        }
    }

    fn flip_phase(&self) {
        let next_phase_is_odd = self.start_epoch.load(Ordering::SeqCst) & 1 == 0;

        // Prime the next phase's end epoch to its base value before any
        // writer can enter that phase.
        let initial_start_value = if next_phase_is_odd {
            self.odd_end_epoch.store(1, Ordering::SeqCst);
            1
        } else {
            self.even_end_epoch.store(0, Ordering::SeqCst);
            0
        };

        // Begin the new phase, capturing where the old one stopped.
        let start_value_at_flip = self.start_epoch.swap(initial_start_value, Ordering::SeqCst);

        // Wait for all writers of the previous phase to drain. Bounded by
        // the longest writer critical section, so this stays non-blocking as
        // long as the critical sections themselves are wait-free.
        let previous_end = if next_phase_is_odd {
            &self.even_end_epoch
        } else {
            &self.odd_end_epoch
        };
        while previous_end.load(Ordering::SeqCst) != start_value_at_flip {
            busy_wait();
        }
    }
}

impl Default for RecordingPhaser {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WriterCriticalSection<'_> {
    #[inline]
    fn drop(&mut self) {
        self.phaser.writer_exit(self.token);
    }
}

impl ReaderGuard<'_> {
    /// Flips the phase. Returns only after every writer critical section
    /// that may have been in flight when the call was made has completed.
    ///
    /// Requiring the reader guard makes "flip without holding the reader
    /// lock" a compile error rather than a runtime condition.
    pub fn flip_phase(&self) {
        self.phaser.flip_phase();
    }
}
