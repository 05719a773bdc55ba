//! Conditional Synchronization Primitives
//!
//! A unified facade over atomic types that works with both standard library
//! atomics and Loom's model-checking atomics. The phaser and the interval
//! estimators go through this module so their interleavings can be explored
//! exhaustively under Loom.
//!
//! In standard mode (without the `loom` feature) everything here is a
//! zero-cost re-export of `core::sync::atomic`.
//!
//! # Loom Integration
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test --features loom --test loom_phaser --release
//! ```

#[cfg(all(feature = "loom", loom))]
pub mod atomic {
    //! Atomic types for Loom model checking.

    pub use loom::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod atomic {
    //! Standard library atomic types.

    pub use core::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
}

/// One turn of a spin-wait loop.
///
/// Under Loom this yields to the model scheduler so that spinning threads
/// cannot starve the writers they are waiting on; in standard mode it is the
/// plain CPU spin hint.
#[inline]
pub fn busy_wait() {
    #[cfg(all(feature = "loom", loom))]
    loom::thread::yield_now();

    #[cfg(not(all(feature = "loom", loom)))]
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::atomic::{AtomicU64, Ordering};

    #[test]
    fn facade_atomics_behave() {
        let counter = AtomicU64::new(0);
        assert_eq!(counter.fetch_add(2, Ordering::SeqCst), 0);
        assert_eq!(counter.swap(7, Ordering::SeqCst), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn busy_wait_is_callable() {
        for _ in 0..4 {
            super::busy_wait();
        }
    }
}
