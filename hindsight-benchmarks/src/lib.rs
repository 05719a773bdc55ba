//! Shared scaffolding for the hindsight benchmarks.

use hindsight::{Clock, DetectorCore, LatencyStats, PauseDetector};
use std::sync::Arc;

/// Builds a default-configured recorder wired to an inert detector, so
/// benchmark numbers are not perturbed by consensus observer threads.
pub fn build_stats() -> (Arc<DetectorCore>, LatencyStats) {
    let detector = Arc::new(DetectorCore::new());
    let stats = LatencyStats::builder()
        .pause_detector(Arc::clone(&detector) as Arc<dyn PauseDetector>)
        .clock(Clock::system())
        .build()
        .expect("default configuration must build");
    (detector, stats)
}
