//! # Interruption Controller
//!
//! Barge-in handling: when the peer reports that the user spoke over it, everything
//! still queued for playback is discarded so the agent goes silent immediately.

use crate::audio::playback::{AudioClock, PlaybackScheduler, PlaybackSink};
use crate::state::SessionMetrics;
use tracing::info;

/// Outcome of one interruption.
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptionReport {
    /// Chunks that were scheduled or playing and got stopped
    pub stopped: usize,
    /// Seconds of queued audio that will never be heard
    pub discarded_seconds: f64,
    /// Clock time the timeline was reset to
    pub reset_to: f64,
}

/// Flushes the playback timeline on barge-in.
#[derive(Debug, Default)]
pub struct InterruptionController {
    interruptions: u64,
}

impl InterruptionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop all active chunks, clear the active set and reset the timeline to now.
    ///
    /// ## Guarantees:
    /// - afterwards the active set is empty
    /// - the next scheduled chunk starts at the current clock time, not after the
    ///   audio that was discarded
    /// - interrupting an idle scheduler is harmless (nothing stopped, timeline = now)
    pub fn interrupt<G: AudioClock + PlaybackSink>(
        &mut self,
        scheduler: &mut PlaybackScheduler<G>,
    ) -> InterruptionReport {
        let now = scheduler.now();
        let discarded_seconds = scheduler.queued_seconds();

        let stopped = scheduler.stop_all();
        scheduler.reset_timeline(now);

        self.interruptions += 1;
        SessionMetrics::bump(&scheduler.metrics().interruptions);
        info!(
            "Playback interrupted: {} chunk(s) stopped, {:.2}s discarded",
            stopped.len(),
            discarded_seconds
        );

        InterruptionReport {
            stopped: stopped.len(),
            discarded_seconds,
            reset_to: now,
        }
    }

    /// Number of interruptions handled so far.
    pub fn count(&self) -> u64 {
        self.interruptions
    }
}
