//! # Session State and Metrics
//!
//! The state an external UI observes, and the counters every pipeline stage updates.
//!
//! ## Two kinds of shared state:
//! - **SessionSnapshot**: status, mute flag and last error, published through a
//!   `tokio::sync::watch` channel whenever the session changes
//! - **SessionMetrics**: plain atomic counters, because the capture callback runs on a
//!   real-time thread and must never wait on a lock
//!
//! ## Counters:
//! The capture callback increments counters for every frame from the device thread.
//! Every counter is a relaxed atomic and readers only ever load.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Lifecycle status of a live session.
///
/// ## Transitions:
/// `Idle → Connecting → Live → {Closed, Error}`, with `Connecting → Error` on setup
/// failure. `Closed` and `Error` may connect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session has been started yet
    Idle,
    /// Microphone and transport are being acquired
    Connecting,
    /// Transport is open and audio flows both ways
    Live,
    /// Session ended by the user or by the peer
    Closed,
    /// Session failed; see `SessionSnapshot::last_error`
    Error,
}

impl SessionStatus {
    /// Convert status to a short string for logs and the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Live => "live",
            SessionStatus::Closed => "closed",
            SessionStatus::Error => "error",
        }
    }

    /// Whether a session in this status holds resources (a new connect is a no-op).
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Live)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the UI needs to render the session controls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Identifier of the current (or most recent) connection attempt
    pub session_id: Option<Uuid>,
    pub status: SessionStatus,
    pub muted: bool,
    /// Single user-facing failure message, never per-frame detail
    pub last_error: Option<String>,
    /// When the transport opened
    pub live_since: Option<DateTime<Utc>>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Idle,
            muted: false,
            last_error: None,
            live_since: None,
        }
    }
}

/// Counters for one session, updated from every execution domain.
///
/// ## Counter Groups:
/// - **Capture**: frames seen by the capture pipeline and why they were dropped
/// - **Uplink**: frames actually handed to the transport, send failures, bytes
/// - **Playback**: downlink chunks scheduled, dropped, finished, interruptions
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub frames_captured: AtomicU64,
    pub frames_queued: AtomicU64,
    pub frames_dropped_muted: AtomicU64,
    pub frames_dropped_inactive: AtomicU64,
    pub frames_dropped_backpressure: AtomicU64,
    pub frames_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub uplink_bytes: AtomicU64,
    pub downlink_bytes: AtomicU64,
    pub chunks_scheduled: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub chunks_ended: AtomicU64,
    pub interruptions: AtomicU64,
    pub turns_completed: AtomicU64,
}

impl SessionMetrics {
    /// Increment a counter by one.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a counter.
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy all counters into a serializable snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            frames_captured: load(&self.frames_captured),
            frames_queued: load(&self.frames_queued),
            frames_dropped_muted: load(&self.frames_dropped_muted),
            frames_dropped_inactive: load(&self.frames_dropped_inactive),
            frames_dropped_backpressure: load(&self.frames_dropped_backpressure),
            frames_sent: load(&self.frames_sent),
            send_errors: load(&self.send_errors),
            uplink_bytes: load(&self.uplink_bytes),
            downlink_bytes: load(&self.downlink_bytes),
            chunks_scheduled: load(&self.chunks_scheduled),
            chunks_dropped: load(&self.chunks_dropped),
            chunks_ended: load(&self.chunks_ended),
            interruptions: load(&self.interruptions),
            turns_completed: load(&self.turns_completed),
        }
    }
}

/// Point-in-time copy of `SessionMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_queued: u64,
    pub frames_dropped_muted: u64,
    pub frames_dropped_inactive: u64,
    pub frames_dropped_backpressure: u64,
    pub frames_sent: u64,
    pub send_errors: u64,
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub chunks_ended: u64,
    pub interruptions: u64,
    pub turns_completed: u64,
}

impl MetricsSnapshot {
    /// Frames captured but never handed to the uplink, whatever the reason.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped_muted + self.frames_dropped_inactive + self.frames_dropped_backpressure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionStatus::Live.as_str(), "live");
        assert_eq!(SessionStatus::Error.to_string(), "error");
        assert!(SessionStatus::Connecting.is_active());
        assert!(!SessionStatus::Closed.is_active());
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = SessionMetrics::default();
        SessionMetrics::bump(&metrics.frames_captured);
        SessionMetrics::bump(&metrics.frames_dropped_muted);
        SessionMetrics::add(&metrics.uplink_bytes, 4096);

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_captured, 1);
        assert_eq!(snap.frames_dropped(), 1);
        assert_eq!(snap.uplink_bytes, 4096);
    }

    #[test]
    fn test_snapshot_serializes_status_in_snake_case() {
        let json = serde_json::to_value(SessionSnapshot::default()).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["muted"], false);
    }
}
