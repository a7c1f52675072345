//! # Uplink
//!
//! Drains the bounded frame queue filled by the capture callback and hands each frame
//! to the transport, in capture order.
//!
//! A failed send is logged and counted, and the loop moves on to the next frame: one
//! lost frame is preferable to stalling the conversation. The task ends when every
//! sender (the capture pipeline) is gone or when it is aborted on teardown.

use crate::audio::capture::EncodedFrame;
use crate::state::SessionMetrics;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Create the queue between the capture callback and the uplink task.
pub fn uplink_channel(capacity: usize) -> (mpsc::Sender<EncodedFrame>, mpsc::Receiver<EncodedFrame>) {
    mpsc::channel(capacity.max(1))
}

pub struct Uplink {
    transport: Arc<dyn Transport>,
    metrics: Arc<SessionMetrics>,
}

impl Uplink {
    pub fn new(transport: Arc<dyn Transport>, metrics: Arc<SessionMetrics>) -> Self {
        Self { transport, metrics }
    }

    pub fn spawn(self, frames: mpsc::Receiver<EncodedFrame>) -> JoinHandle<()> {
        tokio::spawn(self.run(frames))
    }

    pub async fn run(self, mut frames: mpsc::Receiver<EncodedFrame>) {
        debug!("Uplink started");
        while let Some(frame) = frames.recv().await {
            match self.transport.send(&frame).await {
                Ok(()) => {
                    SessionMetrics::bump(&self.metrics.frames_sent);
                    SessionMetrics::add(&self.metrics.uplink_bytes, frame.data.len() as u64);
                }
                Err(e) => {
                    SessionMetrics::bump(&self.metrics.send_errors);
                    warn!(error_kind = e.kind(), "Failed to send audio frame: {}", e);
                }
            }
        }
        debug!("Uplink finished");
    }
}
