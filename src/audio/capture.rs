//! # Capture Pipeline
//!
//! Turns raw microphone samples into frames the remote peer can consume.
//!
//! ## Processing Pipeline:
//! 1. **Accumulate**: device callbacks deliver arbitrary block sizes; `FrameAccumulator`
//!    regroups them into fixed frames (4096 samples by default)
//! 2. **Gate**: frames are dropped while muted or while the transport is not open
//! 3. **Resample**: native rate → 24kHz with the box-filter resampler
//! 4. **Encode**: f32 → PCM16 little-endian → base64
//! 5. **Hand off**: `try_send` into the bounded uplink channel
//!
//! ## Real-time constraints:
//! `process_frame` runs on the audio device thread. It never awaits and never blocks:
//! the gate is two atomics and the hand-off is `try_send`, so a full queue drops
//! the frame instead of stalling the microphone.

use crate::audio::codec::{encode_base64, float_to_pcm16};
use crate::audio::resample::resample;
use crate::state::SessionMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One uplink frame: base64 PCM16 mono at `sample_rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub data: String,
    pub sample_rate: u32,
}

impl EncodedFrame {
    /// Encode resampled float samples.
    pub fn encode(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            data: encode_base64(&float_to_pcm16(samples)),
            sample_rate,
        }
    }

    /// MIME tag the peer uses to interpret `data`, e.g. `audio/pcm;rate=24000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// What happened to a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Encoded and placed on the uplink queue
    Queued,
    /// Dropped because the user muted the microphone
    DroppedMuted,
    /// Dropped because the transport is not open
    DroppedInactive,
    /// Dropped because the uplink queue was full or gone
    DroppedBackpressure,
}

/// Flags the capture callback reads on every frame.
///
/// Both are written from the control domain (mute button, transport events) and read
/// from the audio thread, so they are plain atomics.
#[derive(Debug, Clone, Default)]
pub struct CaptureGate {
    muted: Arc<AtomicBool>,
    transport_active: Arc<AtomicBool>,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_transport_active(&self, active: bool) {
        self.transport_active.store(active, Ordering::Release);
    }

    pub fn is_transport_active(&self) -> bool {
        self.transport_active.load(Ordering::Acquire)
    }
}

/// Regroups arbitrary device blocks into fixed-size frames.
///
/// The internal buffer is allocated once with room for a frame plus one device block,
/// and only grows if a device delivers unusually large blocks.
#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: Vec<f32>,
    frame_size: usize,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            buffer: Vec::with_capacity(frame_size * 2),
            frame_size,
        }
    }

    /// Append `samples` and call `on_frame` once for every complete frame.
    pub fn push(&mut self, samples: &[f32], mut on_frame: impl FnMut(&[f32])) {
        self.buffer.extend_from_slice(samples);

        let mut consumed = 0;
        while self.buffer.len() - consumed >= self.frame_size {
            on_frame(&self.buffer[consumed..consumed + self.frame_size]);
            consumed += self.frame_size;
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
    }

    /// Samples waiting for the next frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

/// Per-frame processing from native-rate floats to an uplink frame.
pub struct CapturePipeline {
    source_rate: u32,
    target_rate: u32,
    gate: CaptureGate,
    uplink: mpsc::Sender<EncodedFrame>,
    metrics: Arc<SessionMetrics>,
}

impl CapturePipeline {
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        gate: CaptureGate,
        uplink: mpsc::Sender<EncodedFrame>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        debug!(
            "Capture pipeline: {}Hz -> {}Hz",
            source_rate, target_rate
        );
        Self {
            source_rate,
            target_rate,
            gate,
            uplink,
            metrics,
        }
    }

    /// Process one native-rate frame.
    ///
    /// ## Gate order:
    /// Mute is checked before transport state, so a muted session counts its frames as
    /// muted even while it is still connecting.
    pub fn process_frame(&self, frame: &[f32]) -> FrameOutcome {
        SessionMetrics::bump(&self.metrics.frames_captured);

        if self.gate.is_muted() {
            SessionMetrics::bump(&self.metrics.frames_dropped_muted);
            return FrameOutcome::DroppedMuted;
        }

        if !self.gate.is_transport_active() {
            SessionMetrics::bump(&self.metrics.frames_dropped_inactive);
            return FrameOutcome::DroppedInactive;
        }

        let resampled = resample(frame, self.source_rate, self.target_rate);
        let encoded = EncodedFrame::encode(&resampled, self.target_rate);

        match self.uplink.try_send(encoded) {
            Ok(()) => {
                SessionMetrics::bump(&self.metrics.frames_queued);
                FrameOutcome::Queued
            }
            Err(_) => {
                trace!("Uplink queue unavailable, dropping capture frame");
                SessionMetrics::bump(&self.metrics.frames_dropped_backpressure);
                FrameOutcome::DroppedBackpressure
            }
        }
    }

    /// Build the closure handed to an audio backend's input stream.
    ///
    /// ## Rust Concepts:
    /// - **move closure**: the accumulator and pipeline are owned by the callback,
    ///   so the device thread needs no shared state beyond the gate atomics
    pub fn into_callback(self, frame_size: usize) -> impl FnMut(&[f32]) + Send + 'static {
        let mut accumulator = FrameAccumulator::new(frame_size);
        move |samples: &[f32]| {
            accumulator.push(samples, |frame| {
                self.process_frame(frame);
            });
        }
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::decode_base64;

    fn pipeline(capacity: usize) -> (CapturePipeline, CaptureGate, mpsc::Receiver<EncodedFrame>, Arc<SessionMetrics>) {
        let (tx, rx) = mpsc::channel(capacity);
        let gate = CaptureGate::new();
        let metrics = Arc::new(SessionMetrics::default());
        let pipeline = CapturePipeline::new(48_000, 24_000, gate.clone(), tx, metrics.clone());
        (pipeline, gate, rx, metrics)
    }

    #[test]
    fn test_accumulator_regroups_blocks() {
        let mut acc = FrameAccumulator::new(4);
        let mut frames = Vec::new();

        acc.push(&[1.0, 2.0, 3.0], |f| frames.push(f.to_vec()));
        assert!(frames.is_empty());
        assert_eq!(acc.pending(), 3);

        acc.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn test_frame_48k_constant_half() {
        let (pipeline, gate, mut rx, _) = pipeline(4);
        gate.set_transport_active(true);

        let outcome = pipeline.process_frame(&vec![0.5; 4096]);
        assert_eq!(outcome, FrameOutcome::Queued);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.mime_type(), "audio/pcm;rate=24000");

        let bytes = decode_base64(&frame.data);
        assert_eq!(bytes.len(), 4096);
        for pair in bytes.chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([pair[0], pair[1]]), 16384);
        }
    }

    #[test]
    fn test_muted_frames_never_reach_uplink() {
        let (pipeline, gate, mut rx, metrics) = pipeline(4);
        gate.set_transport_active(true);
        gate.set_muted(true);

        for _ in 0..3 {
            assert_eq!(pipeline.process_frame(&[0.1; 64]), FrameOutcome::DroppedMuted);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().frames_dropped_muted, 3);

        gate.set_muted(false);
        assert_eq!(pipeline.process_frame(&[0.1; 64]), FrameOutcome::Queued);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_inactive_transport_drops() {
        let (pipeline, _gate, mut rx, _) = pipeline(4);
        assert_eq!(pipeline.process_frame(&[0.1; 64]), FrameOutcome::DroppedInactive);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (pipeline, gate, _rx, metrics) = pipeline(1);
        gate.set_transport_active(true);

        assert_eq!(pipeline.process_frame(&[0.1; 64]), FrameOutcome::Queued);
        assert_eq!(pipeline.process_frame(&[0.1; 64]), FrameOutcome::DroppedBackpressure);
        assert_eq!(metrics.snapshot().frames_dropped_backpressure, 1);
    }

    #[test]
    fn test_callback_emits_fixed_frames() {
        let (pipeline, gate, mut rx, _) = pipeline(8);
        gate.set_transport_active(true);
        let mut callback = pipeline.into_callback(1024);

        // 3 device blocks of 700 samples → 2 complete frames of 1024
        for _ in 0..3 {
            callback(&[0.25; 700]);
        }

        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(decode_base64(&frame.data).len(), 512 * 2);
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
