//! # Playback Scheduler
//!
//! Places downlink chunks back to back on the output clock so consecutive chunks play
//! without gaps or overlap, however irregularly they arrive.
//!
//! ## Timeline:
//! - `next_start_time` is the clock time at which the next chunk should begin
//! - a chunk starts at `max(now, next_start_time)` and advances the timeline by its
//!   duration (`samples / downlink_rate`)
//! - if the timeline fell behind (a network gap), the chunk starts immediately
//!
//! ## Chunk Lifecycle:
//! `Arrived → Scheduled → Playing → Ended`, where `Ended` is reached by natural
//! completion (`on_ended`) or by an interruption stopping it. The active set holds
//! every chunk that is scheduled or playing.
//!
//! ## Ownership:
//! The scheduler is owned by a single task (the session's downlink task); it is not
//! shared. The output side is reached through the `AudioClock` and `PlaybackSink`
//! traits, which the output mixer implements.

use crate::audio::codec::{decode_base64, pcm16_to_float};
use crate::state::SessionMetrics;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Monotonic clock of the audio output, in seconds.
pub trait AudioClock {
    fn now(&self) -> f64;
}

/// Something that can play mono sample buffers at a given clock time.
pub trait PlaybackSink {
    /// Start `samples` (at `sample_rate`) at clock time `start_time`.
    fn start(&self, id: ChunkId, samples: Arc<[f32]>, sample_rate: u32, start_time: f64);
    /// Stop a chunk; stopping one that already ended is a no-op.
    fn stop(&self, id: ChunkId);
}

/// Identifier of a scheduled chunk, unique within a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// Where a chunk is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Arrived,
    Scheduled,
    Playing,
    Ended,
}

/// A chunk placed on the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    pub id: ChunkId,
    pub sample_count: usize,
    pub sample_rate: u32,
    pub start_time: f64,
}

impl PlaybackChunk {
    pub fn duration(&self) -> f64 {
        self.sample_count as f64 / self.sample_rate as f64
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }

    /// Lifecycle state of an active chunk at clock time `now`.
    pub fn state_at(&self, now: f64) -> ChunkState {
        if now < self.start_time {
            ChunkState::Scheduled
        } else if now < self.end_time() {
            ChunkState::Playing
        } else {
            ChunkState::Ended
        }
    }
}

/// Gapless scheduler for downlink audio.
pub struct PlaybackScheduler<G> {
    output: G,
    downlink_rate: u32,
    next_start_time: f64,
    active: BTreeMap<ChunkId, PlaybackChunk>,
    next_id: u64,
    metrics: Arc<SessionMetrics>,
}

impl<G: AudioClock + PlaybackSink> PlaybackScheduler<G> {
    pub fn new(output: G, downlink_rate: u32) -> Self {
        Self {
            output,
            downlink_rate,
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
            metrics: Arc::new(SessionMetrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SessionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Schedule a base64 PCM16 payload as received from the peer.
    pub fn schedule_base64(&mut self, data: &str) -> Option<ChunkId> {
        self.schedule_pcm(&decode_base64(data))
    }

    /// Schedule raw PCM16 little-endian bytes. A trailing odd byte is ignored.
    pub fn schedule_pcm(&mut self, bytes: &[u8]) -> Option<ChunkId> {
        SessionMetrics::add(&self.metrics.downlink_bytes, bytes.len() as u64);
        self.schedule_samples(pcm16_to_float(bytes))
    }

    /// Schedule decoded samples at the downlink rate.
    ///
    /// ## Returns:
    /// The new chunk's id, or `None` for an empty chunk (which is dropped and leaves the
    /// timeline untouched).
    pub fn schedule_samples(&mut self, samples: Vec<f32>) -> Option<ChunkId> {
        if samples.is_empty() {
            SessionMetrics::bump(&self.metrics.chunks_dropped);
            debug!("Dropping empty downlink chunk");
            return None;
        }

        let now = self.output.now();
        let start_time = self.next_start_time.max(now);
        if start_time > self.next_start_time {
            trace!(
                "Playback timeline behind by {:.3}s, starting immediately",
                start_time - self.next_start_time
            );
        }

        let id = ChunkId(self.next_id);
        self.next_id += 1;

        let chunk = PlaybackChunk {
            id,
            sample_count: samples.len(),
            sample_rate: self.downlink_rate,
            start_time,
        };
        self.next_start_time = chunk.end_time();

        self.output
            .start(id, Arc::from(samples), self.downlink_rate, start_time);
        trace!(
            "Scheduled {} at {:.3}s for {:.3}s",
            id,
            start_time,
            chunk.duration()
        );
        self.active.insert(id, chunk);
        SessionMetrics::bump(&self.metrics.chunks_scheduled);

        Some(id)
    }

    /// Remove a chunk that finished playing. Unknown ids (already stopped) are ignored.
    pub fn on_ended(&mut self, id: ChunkId) -> Option<PlaybackChunk> {
        let chunk = self.active.remove(&id)?;
        SessionMetrics::bump(&self.metrics.chunks_ended);
        trace!("{} ended", id);
        Some(chunk)
    }

    /// Stop every active chunk and empty the active set.
    pub(crate) fn stop_all(&mut self) -> Vec<PlaybackChunk> {
        let stopped: Vec<PlaybackChunk> = std::mem::take(&mut self.active).into_values().collect();
        for chunk in &stopped {
            self.output.stop(chunk.id);
        }
        stopped
    }

    /// Move the timeline cursor, used after an interruption.
    pub(crate) fn reset_timeline(&mut self, start: f64) {
        self.next_start_time = start;
    }

    /// Lifecycle state of a chunk this scheduler issued.
    pub fn chunk_state(&self, id: ChunkId) -> Option<ChunkState> {
        if id.0 >= self.next_id {
            return None;
        }
        Some(match self.active.get(&id) {
            Some(chunk) => match chunk.state_at(self.now()) {
                // Past its end but the output has not reported it yet
                ChunkState::Ended => ChunkState::Playing,
                state => state,
            },
            None => ChunkState::Ended,
        })
    }

    pub fn now(&self) -> f64 {
        self.output.now()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_chunks(&self) -> impl Iterator<Item = &PlaybackChunk> {
        self.active.values()
    }

    /// Seconds of audio queued beyond the current clock time.
    pub fn queued_seconds(&self) -> f64 {
        (self.next_start_time - self.now()).max(0.0)
    }

    pub fn output(&self) -> &G {
        &self.output
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }
}
