//! # Output Mixer
//!
//! The engine's audio output graph: a set of voices rendered on the device's output
//! callback, plus the clock the playback scheduler reads.
//!
//! ## Key Features:
//! - **Sample-accurate start**: each voice starts at a clock time, not "as soon as
//!   possible", which is what makes back-to-back chunks gapless
//! - **Rate conversion**: voices keep their own sample rate (24kHz from the peer) and
//!   are read with linear interpolation at the device rate
//! - **Clock**: frames rendered ÷ output rate, advanced only by the output callback
//! - **Analysis tap**: every rendered block is copied into an `AnalysisBuffer`
//! - **Completion**: finished voices are reported on an unbounded channel so the
//!   scheduler can drop them from its active set
//!
//! ## Real-time constraints:
//! `render` only ever `try_lock`s the voice list. If the control side holds it, the
//! block is rendered as silence but the clock still advances.

use crate::audio::buffer::AnalysisBuffer;
use crate::audio::playback::{AudioClock, ChunkId, PlaybackSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Distance from an integer sample position treated as exactly on it.
const POSITION_EPSILON: f64 = 1e-6;

struct Voice {
    id: ChunkId,
    samples: Arc<[f32]>,
    sample_rate: u32,
    start_time: f64,
}

impl Voice {
    fn end_time(&self) -> f64 {
        self.start_time + self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Interpolated sample at clock time `t`, 0.0 outside the voice.
    ///
    /// Between the last sample and `end_time` the last sample is held, so a voice
    /// scheduled at `end_time` continues the signal without a dip.
    fn sample_at(&self, t: f64) -> f32 {
        let mut position = (t - self.start_time) * self.sample_rate as f64;
        let nearest = position.round();
        if (position - nearest).abs() < POSITION_EPSILON {
            position = nearest;
        }
        if position < 0.0 {
            return 0.0;
        }

        let index = position.floor() as usize;
        let Some(&current) = self.samples.get(index) else {
            return 0.0;
        };
        let frac = (position - index as f64) as f32;
        if frac == 0.0 {
            return current;
        }
        let next = self.samples.get(index + 1).copied().unwrap_or(current);
        current + (next - current) * frac
    }
}

struct MixerShared {
    sample_rate: u32,
    frames_rendered: AtomicU64,
    voices: Mutex<Vec<Voice>>,
    ended: mpsc::UnboundedSender<ChunkId>,
    tap: AnalysisBuffer,
}

/// Shared handle to the output graph. Clones refer to the same mixer.
#[derive(Clone)]
pub struct OutputMixer {
    shared: Arc<MixerShared>,
}

impl OutputMixer {
    /// Create a mixer rendering at `sample_rate`, tapping into a window of
    /// `tap_capacity` samples.
    ///
    /// ## Returns:
    /// The mixer and the receiver of ids of voices that finished playing.
    pub fn new(sample_rate: u32, tap_capacity: usize) -> (Self, mpsc::UnboundedReceiver<ChunkId>) {
        let (ended, ended_rx) = mpsc::unbounded_channel();
        let mixer = Self {
            shared: Arc::new(MixerShared {
                sample_rate: sample_rate.max(1),
                frames_rendered: AtomicU64::new(0),
                voices: Mutex::new(Vec::new()),
                ended,
                tap: AnalysisBuffer::new(tap_capacity),
            }),
        };
        (mixer, ended_rx)
    }

    /// Render the next `out.len()` mono frames.
    pub fn render(&self, out: &mut [f32]) {
        let shared = &self.shared;
        let base = shared.frames_rendered.load(Ordering::Acquire);
        let rate = shared.sample_rate as f64;

        match shared.voices.try_lock() {
            Ok(mut voices) => {
                for (i, slot) in out.iter_mut().enumerate() {
                    let t = (base + i as u64) as f64 / rate;
                    *slot = voices.iter().map(|v| v.sample_at(t)).sum::<f32>().clamp(-1.0, 1.0);
                }

                let block_end = (base + out.len() as u64) as f64 / rate;
                voices.retain(|voice| {
                    if voice.end_time() <= block_end + POSITION_EPSILON / rate {
                        let _ = shared.ended.send(voice.id);
                        false
                    } else {
                        true
                    }
                });
            }
            Err(_) => {
                trace!("Voice list busy, rendering silence");
                out.fill(0.0);
            }
        }

        shared.tap.try_push(out);
        shared
            .frames_rendered
            .fetch_add(out.len() as u64, Ordering::Release);
    }

    /// Render `out.len() / channels` frames, duplicating the mono mix to every channel.
    pub fn render_interleaved(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        self.render(&mut out[..frames]);

        if channels > 1 {
            // Expand in place from the back so no frame is overwritten before it is read.
            for frame in (0..frames).rev() {
                let value = out[frame];
                out[frame * channels..(frame + 1) * channels].fill(value);
            }
        }
    }

    /// Drop every voice without reporting it (used on teardown).
    pub fn halt(&self) {
        self.lock_voices().clear();
        self.shared.tap.clear();
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// The analysis window fed by `render`.
    pub fn tap(&self) -> AnalysisBuffer {
        self.shared.tap.clone()
    }

    pub fn voice_count(&self) -> usize {
        self.lock_voices().len()
    }

    fn lock_voices(&self) -> std::sync::MutexGuard<'_, Vec<Voice>> {
        self.shared
            .voices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AudioClock for OutputMixer {
    fn now(&self) -> f64 {
        self.shared.frames_rendered.load(Ordering::Acquire) as f64 / self.shared.sample_rate as f64
    }
}

impl PlaybackSink for OutputMixer {
    fn start(&self, id: ChunkId, samples: Arc<[f32]>, sample_rate: u32, start_time: f64) {
        self.lock_voices().push(Voice {
            id,
            samples,
            sample_rate: sample_rate.max(1),
            start_time,
        });
    }

    fn stop(&self, id: ChunkId) {
        self.lock_voices().retain(|voice| voice.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::PlaybackScheduler;

    #[test]
    fn test_clock_advances_with_rendering() {
        let (mixer, _ended) = OutputMixer::new(24_000, 64);
        assert_eq!(mixer.now(), 0.0);

        let mut block = vec![0.0; 12_000];
        mixer.render(&mut block);
        assert_eq!(mixer.now(), 0.5);
    }

    #[test]
    fn test_voice_starts_at_its_time() {
        let (mixer, _ended) = OutputMixer::new(24_000, 64);
        mixer.start(ChunkId(0), Arc::from(vec![0.5f32; 4]), 24_000, 2.0 / 24_000.0);

        let mut block = vec![9.0; 8];
        mixer.render(&mut block);
        assert_eq!(block, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_consecutive_chunks_are_gapless() {
        let (mixer, mut ended) = OutputMixer::new(24_000, 64);
        let mut scheduler = PlaybackScheduler::new(mixer.clone(), 24_000);

        let a = scheduler.schedule_samples(vec![0.25; 100]).unwrap();
        let b = scheduler.schedule_samples(vec![-0.25; 100]).unwrap();

        let mut block = vec![0.0; 200];
        mixer.render(&mut block);
        assert!(block[..100].iter().all(|&s| s == 0.25));
        assert!(block[100..].iter().all(|&s| s == -0.25));

        assert_eq!(ended.try_recv().unwrap(), a);
        assert_eq!(ended.try_recv().unwrap(), b);
        assert_eq!(mixer.voice_count(), 0);
    }

    #[test]
    fn test_upsamples_downlink_rate() {
        let (mixer, _ended) = OutputMixer::new(48_000, 64);
        mixer.start(ChunkId(0), Arc::from(vec![0.0f32, 1.0]), 24_000, 0.0);

        let mut block = vec![0.0; 4];
        mixer.render(&mut block);
        assert_eq!(block, vec![0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_contiguous_chunks_have_no_dip_at_48k() {
        let (mixer, mut ended) = OutputMixer::new(48_000, 64);
        let mut scheduler = PlaybackScheduler::new(mixer.clone(), 24_000);

        let a = scheduler.schedule_samples(vec![0.5; 100]).unwrap();
        let b = scheduler.schedule_samples(vec![0.5; 100]).unwrap();

        let mut block = vec![0.0; 400];
        mixer.render(&mut block);
        for (i, &s) in block.iter().enumerate() {
            assert!((s - 0.5).abs() < 1e-6, "frame {} is {}", i, s);
        }

        assert_eq!(ended.try_recv().unwrap(), a);
        assert_eq!(ended.try_recv().unwrap(), b);
    }

    #[test]
    fn test_stop_silences_voice() {
        let (mixer, mut ended) = OutputMixer::new(24_000, 64);
        mixer.start(ChunkId(7), Arc::from(vec![0.5f32; 100]), 24_000, 0.0);
        mixer.stop(ChunkId(7));

        let mut block = vec![1.0; 10];
        mixer.render(&mut block);
        assert!(block.iter().all(|&s| s == 0.0));
        assert!(ended.try_recv().is_err());
    }

    #[test]
    fn test_interleaved_duplicates_channels() {
        let (mixer, _ended) = OutputMixer::new(24_000, 64);
        mixer.start(ChunkId(0), Arc::from(vec![0.1f32, 0.2, 0.3]), 24_000, 0.0);

        let mut block = vec![0.0; 6];
        mixer.render_interleaved(&mut block, 2);
        assert_eq!(block, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
        assert_eq!(mixer.now(), 3.0 / 24_000.0);
    }

    #[test]
    fn test_tap_receives_rendered_audio() {
        let (mixer, _ended) = OutputMixer::new(24_000, 4);
        mixer.start(ChunkId(0), Arc::from(vec![0.5f32; 4]), 24_000, 0.0);

        let mut block = vec![0.0; 4];
        mixer.render(&mut block);

        let mut window = [0.0; 4];
        mixer.tap().copy_window(&mut window);
        assert_eq!(window, [0.5; 4]);
    }

    #[test]
    fn test_contended_render_is_silent_but_advances() {
        let (mixer, _ended) = OutputMixer::new(24_000, 4);
        mixer.start(ChunkId(0), Arc::from(vec![0.5f32; 10]), 24_000, 0.0);

        let guard = mixer.shared.voices.lock().unwrap();
        let mut block = vec![1.0; 4];
        mixer.render(&mut block);
        drop(guard);

        assert_eq!(block, vec![0.0; 4]);
        assert_eq!(mixer.now(), 4.0 / 24_000.0);
    }
}
