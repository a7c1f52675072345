//! # Visualizer
//!
//! Turns the output mixer's analysis tap into a radial bar display, once per
//! presentation frame.
//!
//! ## Processing Pipeline:
//! 1. **Analyse**: Blackman window → FFT → magnitude → time smoothing → dB → bytes,
//!    the same byte spectrum a Web Audio `AnalyserNode` reports
//! 2. **Render**: 64 bars around a circle, bar height from every second bin, slow
//!    rotation, a pulse ring when the average level is high
//! 3. **Present**: frames go to a caller-supplied presenter (terminal meter, UI, test)
//!
//! ## Best effort:
//! The visualizer never touches the audio path. It reads the tap that the mixer fills
//! and simply renders an idle ring when no session is live.

use crate::audio::buffer::AnalysisBuffer;
use crate::config::VisualizerConfig;
use crate::state::{SessionSnapshot, SessionStatus};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Radians added to the display rotation per rendered frame.
pub const ROTATION_STEP: f32 = 0.005;

/// Average byte level above which the pulse ring is drawn.
pub const PULSE_THRESHOLD: f32 = 10.0;

/// Colour stops along each bar, from the inner end (0.0) to the tip (1.0).
pub const BAR_GRADIENT: [(f32, [u8; 3]); 3] = [
    (0.0, [0x22, 0xd3, 0xee]),
    (0.5, [0x3b, 0x82, 0xf6]),
    (1.0, [0xa8, 0x55, 0xf7]),
];

/// RGB of the pulse ring; its alpha comes from the level.
pub const PULSE_COLOR: [u8; 3] = [34, 211, 238];

/// RGB of the dashed idle ring.
pub const IDLE_RING_COLOR: [u8; 3] = [0x33, 0x41, 0x55];

/// Colour at position `t` in [0, 1] along `BAR_GRADIENT`.
pub fn gradient_at(t: f32) -> [u8; 3] {
    let t = t.clamp(0.0, 1.0);
    for pair in BAR_GRADIENT.windows(2) {
        let (start, from) = pair[0];
        let (end, to) = pair[1];
        if t <= end {
            let f = (t - start) / (end - start);
            let mut rgb = [0u8; 3];
            for c in 0..3 {
                rgb[c] = (from[c] as f32 + (to[c] as f32 - from[c] as f32) * f).round() as u8;
            }
            return rgb;
        }
    }
    BAR_GRADIENT[BAR_GRADIENT.len() - 1].1
}

/// Byte-spectrum analyser over a sliding sample window.
pub struct Analyser {
    source: AnalysisBuffer,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    samples: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
}

impl Analyser {
    pub fn new(source: AnalysisBuffer, config: &VisualizerConfig) -> Self {
        let size = config.fft_size;
        let fft = FftPlanner::new().plan_fft_forward(size);
        Self {
            source,
            fft,
            window: blackman_window(size),
            samples: vec![0.0; size],
            spectrum: vec![Complex::new(0.0, 0.0); size],
            smoothed: vec![0.0; size / 2],
            smoothing: config.smoothing,
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.samples.len()
    }

    /// Number of spectrum bins (half the FFT size).
    pub fn frequency_bin_count(&self) -> usize {
        self.smoothed.len()
    }

    /// Analyse the latest window from the tap into `out` (one byte per bin).
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        let mut samples = std::mem::take(&mut self.samples);
        samples.fill(0.0);
        let offset = samples.len().saturating_sub(self.source.capacity());
        self.source.copy_window(&mut samples[offset..]);
        self.analyse(&samples, out);
        self.samples = samples;
    }

    /// Analyse an explicit window of `fft_size` samples.
    pub fn analyse(&mut self, samples: &[f32], out: &mut [u8]) {
        let size = self.fft_size();
        for (i, bin) in self.spectrum.iter_mut().enumerate() {
            let sample = samples.get(i).copied().unwrap_or(0.0);
            *bin = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.spectrum);

        let range = self.max_decibels - self.min_decibels;
        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.spectrum[k].norm() / size as f32;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;

            if let Some(byte) = out.get_mut(k) {
                let db = 20.0 * smoothed.log10();
                let scaled = 255.0 / range * (db - self.min_decibels);
                *byte = if scaled.is_finite() {
                    scaled.clamp(0.0, 255.0) as u8
                } else {
                    0
                };
            }
        }
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = i as f32 / n;
            0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
        })
        .collect()
}

/// One radial bar, in polar coordinates around the display centre.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub angle: f32,
    pub inner_radius: f32,
    pub outer_radius: f32,
    pub value: u8,
}

/// Translucent ring drawn around the bars when the level is high.
#[derive(Debug, Clone, PartialEq)]
pub struct Pulse {
    pub radius: f32,
    pub alpha: f32,
}

/// What to draw for one presentation frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VisualFrame {
    Live {
        bars: Vec<Bar>,
        pulse: Option<Pulse>,
        /// Mean byte level over all bins
        level: f32,
    },
    /// Dashed ring shown while the session is not live
    Idle { ring_radius: f32 },
}

impl VisualFrame {
    /// Level in [0, 1], zero when idle.
    pub fn level(&self) -> f32 {
        match self {
            VisualFrame::Live { level, .. } => level / 255.0,
            VisualFrame::Idle { .. } => 0.0,
        }
    }
}

/// Computes radial frames from byte spectra.
#[derive(Debug, Clone)]
pub struct RadialRenderer {
    bars: usize,
    radius: f32,
    rotation: f32,
}

impl RadialRenderer {
    pub fn new(config: &VisualizerConfig) -> Self {
        Self {
            bars: config.bars,
            radius: config.radius,
            rotation: 0.0,
        }
    }

    pub fn rotation(&self) -> f32 {
        self.rotation
    }

    /// Render a frame. `bins` is `None` when no analyser exists yet, in which case
    /// the rotation does not advance.
    pub fn render(&mut self, bins: Option<&[u8]>, status: SessionStatus) -> VisualFrame {
        let Some(bins) = bins else {
            return VisualFrame::Idle {
                ring_radius: self.radius,
            };
        };

        self.rotation += ROTATION_STEP;

        if status != SessionStatus::Live {
            return VisualFrame::Idle {
                ring_radius: self.radius,
            };
        }

        let step = 2.0 * PI / self.bars as f32;
        let bars = (0..self.bars)
            .map(|i| {
                let value = bins.get(i * 2).copied().unwrap_or(0);
                let height = value as f32 / 255.0 * 80.0 + 5.0;
                Bar {
                    angle: i as f32 * step + self.rotation,
                    inner_radius: self.radius,
                    outer_radius: self.radius + height,
                    value,
                }
            })
            .collect();

        let level = if bins.is_empty() {
            0.0
        } else {
            bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32
        };
        let pulse = (level > PULSE_THRESHOLD).then(|| Pulse {
            radius: self.radius + level / 2.0,
            alpha: (level / 500.0).min(0.3),
        });

        VisualFrame::Live { bars, pulse, level }
    }
}

/// Presentation loop tying analyser and renderer to session state.
pub struct Visualizer {
    config: VisualizerConfig,
}

impl Visualizer {
    pub fn new(config: VisualizerConfig) -> Self {
        Self { config }
    }

    /// Render frames until the session's state channel closes.
    ///
    /// ## Inputs:
    /// - `taps`: the current analysis tap, `None` when no output graph exists
    /// - `state`: session snapshots; only the status is used
    /// - `present`: called with every frame
    pub async fn run<F>(
        self,
        mut taps: watch::Receiver<Option<AnalysisBuffer>>,
        mut state: watch::Receiver<SessionSnapshot>,
        mut present: F,
    ) where
        F: FnMut(&VisualFrame),
    {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.frame_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut renderer = RadialRenderer::new(&self.config);
        let mut analyser: Option<Analyser> = None;
        let mut bins = vec![0u8; self.config.fft_size / 2];

        debug!("Visualizer started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if taps.has_changed().unwrap_or(false) {
                analyser = taps
                    .borrow_and_update()
                    .clone()
                    .map(|tap| Analyser::new(tap, &self.config));
            } else if analyser.is_none() {
                if let Some(tap) = taps.borrow().clone() {
                    analyser = Some(Analyser::new(tap, &self.config));
                }
            }

            let status = state.borrow().status;
            let frame = match analyser.as_mut() {
                Some(analyser) => {
                    analyser.byte_frequency_data(&mut bins);
                    renderer.render(Some(&bins), status)
                }
                None => renderer.render(None, status),
            };
            present(&frame);
        }
        debug!("Visualizer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn config() -> VisualizerConfig {
        EngineConfig::default().visualizer
    }

    #[test]
    fn test_silence_is_all_zero() {
        let mut analyser = Analyser::new(AnalysisBuffer::new(256), &config());
        let mut bins = vec![255u8; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut bins);
        assert_eq!(bins.len(), 128);
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_peaks_at_its_bin() {
        let mut analyser = Analyser::new(AnalysisBuffer::new(256), &config());
        let tone: Vec<f32> = (0..256)
            .map(|i| (2.0 * PI * 16.0 * i as f32 / 256.0).sin())
            .collect();

        let mut bins = vec![0u8; 128];
        analyser.analyse(&tone, &mut bins);

        assert_eq!(bins[16], 255);
        assert!(bins[100] < bins[16]);
    }

    #[test]
    fn test_smoothing_decays_toward_silence() {
        let mut analyser = Analyser::new(AnalysisBuffer::new(256), &config());
        let tone: Vec<f32> = (0..256)
            .map(|i| (2.0 * PI * 16.0 * i as f32 / 256.0).sin())
            .collect();
        let silence = vec![0.0; 256];
        let mut bins = vec![0u8; 128];

        analyser.analyse(&tone, &mut bins);
        analyser.analyse(&silence, &mut bins);
        let after_one = bins[16];
        analyser.analyse(&silence, &mut bins);
        assert!(after_one > 0);
        assert!(bins[16] < after_one);
    }

    #[test]
    fn test_gradient_stops() {
        assert_eq!(gradient_at(0.0), [0x22, 0xd3, 0xee]);
        assert_eq!(gradient_at(0.5), [0x3b, 0x82, 0xf6]);
        assert_eq!(gradient_at(1.0), [0xa8, 0x55, 0xf7]);
        assert_eq!(gradient_at(2.0), gradient_at(1.0));
    }

    #[test]
    fn test_live_frame_geometry() {
        let mut renderer = RadialRenderer::new(&config());
        let mut bins = vec![0u8; 128];
        bins[0] = 255;

        let frame = renderer.render(Some(&bins), SessionStatus::Live);
        let VisualFrame::Live { bars, pulse, .. } = frame else {
            panic!("expected a live frame");
        };
        assert_eq!(bars.len(), 64);
        assert_eq!(bars[0].outer_radius, 70.0 + 85.0);
        assert_eq!(bars[1].outer_radius, 75.0);
        assert!((bars[0].angle - ROTATION_STEP).abs() < 1e-6);
        // average 255/128 ≈ 2 is below the pulse threshold
        assert!(pulse.is_none());
    }

    #[test]
    fn test_pulse_when_loud() {
        let mut renderer = RadialRenderer::new(&config());
        let bins = vec![200u8; 128];
        let frame = renderer.render(Some(&bins), SessionStatus::Live);

        let VisualFrame::Live { pulse: Some(pulse), .. } = frame else {
            panic!("expected a pulse");
        };
        assert_eq!(pulse.radius, 170.0);
        assert!((pulse.alpha - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_idle_ring_when_not_live() {
        let mut renderer = RadialRenderer::new(&config());
        let bins = vec![200u8; 128];

        let frame = renderer.render(Some(&bins), SessionStatus::Connecting);
        assert_eq!(frame, VisualFrame::Idle { ring_radius: 70.0 });
        assert_eq!(frame.level(), 0.0);

        // No analyser: idle ring, rotation frozen
        let rotation = renderer.rotation();
        renderer.render(None, SessionStatus::Live);
        assert_eq!(renderer.rotation(), rotation);
    }

    #[tokio::test]
    async fn test_run_stops_when_state_sender_dropped() {
        let (tap_tx, tap_rx) = watch::channel(Some(AnalysisBuffer::new(256)));
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());

        let mut cfg = config();
        cfg.frame_interval_ms = 1;
        let frames = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = frames.clone();

        let handle = tokio::spawn(Visualizer::new(cfg).run(tap_rx, state_rx, move |frame| {
            sink.lock().unwrap().push(frame.clone());
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(state_tx);
        handle.await.unwrap();
        drop(tap_tx);

        let frames = frames.lock().unwrap();
        assert!(!frames.is_empty());
        assert!(frames
            .iter()
            .all(|f| matches!(f, VisualFrame::Idle { ring_radius } if *ring_radius == 70.0)));
    }
}
