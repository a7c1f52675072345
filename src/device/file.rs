//! # File Backend
//!
//! Runs a session without a sound card.
//!
//! ## Input:
//! A WAV file stands in for the microphone. It is downmixed to mono and delivered in
//! 20ms blocks paced in real time, so the capture pipeline sees the same cadence a
//! device would produce. Without an input file the microphone is simply silent.
//!
//! ## Output:
//! A thread renders the mixer every 20ms, which advances the playback clock exactly
//! like a device callback. When a record path is set, everything rendered is written
//! to a 16-bit WAV file once the stream stops.

use crate::audio::codec::{float_to_pcm16, write_wav_file};
use crate::audio::mixer::OutputMixer;
use crate::config::{AudioConfig, TARGET_SAMPLE_RATE};
use crate::device::{AudioBackend, InputCallback, StreamHandle, ThreadStream};
use crate::error::{EngineError, EngineResult};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const BLOCK: Duration = Duration::from_millis(20);

/// WAV-file microphone and clock-driven output.
#[derive(Debug, Clone)]
pub struct FileBackend {
    input: Option<PathBuf>,
    record: Option<PathBuf>,
    output_rate: u32,
}

impl FileBackend {
    pub fn new(input: Option<PathBuf>, record: Option<PathBuf>, output_rate: u32) -> Self {
        Self {
            input,
            record,
            output_rate,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(
            config.input_file.as_ref().map(PathBuf::from),
            config.record_file.as_ref().map(PathBuf::from),
            TARGET_SAMPLE_RATE,
        )
    }
}

impl AudioBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn input_sample_rate(&self) -> EngineResult<u32> {
        match &self.input {
            Some(path) => Ok(read_wav_mono(path)?.0),
            None => Ok(self.output_rate),
        }
    }

    fn open_input(&self, mut on_samples: InputCallback) -> EngineResult<Box<dyn StreamHandle>> {
        let (rate, samples) = match &self.input {
            Some(path) => {
                let (rate, samples) = read_wav_mono(path)?;
                info!(
                    "File microphone: {} ({:.1}s at {}Hz)",
                    path.display(),
                    samples.len() as f64 / rate as f64,
                    rate
                );
                (rate, samples)
            }
            None => {
                info!("File backend without input file, microphone is silent");
                (self.output_rate, Vec::new())
            }
        };

        let block = (rate as usize * BLOCK.as_millis() as usize / 1000).max(1);
        let stream = ThreadStream::spawn("file-input", move |stop| {
            let mut deadline = Instant::now();
            for chunk in samples.chunks(block) {
                on_samples(chunk);
                deadline += BLOCK;
                if wait_until(&stop, deadline) {
                    return;
                }
            }
            debug!("File microphone reached end of input");
            let _ = stop.recv();
        })?;
        Ok(Box::new(stream))
    }

    fn output_sample_rate(&self) -> EngineResult<u32> {
        Ok(self.output_rate)
    }

    fn open_output(&self, mixer: OutputMixer) -> EngineResult<Box<dyn StreamHandle>> {
        let frames = (mixer.sample_rate() as usize * BLOCK.as_millis() as usize / 1000).max(1);
        let record = self.record.clone();

        let stream = ThreadStream::spawn("file-output", move |stop| {
            let mut block = vec![0.0f32; frames];
            let mut recorded = Vec::new();
            let mut deadline = Instant::now();

            loop {
                mixer.render(&mut block);
                if record.is_some() {
                    recorded.extend_from_slice(&float_to_pcm16(&block));
                }
                deadline += BLOCK;
                if wait_until(&stop, deadline) {
                    break;
                }
            }

            if let Some(path) = record {
                match write_wav_file(&path, &recorded, mixer.sample_rate()) {
                    Ok(()) => info!("Recorded {} bytes of output to {}", recorded.len(), path.display()),
                    Err(e) => error!("Failed to write {}: {}", path.display(), e),
                }
            }
        })?;
        Ok(Box::new(stream))
    }
}

/// Sleep until `deadline`. Returns true if the stream was asked to stop.
fn wait_until(stop: &Receiver<()>, deadline: Instant) -> bool {
    let timeout = deadline.saturating_duration_since(Instant::now());
    !matches!(stop.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

/// Read a WAV file as mono floats, averaging channels.
pub fn read_wav_mono(path: &Path) -> EngineResult<(u32, Vec<f32>)> {
    let file = File::open(path).map_err(|e| {
        EngineError::Permission(format!("Cannot open microphone file {}: {}", path.display(), e))
    })?;
    let (header, data) = wav::read(&mut BufReader::new(file))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(v) => v.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(v) => v.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(v) => v.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok((header.sampling_rate, mono))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{build_wav, WavSpec};
    use std::sync::{Arc, Mutex};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}-{}.wav", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_read_stereo_downmixes() {
        let path = temp_path("stereo");
        // frames: (16384, 0), (-16384, -16384)
        let pcm: Vec<u8> = [16384i16, 0, -16384, -16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let spec = WavSpec {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 16,
        };
        std::fs::write(&path, build_wav(&pcm, spec)).unwrap();

        let (rate, mono) = read_wav_mono(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(rate, 48_000);
        assert_eq!(mono, vec![0.25, -0.5]);
    }

    #[test]
    fn test_missing_input_is_permission_error() {
        let backend = FileBackend::new(Some(temp_path("missing")), None, 24_000);
        let err = backend.input_sample_rate().unwrap_err();
        assert_eq!(err.kind(), "permission");
    }

    #[test]
    fn test_input_delivers_whole_file() {
        let path = temp_path("input");
        let pcm = float_to_pcm16(&vec![0.5; 960]);
        write_wav_file(&path, &pcm, 48_000).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let backend = FileBackend::new(Some(path.clone()), None, 24_000);
        assert_eq!(backend.input_sample_rate().unwrap(), 48_000);

        let mut stream = backend
            .open_input(Box::new(move |block: &[f32]| sink.lock().unwrap().push(block.len())))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        stream.stop();
        std::fs::remove_file(&path).ok();

        // 960 samples in 20ms blocks of 960 at 48kHz
        assert_eq!(*received.lock().unwrap(), vec![960]);
    }

    #[test]
    fn test_output_advances_clock_and_records() {
        let path = temp_path("record");
        let backend = FileBackend::new(None, Some(path.clone()), 24_000);
        let (mixer, _ended) = OutputMixer::new(24_000, 64);

        let mut stream = backend.open_output(mixer.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        stream.stop();

        use crate::audio::playback::AudioClock;
        assert!(mixer.now() > 0.0);

        let (rate, samples) = read_wav_mono(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(rate, 24_000);
        assert_eq!(samples.len() as f64 / 24_000.0, mixer.now());
    }
}
