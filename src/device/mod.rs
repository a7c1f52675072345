//! # Audio Device Backends
//!
//! Where microphone samples come from and where the output mixer is rendered to.
//!
//! ## Backends:
//! - **Device** (`device` feature): the platform's default input/output through cpal
//! - **File**: a WAV file plays the role of the microphone, and the output is rendered
//!   in real time and optionally recorded to a WAV file
//!
//! ## Backend Selection Logic:
//! `auto` picks the sound card when the `device` feature is compiled in and an output
//! device exists, otherwise the file backend. `device` and `file` force the choice.

pub mod file;

#[cfg(feature = "device")]
pub mod soundcard;

use crate::audio::mixer::OutputMixer;
use crate::config::AudioConfig;
use crate::error::EngineResult;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

pub use file::FileBackend;

/// Callback receiving mono samples at the input's native rate, on the device thread.
pub type InputCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A running input or output stream.
pub trait StreamHandle: Send {
    /// Stop the stream. Calling it again is a no-op.
    fn stop(&mut self);
}

/// Source of microphone audio and sink for the output mixer.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Native rate of the input; capture frames are resampled from this rate.
    fn input_sample_rate(&self) -> EngineResult<u32>;

    /// Start delivering input samples. A missing or denied microphone is a
    /// `Permission` error.
    fn open_input(&self, on_samples: InputCallback) -> EngineResult<Box<dyn StreamHandle>>;

    /// Rate the output is rendered at.
    fn output_sample_rate(&self) -> EngineResult<u32>;

    /// Start rendering `mixer` to the output.
    fn open_output(&self, mixer: OutputMixer) -> EngineResult<Box<dyn StreamHandle>>;
}

/// Backend preference from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Sound card if available, file backend otherwise
    #[default]
    Auto,
    /// Force the sound card
    Device,
    /// Force the file backend
    File,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(BackendKind::Auto),
            "device" | "cpal" | "soundcard" => Ok(BackendKind::Device),
            "file" | "wav" => Ok(BackendKind::File),
            _ => Err(format!("Unknown audio backend: {}", s)),
        }
    }
}

/// Build the backend named in the configuration.
pub fn select_backend(config: &AudioConfig) -> EngineResult<Arc<dyn AudioBackend>> {
    let kind = match config.backend.parse::<BackendKind>() {
        Ok(kind) => kind,
        Err(e) => {
            warn!("{}, using auto", e);
            BackendKind::Auto
        }
    };

    match kind {
        BackendKind::File => Ok(Arc::new(FileBackend::from_config(config))),
        BackendKind::Device => device_backend(config),
        BackendKind::Auto => match device_backend(config) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                info!("Sound card unavailable ({}), using file backend", e);
                Ok(Arc::new(FileBackend::from_config(config)))
            }
        },
    }
}

#[cfg(feature = "device")]
fn device_backend(config: &AudioConfig) -> EngineResult<Arc<dyn AudioBackend>> {
    let backend = soundcard::CpalBackend::from_config(config);
    backend.output_sample_rate()?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "device"))]
fn device_backend(_config: &AudioConfig) -> EngineResult<Arc<dyn AudioBackend>> {
    Err(crate::error::EngineError::Device(
        "Built without the `device` feature".to_string(),
    ))
}

/// Stream running on a dedicated thread until told to stop.
pub(crate) struct ThreadStream {
    stop: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadStream {
    /// Spawn `body`, which must return once its stop receiver fires or disconnects.
    pub(crate) fn spawn<F>(name: &str, body: F) -> EngineResult<Self>
    where
        F: FnOnce(std::sync::mpsc::Receiver<()>) + Send + 'static,
    {
        let (stop, stop_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(stop_rx))?;
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl StreamHandle for ThreadStream {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio stream thread panicked");
            }
        }
    }
}

impl Drop for ThreadStream {
    fn drop(&mut self) {
        self.stop();
    }
}
