//! Sound card backend built on cpal.
//!
//! `cpal::Stream` is not `Send` on every platform, so each stream is built, played and
//! dropped on its own thread. The thread reports whether the stream started through a
//! one-shot channel and then parks until the handle is stopped.

use crate::audio::mixer::OutputMixer;
use crate::config::AudioConfig;
use crate::device::{AudioBackend, InputCallback, StreamHandle, ThreadStream};
use crate::error::{EngineError, EngineResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Host, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tracing::{info, warn};

/// Default host input and output, optionally chosen by device name.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            input_device: config.input_device.clone(),
            output_device: config.output_device.clone(),
        }
    }
}

fn find_input(host: &Host, name: Option<&str>) -> EngineResult<Device> {
    let device = match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| EngineError::Permission(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name)),
        None => host.default_input_device(),
    };
    device.ok_or_else(|| EngineError::Permission("No microphone available".to_string()))
}

fn find_output(host: &Host, name: Option<&str>) -> EngineResult<Device> {
    let device = match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| EngineError::Device(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name)),
        None => host.default_output_device(),
    };
    device.ok_or_else(|| EngineError::Device("No output device available".to_string()))
}

/// Run `build` on a dedicated thread and keep the stream alive until stopped.
fn spawn_stream<F>(name: &str, build: F) -> EngineResult<Box<dyn StreamHandle>>
where
    F: FnOnce() -> EngineResult<Stream> + Send + 'static,
{
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<EngineResult<()>>();

    let handle = ThreadStream::spawn(name, move |stop| {
        let stream = match build().and_then(|stream| {
            stream
                .play()
                .map_err(|e| EngineError::Device(e.to_string()))?;
            Ok(stream)
        }) {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let _ = stop.recv();
        drop(stream);
    })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Box::new(handle)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(EngineError::Device("Audio thread exited during setup".to_string())),
    }
}

fn build_input<T>(device: &Device, config: &StreamConfig, mut on_samples: InputCallback) -> EngineResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::with_capacity(8192);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                }));
                on_samples(&mono);
            },
            |err| warn!("Input stream error: {}", err),
            None,
        )
        .map_err(|e| EngineError::Permission(e.to_string()))
}

fn build_output<T>(device: &Device, config: &StreamConfig, mixer: OutputMixer) -> EngineResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mixed: Vec<f32> = Vec::with_capacity(8192);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mixed.resize(data.len(), 0.0);
                mixer.render_interleaved(&mut mixed, channels);
                for (slot, &value) in data.iter_mut().zip(mixed.iter()) {
                    *slot = T::from_sample(value);
                }
            },
            |err| warn!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| EngineError::Device(e.to_string()))
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "device"
    }

    fn input_sample_rate(&self) -> EngineResult<u32> {
        let host = cpal::default_host();
        let device = find_input(&host, self.input_device.as_deref())?;
        let config = device
            .default_input_config()
            .map_err(|e| EngineError::Permission(e.to_string()))?;
        Ok(config.sample_rate().0)
    }

    fn open_input(&self, on_samples: InputCallback) -> EngineResult<Box<dyn StreamHandle>> {
        let wanted = self.input_device.clone();
        spawn_stream("soundcard-input", move || {
            let host = cpal::default_host();
            let device = find_input(&host, wanted.as_deref())?;
            let supported = device
                .default_input_config()
                .map_err(|e| EngineError::Permission(e.to_string()))?;
            let config: StreamConfig = supported.config();
            info!(
                "Microphone: {} ({}Hz, {} ch, {:?})",
                device.name().unwrap_or_default(),
                config.sample_rate.0,
                config.channels,
                supported.sample_format()
            );

            match supported.sample_format() {
                SampleFormat::F32 => build_input::<f32>(&device, &config, on_samples),
                SampleFormat::I16 => build_input::<i16>(&device, &config, on_samples),
                SampleFormat::U16 => build_input::<u16>(&device, &config, on_samples),
                SampleFormat::I32 => build_input::<i32>(&device, &config, on_samples),
                other => Err(EngineError::Device(format!("Unsupported input sample format: {:?}", other))),
            }
        })
    }

    fn output_sample_rate(&self) -> EngineResult<u32> {
        let host = cpal::default_host();
        let device = find_output(&host, self.output_device.as_deref())?;
        let config = device
            .default_output_config()
            .map_err(|e| EngineError::Device(e.to_string()))?;
        Ok(config.sample_rate().0)
    }

    fn open_output(&self, mixer: OutputMixer) -> EngineResult<Box<dyn StreamHandle>> {
        let wanted = self.output_device.clone();
        spawn_stream("soundcard-output", move || {
            let host = cpal::default_host();
            let device = find_output(&host, wanted.as_deref())?;
            let supported = device
                .default_output_config()
                .map_err(|e| EngineError::Device(e.to_string()))?;
            let mut config: StreamConfig = supported.config();
            // The mixer clock is defined at its own rate; render at exactly that rate.
            config.sample_rate = cpal::SampleRate(mixer.sample_rate());
            info!(
                "Speaker: {} ({}Hz, {} ch, {:?})",
                device.name().unwrap_or_default(),
                config.sample_rate.0,
                config.channels,
                supported.sample_format()
            );

            match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &config, mixer),
                SampleFormat::I16 => build_output::<i16>(&device, &config, mixer),
                SampleFormat::U16 => build_output::<u16>(&device, &config, mixer),
                SampleFormat::I32 => build_output::<i32>(&device, &config, mixer),
                other => Err(EngineError::Device(format!("Unsupported output sample format: {:?}", other))),
            }
        })
    }
}
