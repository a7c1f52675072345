//! # Configuration Management
//!
//! This module handles loading and managing engine configuration from multiple sources:
//! - TOML configuration files (live-audio.toml)
//! - Environment variables (with LIVE_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `PEER_URL` environment variable (transport URL only)
//! 2. Environment variables (LIVE_TRANSPORT__URL, LIVE_AUDIO__TARGET_RATE, etc.)
//! 3. Configuration file (live-audio.toml, or the path given on the command line)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore because field names already contain single ones.

use crate::error::EngineError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Sample rate required by the remote peer's audio protocol (both directions).
pub const TARGET_SAMPLE_RATE: u32 = 24_000;

/// Samples per microphone frame handed to the capture pipeline.
pub const DEFAULT_CAPTURE_FRAME_SIZE: usize = 4096;

/// Main engine configuration that contains all settings.
///
/// One section per concern: `[transport]`, `[audio]`, `[visualizer]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub visualizer: VisualizerConfig,
}

/// Remote peer connection settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the conversational agent (ws:// or wss://)
/// - `api_key`: Optional key appended as a query parameter when connecting
/// - `model`: Model identifier sent in the setup message once the socket opens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `target_rate`: Rate every uplink frame is resampled to (the peer expects 24kHz)
/// - `downlink_rate`: Rate of PCM16 chunks arriving from the peer
/// - `capture_frame_size`: Native-rate samples per capture frame
/// - `uplink_queue_frames`: Capacity of the channel between capture callback and uplink task
/// - `backend`: Which audio backend to use ("auto", "device", "file")
/// - `input_device` / `output_device`: Device names, default device when absent
/// - `input_file` / `record_file`: WAV paths used by the file backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    pub target_rate: u32,
    pub downlink_rate: u32,
    pub capture_frame_size: usize,
    pub uplink_queue_frames: usize,
    pub backend: String,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub input_file: Option<String>,
    pub record_file: Option<String>,
}

/// Visualizer settings, modelled on a Web Audio AnalyserNode.
///
/// ## Fields:
/// - `fft_size`: Window length, must be a power of two (bins = fft_size / 2)
/// - `smoothing`: Time smoothing between analysis frames, in [0, 1)
/// - `min_decibels` / `max_decibels`: dB range mapped onto byte values 0..=255
/// - `bars`: Number of radial bars drawn per frame
/// - `radius`: Inner radius of the radial display
/// - `frame_interval_ms`: Presentation loop period
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisualizerConfig {
    pub fft_size: usize,
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub bars: usize,
    pub radius: f32,
    pub frame_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                url: "ws://127.0.0.1:8765/live".to_string(),
                api_key: None,
                model: "native-audio-dialog".to_string(),
            },
            audio: AudioConfig {
                target_rate: TARGET_SAMPLE_RATE,
                downlink_rate: TARGET_SAMPLE_RATE,
                capture_frame_size: DEFAULT_CAPTURE_FRAME_SIZE,
                uplink_queue_frames: 32, // ~5s of 4096-sample frames at 24kHz
                backend: "auto".to_string(),
                input_device: None,
                output_device: None,
                input_file: None,
                record_file: None,
            },
            visualizer: VisualizerConfig {
                fft_size: 256,
                smoothing: 0.8,
                min_decibels: -100.0,
                max_decibels: -30.0,
                bars: 64,
                radius: 70.0,
                frame_interval_ms: 16,
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file name (`live-audio.toml`).
    pub fn load() -> Result<Self> {
        Self::load_from("live-audio")
    }

    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from the config file (if it exists)
    /// 3. Override with environment variables prefixed with LIVE_
    /// 4. Handle the special PEER_URL environment variable
    ///
    /// ## Environment Variable Examples:
    /// - `LIVE_TRANSPORT__URL=wss://agent.example.com/live`
    /// - `LIVE_AUDIO__CAPTURE_FRAME_SIZE=2048`
    /// - `LIVE_VISUALIZER__BARS=32`
    pub fn load_from(path: &str) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("LIVE")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(url) = env::var("PEER_URL") {
            settings = settings.set_override("transport.url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Transport URL uses a websocket scheme
    /// - Sample rates and frame sizes are non-zero
    /// - The uplink queue can hold at least one frame
    /// - FFT size is a power of two the analyser can handle
    /// - The decibel range is not empty and smoothing stays below 1
    pub fn validate(&self) -> Result<()> {
        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Transport URL must start with ws:// or wss://, got {}",
                self.transport.url
            ));
        }

        if self.audio.target_rate == 0 || self.audio.downlink_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_frame_size == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.audio.uplink_queue_frames == 0 {
            return Err(anyhow::anyhow!("Uplink queue must hold at least one frame"));
        }

        let fft = self.visualizer.fft_size;
        if !fft.is_power_of_two() || !(32..=32768).contains(&fft) {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two between 32 and 32768, got {}",
                fft
            ));
        }

        if self.visualizer.min_decibels >= self.visualizer.max_decibels {
            return Err(anyhow::anyhow!("min_decibels must be below max_decibels"));
        }

        if !(0.0..1.0).contains(&self.visualizer.smoothing) {
            return Err(anyhow::anyhow!("Smoothing must be in [0, 1)"));
        }

        if self.visualizer.bars == 0 {
            return Err(anyhow::anyhow!("Visualizer needs at least one bar"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for command-line overrides).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed, for example
    /// `{"audio": {"capture_frame_size": 2048}}` changes nothing else.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(transport) = partial.get("transport") {
            if let Some(url) = transport.get("url").and_then(|v| v.as_str()) {
                self.transport.url = url.to_string();
            }
            if let Some(key) = transport.get("api_key").and_then(|v| v.as_str()) {
                self.transport.api_key = Some(key.to_string());
            }
            if let Some(model) = transport.get("model").and_then(|v| v.as_str()) {
                self.transport.model = model.to_string();
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(rate) = json_number::<u32>(audio, "audio.target_rate")? {
                self.audio.target_rate = rate;
            }
            if let Some(rate) = json_number::<u32>(audio, "audio.downlink_rate")? {
                self.audio.downlink_rate = rate;
            }
            if let Some(size) = json_number::<usize>(audio, "audio.capture_frame_size")? {
                self.audio.capture_frame_size = size;
            }
            if let Some(frames) = json_number::<usize>(audio, "audio.uplink_queue_frames")? {
                self.audio.uplink_queue_frames = frames;
            }
            if let Some(backend) = audio.get("backend").and_then(|v| v.as_str()) {
                self.audio.backend = backend.to_string();
            }
            if let Some(path) = audio.get("input_file").and_then(|v| v.as_str()) {
                self.audio.input_file = Some(path.to_string());
            }
            if let Some(path) = audio.get("record_file").and_then(|v| v.as_str()) {
                self.audio.record_file = Some(path.to_string());
            }
        }

        if let Some(visualizer) = partial.get("visualizer") {
            if let Some(size) = json_number::<usize>(visualizer, "visualizer.fft_size")? {
                self.visualizer.fft_size = size;
            }
            if let Some(bars) = json_number::<usize>(visualizer, "visualizer.bars")? {
                self.visualizer.bars = bars;
            }
            if let Some(ms) = json_number::<u64>(visualizer, "visualizer.frame_interval_ms")? {
                self.visualizer.frame_interval_ms = ms;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Render the configuration as TOML, suitable for saving as live-audio.toml.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Read an unsigned integer field of a JSON override section.
///
/// `key` is the dotted path used in the error; the field name is its last segment.
/// Negative, fractional or out-of-range values are a `Config` error.
fn json_number<T: TryFrom<u64>>(section: &serde_json::Value, key: &str) -> Result<Option<T>> {
    let field = key.rsplit('.').next().unwrap_or(key);
    let Some(value) = section.get(field) else {
        return Ok(None);
    };
    value
        .as_u64()
        .and_then(|n| T::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| EngineError::Config(format!("{} is out of range: {}", key, value)).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.audio.target_rate, 24_000);
        assert_eq!(config.audio.capture_frame_size, 4096);
        assert_eq!(config.visualizer.fft_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.audio.target_rate = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.visualizer.fft_size = 300;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.transport.url = "http://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = EngineConfig::default();
        let json = r#"{"audio": {"capture_frame_size": 2048}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.audio.capture_frame_size, 2048);
        assert_eq!(config.audio.target_rate, 24_000);

        let bad = r#"{"visualizer": {"fft_size": 100}}"#;
        assert!(config.update_from_json(bad).is_err());
    }

    #[test]
    fn test_config_update_rejects_out_of_range_numbers() {
        let mut config = EngineConfig::default();
        let huge = r#"{"audio": {"target_rate": 4294967296}}"#;
        let err = config.update_from_json(huge).unwrap_err();
        assert_eq!(
            err.downcast_ref::<EngineError>().map(|e| e.kind()),
            Some("config")
        );
        assert_eq!(config.audio.target_rate, 24_000);

        let negative = r#"{"visualizer": {"bars": -1}}"#;
        assert!(config.update_from_json(negative).is_err());
        assert_eq!(config.visualizer.bars, 64);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = EngineConfig::load_from("definitely-not-a-config-file").unwrap();
        assert_eq!(config.audio.downlink_rate, 24_000);
    }
}
