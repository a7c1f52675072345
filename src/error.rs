//! # Error Handling
//!
//! This module defines the error type shared by every part of the live audio engine.
//!
//! ## Error Taxonomy:
//! - **Setup errors** (microphone denied, peer unreachable): fatal to session start,
//!   surfaced as the session's `error` status with a message
//! - **Transient send errors**: logged by the uplink, the frame is dropped, capture continues
//! - **Decode errors**: the offending downlink chunk is dropped, playback continues
//! - **Interruption**: not an error at all, it is a normal control signal
//!
//! ## Key Rust Concepts:
//! - **enum**: Each variant is one failure category, carrying a human-readable message
//! - **From trait**: Lets `?` convert library errors into `EngineError` automatically
//! - **Display trait**: The message shown to the user through `last_error`

use std::fmt;

/// Errors produced by the live audio engine.
///
/// ## Error Categories:
/// - **Permission**: Microphone access denied or no input device present
/// - **Device**: Audio device failed to open or start
/// - **Transport**: Remote peer unreachable, socket failure, send failure
/// - **Protocol**: Peer sent something we cannot interpret
/// - **Config**: Configuration file or environment variable problems
/// - **Io**: Filesystem problems (WAV artifacts, file-backed microphone)
/// - **InvalidState**: Operation not allowed in the current session state
///
/// ## Usage Example:
/// ```rust
/// use agent_live_audio::error::EngineError;
/// let err = EngineError::Permission("microphone access denied".to_string());
/// assert_eq!(err.to_string(), "Permission error: microphone access denied");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Microphone permission denied or no capture device available
    Permission(String),

    /// Audio device could not be opened or started
    Device(String),

    /// Transport could not connect, send or close
    Transport(String),

    /// Peer message could not be decoded
    Protocol(String),

    /// Configuration problems
    Config(String),

    /// Filesystem and stream I/O failures
    Io(String),

    /// Operation rejected by the session state machine
    InvalidState(String),
}

impl EngineError {
    /// Short machine-readable category, used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Permission(_) => "permission",
            EngineError::Device(_) => "device",
            EngineError::Transport(_) => "transport",
            EngineError::Protocol(_) => "protocol",
            EngineError::Config(_) => "config",
            EngineError::Io(_) => "io",
            EngineError::InvalidState(_) => "invalid_state",
        }
    }
}

/// Implementation of the Display trait for EngineError.
///
/// ## Purpose:
/// This is the text that ends up in the session's `last_error`, so it should read
/// well to a user and not only to a developer.
impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Permission(msg) => write!(f, "Permission error: {}", msg),
            EngineError::Device(msg) => write!(f, "Audio device error: {}", msg),
            EngineError::Transport(msg) => write!(f, "Transport error: {}", msg),
            EngineError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            EngineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            EngineError::Io(msg) => write!(f, "I/O error: {}", msg),
            EngineError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Automatic conversion from anyhow::Error to EngineError.
///
/// ## Usage:
/// Collaborators that report failures through anyhow (custom backends, connectors)
/// can still use `?` inside functions returning `EngineResult`.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Device(err.to_string())
    }
}

/// Peer messages are JSON, so parsing failures are protocol errors.
impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Protocol(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to EngineError.
///
/// ## When this happens:
/// - live-audio.toml has invalid syntax
/// - An environment override cannot be parsed into the expected type
impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::Transport(err.to_string())
    }
}

/// Type alias for Results that use the engine error type.
///
/// ## Usage Example:
/// ```rust
/// use agent_live_audio::error::EngineResult;
/// fn open() -> EngineResult<u32> {
///     Ok(24_000)
/// }
/// assert_eq!(open().unwrap(), 24_000);
/// ```
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = EngineError::Transport("peer unreachable".to_string());
        assert_eq!(err.to_string(), "Transport error: peer unreachable");
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EngineError = json_err.into();
        assert_eq!(err.kind(), "protocol");

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.wav");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(ref msg) if msg.contains("missing.wav")));
    }
}
