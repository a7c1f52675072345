//! # agent-live-audio
//!
//! Real-time audio streaming for a live spoken conversation with a remote agent.
//! Microphone audio is captured, resampled to 24kHz PCM16 and streamed upstream while
//! PCM chunks from the agent are played back gaplessly. An interruption from the peer
//! silences playback immediately.
//!
//! The entry point is [`session::LiveSession`], built from an [`device::AudioBackend`]
//! and a [`transport::Connector`].

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod state;
pub mod transport;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use session::LiveSession;
pub use state::{SessionSnapshot, SessionStatus};
