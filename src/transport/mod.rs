//! # Transport Module
//!
//! The message channel between the engine and the remote conversational peer.
//!
//! ## Key Components:
//! - **Transport / Connector traits**: the seam between the audio engine and a concrete
//!   channel, so sessions can run over a WebSocket or an in-memory peer
//! - **TransportEvent**: what a transport reports (open, message, close, error)
//! - **DownlinkEvent**: the engine-level meaning of a peer message
//!
//! ## Message Shapes:
//! - Outgoing: `{ data: base64(PCM16), mime_type: "audio/pcm;rate=24000" }`
//! - Incoming: optional base64 audio, an `interrupted` flag, a `turn_complete` flag

pub mod memory;
pub mod websocket;

use crate::audio::capture::EncodedFrame;
use crate::audio::codec::decode_base64;
use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use memory::{MemoryConnector, PeerHandle};
pub use websocket::{WebSocketConnector, WireMessage};

/// Content of one message from the peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    /// Base64 PCM16 mono audio at the downlink rate
    #[serde(default)]
    pub audio_base64: Option<String>,
    /// The peer detected the user speaking over it
    #[serde(default)]
    pub interrupted: bool,
    /// The peer finished its turn
    #[serde(default)]
    pub turn_complete: bool,
}

impl PeerMessage {
    pub fn audio(data: impl Into<String>) -> Self {
        Self {
            audio_base64: Some(data.into()),
            ..Self::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Self::default()
        }
    }
}

/// Events a transport delivers to the session's downlink task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Message(PeerMessage),
    Closed,
    Error(String),
}

/// Engine-level interpretation of transport traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkEvent {
    /// Decoded PCM16 bytes to schedule for playback
    AudioChunk(Vec<u8>),
    Interrupted,
    TurnComplete,
    Closed,
    Error(String),
}

impl DownlinkEvent {
    /// Split a peer message into downlink events.
    ///
    /// ## Ordering:
    /// Audio comes first, then the interruption, then turn completion. A message that
    /// carries both audio and `interrupted` therefore schedules its audio and stops it
    /// immediately, which matches a peer that flushes a partial chunk before barging out.
    pub fn from_message(message: PeerMessage) -> Vec<DownlinkEvent> {
        let mut events = Vec::with_capacity(1);
        if let Some(data) = message.audio_base64 {
            events.push(DownlinkEvent::AudioChunk(decode_base64(&data)));
        }
        if message.interrupted {
            events.push(DownlinkEvent::Interrupted);
        }
        if message.turn_complete {
            events.push(DownlinkEvent::TurnComplete);
        }
        events
    }

    /// Translate any transport event.
    pub fn from_transport(event: TransportEvent) -> Vec<DownlinkEvent> {
        match event {
            TransportEvent::Message(message) => Self::from_message(message),
            TransportEvent::Closed => vec![DownlinkEvent::Closed],
            TransportEvent::Error(e) => vec![DownlinkEvent::Error(e)],
            TransportEvent::Opened => Vec::new(),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// An open channel to the peer.
///
/// ## Contract:
/// - `send` may fail per frame; the caller logs and continues
/// - `close` is called at most once by the session, and must not panic if the peer
///   already went away
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: &EncodedFrame) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;
}

/// Opens transports. Events (including `Opened`) are delivered on `events`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, events: EventSender) -> EngineResult<Arc<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_base64;

    #[test]
    fn test_audio_before_interruption() {
        let message = PeerMessage {
            audio_base64: Some(encode_base64(&[1, 0, 2, 0])),
            interrupted: true,
            turn_complete: false,
        };
        let events = DownlinkEvent::from_message(message);
        assert_eq!(
            events,
            vec![DownlinkEvent::AudioChunk(vec![1, 0, 2, 0]), DownlinkEvent::Interrupted]
        );
    }

    #[test]
    fn test_empty_message_yields_nothing() {
        assert!(DownlinkEvent::from_message(PeerMessage::default()).is_empty());
        assert!(DownlinkEvent::from_transport(TransportEvent::Opened).is_empty());
    }

    #[test]
    fn test_turn_complete_and_close() {
        let message = PeerMessage {
            turn_complete: true,
            ..PeerMessage::default()
        };
        assert_eq!(DownlinkEvent::from_message(message), vec![DownlinkEvent::TurnComplete]);
        assert_eq!(
            DownlinkEvent::from_transport(TransportEvent::Closed),
            vec![DownlinkEvent::Closed]
        );
    }
}
