//! # WebSocket Transport
//!
//! Client side of the JSON-over-WebSocket protocol spoken with the conversational peer.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the engine connects to `transport.url` (api key as `?key=`)
//! 2. **Setup**: first message is `{"type": "setup", "model": ..., "sample_rate": 24000}`
//! 3. **Audio Streaming**: each capture frame is sent as a `realtime_input` message
//! 4. **Server Content**: the peer answers with `server_content` messages carrying
//!    base64 audio and/or the `interrupted` / `turn_complete` flags
//! 5. **Close**: either side sends a close frame; the reader reports `Closed`
//!
//! ## Message Format:
//! - **Engine → Peer**: JSON text frames (`setup`, `realtime_input`)
//! - **Peer → Engine**: JSON text frames (`setup_complete`, `server_content`, `error`)

use crate::audio::capture::EncodedFrame;
use crate::config::TransportConfig;
use crate::error::{EngineError, EngineResult};
use crate::transport::{Connector, EventSender, PeerMessage, Transport, TransportEvent};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON messages exchanged with the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// Session setup, sent once after the socket opens
    #[serde(rename = "setup")]
    Setup {
        /// Model the peer should run for this conversation
        model: String,
        /// Rate of the audio the engine will stream
        sample_rate: u32,
    },

    /// Peer acknowledged the setup
    #[serde(rename = "setup_complete")]
    SetupComplete,

    /// One microphone frame
    #[serde(rename = "realtime_input")]
    RealtimeInput {
        /// e.g. "audio/pcm;rate=24000"
        mime_type: String,
        /// Base64 PCM16 little-endian mono
        data: String,
    },

    /// Model output and turn signals
    #[serde(rename = "server_content")]
    ServerContent {
        #[serde(default)]
        audio: Option<String>,
        #[serde(default)]
        interrupted: bool,
        #[serde(default)]
        turn_complete: bool,
    },

    /// Peer-side failure; ends the session
    #[serde(rename = "error")]
    Error {
        message: String,
    },
}

impl WireMessage {
    pub fn from_frame(frame: &EncodedFrame) -> Self {
        WireMessage::RealtimeInput {
            mime_type: frame.mime_type(),
            data: frame.data.clone(),
        }
    }
}

/// Opens WebSocket transports using the configured endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: TransportConfig,
    sample_rate: u32,
}

impl WebSocketConnector {
    pub fn new(config: TransportConfig, sample_rate: u32) -> Self {
        Self { config, sample_rate }
    }

    /// Endpoint with the api key appended as a query parameter.
    pub fn endpoint(&self) -> String {
        match &self.config.api_key {
            Some(key) if !key.is_empty() => {
                let separator = if self.config.url.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.config.url, separator, key)
            }
            _ => self.config.url.clone(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, events: EventSender) -> EngineResult<Arc<dyn Transport>> {
        info!("Connecting to peer at {}", self.config.url);

        let (socket, response) = connect_async(self.endpoint()).await?;
        debug!("WebSocket handshake complete: HTTP {}", response.status());

        let (mut sink, stream) = socket.split();

        let setup = WireMessage::Setup {
            model: self.config.model.clone(),
            sample_rate: self.sample_rate,
        };
        sink.send(Message::Text(serde_json::to_string(&setup)?)).await?;

        let _ = events.send(TransportEvent::Opened);
        let reader = tokio::spawn(read_loop(stream, events));

        Ok(Arc::new(WebSocketTransport {
            sink: Mutex::new(sink),
            reader: std::sync::Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }))
    }
}

/// An open WebSocket to the peer.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<Socket, Message>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: &EncodedFrame) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::InvalidState("Transport already closed".to_string()));
        }

        let text = serde_json::to_string(&WireMessage::from_frame(frame))?;
        self.sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("Close frame not delivered: {}", e);
        }
        let _ = sink.close().await;

        if let Some(reader) = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take() {
            reader.abort();
        }

        info!("WebSocket transport closed");
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            reader.abort();
        }
    }
}

/// Forward peer traffic as transport events until the socket ends.
async fn read_loop(mut stream: SplitStream<Socket>, events: EventSender) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(event) = parse_text(&text) {
                    let fatal = matches!(event, TransportEvent::Error(_));
                    if events.send(event).is_err() || fatal {
                        return;
                    }
                }
            }
            Ok(Message::Binary(data)) => {
                debug!("Ignoring {} byte binary frame from peer", data.len());
            }
            Ok(Message::Close(frame)) => {
                info!("Peer closed the connection: {:?}", frame);
                let _ = events.send(TransportEvent::Closed);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                let _ = events.send(TransportEvent::Error(e.to_string()));
                return;
            }
        }
    }

    let _ = events.send(TransportEvent::Closed);
}

/// Interpret one text frame. Unparseable frames are logged and skipped.
fn parse_text(text: &str) -> Option<TransportEvent> {
    match serde_json::from_str::<WireMessage>(text) {
        Ok(WireMessage::ServerContent {
            audio,
            interrupted,
            turn_complete,
        }) => Some(TransportEvent::Message(PeerMessage {
            audio_base64: audio,
            interrupted,
            turn_complete,
        })),
        Ok(WireMessage::SetupComplete) => {
            debug!("Peer setup complete");
            None
        }
        Ok(WireMessage::Error { message }) => Some(TransportEvent::Error(message)),
        Ok(other) => {
            warn!("Unexpected message from peer: {:?}", other);
            None
        }
        Err(e) => {
            warn!("Failed to parse peer message: {}", e);
            None
        }
    }
}
