//! In-memory transport: a scripted peer for tests and offline runs.

use crate::audio::capture::EncodedFrame;
use crate::error::{EngineError, EngineResult};
use crate::transport::{Connector, EventSender, PeerMessage, Transport, TransportEvent};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct PeerState {
    events: Option<EventSender>,
    sent: Vec<EncodedFrame>,
    connects: usize,
    close_calls: usize,
    closed: bool,
    fail_sends: bool,
    refuse_with: Option<String>,
}

fn lock(state: &Mutex<PeerState>) -> MutexGuard<'_, PeerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connector whose peer is driven through a `PeerHandle`.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<PeerState>>,
    open_on_connect: bool,
}

/// Test-side view of the in-memory peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    state: Arc<Mutex<PeerState>>,
}

impl MemoryConnector {
    /// A peer that reports `Opened` as soon as a session connects.
    pub fn new() -> (Self, PeerHandle) {
        let state = Arc::new(Mutex::new(PeerState::default()));
        (
            Self {
                state: state.clone(),
                open_on_connect: true,
            },
            PeerHandle { state },
        )
    }

    /// A peer that stays silent after connect until `PeerHandle::open` is called.
    pub fn deferred() -> (Self, PeerHandle) {
        let (mut connector, handle) = Self::new();
        connector.open_on_connect = false;
        (connector, handle)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, events: EventSender) -> EngineResult<Arc<dyn Transport>> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.refuse_with.clone() {
            return Err(EngineError::Transport(reason));
        }

        state.connects += 1;
        state.closed = false;
        if self.open_on_connect {
            let _ = events.send(TransportEvent::Opened);
        }
        state.events = Some(events);

        Ok(Arc::new(MemoryTransport {
            state: self.state.clone(),
        }))
    }
}

struct MemoryTransport {
    state: Arc<Mutex<PeerState>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: &EncodedFrame) -> EngineResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(EngineError::InvalidState("Transport already closed".to_string()));
        }
        if state.fail_sends {
            return Err(EngineError::Transport("Simulated send failure".to_string()));
        }
        state.sent.push(frame.clone());
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        let mut state = lock(&self.state);
        state.close_calls += 1;
        state.closed = true;
        state.events = None;
        Ok(())
    }
}

impl PeerHandle {
    /// Deliver an event to the connected session. Returns false if nobody listens.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match &lock(&self.state).events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Opened)
    }

    pub fn send_audio(&self, base64: impl Into<String>) -> bool {
        self.emit(TransportEvent::Message(PeerMessage::audio(base64)))
    }

    pub fn interrupt(&self) -> bool {
        self.emit(TransportEvent::Message(PeerMessage::interrupted()))
    }

    pub fn close(&self) -> bool {
        self.emit(TransportEvent::Closed)
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(message.into()))
    }

    /// Frames the session has sent so far.
    pub fn sent_frames(&self) -> Vec<EncodedFrame> {
        lock(&self.state).sent.clone()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }

    pub fn set_fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }

    /// Make the next connects fail with `reason` (`None` to accept again).
    pub fn refuse_connections(&self, reason: Option<&str>) {
        lock(&self.state).refuse_with = reason.map(str::to_string);
    }
}
