//! # Live Session
//!
//! Orchestrates one conversation: acquires the output graph, microphone and transport,
//! runs the uplink and downlink, and releases everything exactly once.
//!
//! ## Session Lifecycle:
//! 1. **connect**: `Idle/Closed/Error → Connecting`, resources acquired in order
//!    (output, microphone, transport). Any failure releases what was acquired and
//!    moves to `Error` with a message. A `disconnect()` while connecting cancels the
//!    attempt and moves to `Closed`.
//! 2. **Opened**: the transport reports open, capture frames start flowing, `Live`
//! 3. **Live**: downlink audio is scheduled gaplessly, interruptions flush playback
//! 4. **End**: `disconnect()` → `Closed`; peer close → `Closed`; peer error → `Error`
//!
//! ## Execution domains:
//! - **Device thread**: capture callback (`CapturePipeline`), never blocks
//! - **Uplink task**: drains the frame queue into the transport
//! - **Downlink task**: owns the playback scheduler; handles transport events and
//!   chunk completions one at a time
//! - **Control**: `connect`, `disconnect`, `set_muted` from the caller
//!
//! ## Thread Safety:
//! Everything the tasks share lives in one `Arc<Shared>`. State transitions are
//! serialized by an async mutex. The mutex is never held while waiting on the peer:
//! a connect in flight is registered as a `PendingConnect` and only commits its
//! resources if it is still pending when acquisition finishes.

use crate::audio::buffer::AnalysisBuffer;
use crate::audio::capture::{CaptureGate, CapturePipeline};
use crate::audio::interruption::InterruptionController;
use crate::audio::mixer::OutputMixer;
use crate::audio::playback::{ChunkId, PlaybackScheduler};
use crate::audio::uplink::{uplink_channel, Uplink};
use crate::config::EngineConfig;
use crate::device::{AudioBackend, StreamHandle};
use crate::error::{EngineError, EngineResult};
use crate::state::{MetricsSnapshot, SessionMetrics, SessionSnapshot, SessionStatus};
use crate::transport::{Connector, DownlinkEvent, EventReceiver, Transport, TransportEvent};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything held while a session is connecting or live.
struct ActiveResources {
    session_id: Uuid,
    mixer: OutputMixer,
    output: Option<Box<dyn StreamHandle>>,
    input: Option<Box<dyn StreamHandle>>,
    transport: Option<Arc<dyn Transport>>,
    uplink: Option<JoinHandle<()>>,
    downlink: Option<JoinHandle<()>>,
}

impl ActiveResources {
    fn new(session_id: Uuid, mixer: OutputMixer) -> Self {
        Self {
            session_id,
            mixer,
            output: None,
            input: None,
            transport: None,
            uplink: None,
            downlink: None,
        }
    }

    /// Release in order: stop capture, close the transport, release the microphone,
    /// stop the output graph. The downlink task is aborted first unless it is the
    /// caller. `gate` is `None` for resources that never went live, whose gate may
    /// already belong to a newer session.
    async fn release(mut self, gate: Option<&CaptureGate>, keep_downlink: bool) {
        if let Some(downlink) = self.downlink.take() {
            if !keep_downlink {
                downlink.abort();
            }
        }

        if let Some(gate) = gate {
            gate.set_transport_active(false);
        }
        if let Some(uplink) = self.uplink.take() {
            uplink.abort();
        }

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Transport close failed: {}", e);
            }
        }

        if let Some(mut input) = self.input.take() {
            input.stop();
        }

        if let Some(mut output) = self.output.take() {
            output.stop();
        }
        self.mixer.halt();
        debug!(session_id = %self.session_id, "Session resources released");
    }

    /// Best-effort synchronous release, used when the session is dropped while live.
    fn abort_now(mut self, gate: &CaptureGate) {
        gate.set_transport_active(false);
        for task in [self.uplink.take(), self.downlink.take()].into_iter().flatten() {
            task.abort();
        }
        if let Some(mut input) = self.input.take() {
            input.stop();
        }
        if let Some(mut output) = self.output.take() {
            output.stop();
        }
        self.mixer.halt();
    }
}

/// A connect attempt still acquiring resources.
struct PendingConnect {
    session_id: Uuid,
    cancel: oneshot::Sender<()>,
}

fn cancelled_error() -> EngineError {
    EngineError::InvalidState("Connect cancelled by disconnect".to_string())
}

/// State shared between the session handle and its tasks.
struct Shared {
    state: watch::Sender<SessionSnapshot>,
    taps: watch::Sender<Option<AnalysisBuffer>>,
    gate: CaptureGate,
    metrics: Arc<SessionMetrics>,
    resources: Mutex<Option<ActiveResources>>,
    pending: std::sync::Mutex<Option<PendingConnect>>,
    lifecycle: Mutex<()>,
}

impl Shared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingConnect>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of the pending connect for `session_id`. False when a
    /// disconnect (or a newer connect) got there first.
    ///
    /// Must be called with the lifecycle lock held.
    fn claim_pending(&self, session_id: Uuid) -> bool {
        let mut pending = self.lock_pending();
        match pending.as_ref() {
            Some(current) if current.session_id == session_id => {
                pending.take();
                true
            }
            _ => false,
        }
    }

    /// Tear down the session `session_id` (or whatever is active when `None`).
    ///
    /// Must be called with the lifecycle lock held.
    async fn teardown(
        &self,
        session_id: Option<Uuid>,
        status: SessionStatus,
        error: Option<String>,
        from_downlink: bool,
    ) {
        let resources = {
            let mut slot = self.resources.lock().await;
            match slot.as_ref() {
                Some(active) if session_id.map_or(true, |id| id == active.session_id) => slot.take(),
                _ => None,
            }
        };

        if let Some(resources) = resources {
            resources.release(Some(&self.gate), from_downlink).await;
            self.taps.send_replace(None);
        }

        self.state.send_modify(|snapshot| {
            snapshot.status = status;
            snapshot.live_since = None;
            if let Some(message) = error {
                snapshot.last_error = Some(message);
            }
        });
        info!("Session {}", status);
    }
}

/// A live audio conversation with a remote peer.
///
/// ## Usage Example:
/// ```rust,no_run
/// # async fn run() -> agent_live_audio::error::EngineResult<()> {
/// use agent_live_audio::{config::EngineConfig, device, session::LiveSession, transport::WebSocketConnector};
/// use std::sync::Arc;
///
/// let config = EngineConfig::default();
/// let backend = device::select_backend(&config.audio)?;
/// let connector = Arc::new(WebSocketConnector::new(config.transport.clone(), config.audio.target_rate));
/// let session = LiveSession::new(config, backend, connector);
/// session.connect().await?;
/// session.set_muted(true);
/// session.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct LiveSession {
    config: EngineConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl LiveSession {
    pub fn new(config: EngineConfig, backend: Arc<dyn AudioBackend>, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        let (taps, _) = watch::channel(None);
        Self {
            config,
            backend,
            connector,
            shared: Arc::new(Shared {
                state,
                taps,
                gate: CaptureGate::new(),
                metrics: Arc::new(SessionMetrics::default()),
                resources: Mutex::new(None),
                pending: std::sync::Mutex::new(None),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Start a session. A no-op while one is already connecting or live.
    ///
    /// ## Errors:
    /// - `Permission`: no microphone, or access denied
    /// - `Device`: the output graph could not start
    /// - `Transport`: the peer is unreachable
    /// - `InvalidState`: `disconnect()` was called before the session was set up
    ///
    /// On error the session is in `Error` with `last_error` set, and nothing is held.
    /// A cancelled connect leaves the session `Closed` instead.
    pub async fn connect(&self) -> EngineResult<()> {
        let (session_id, cancelled) = {
            let _lifecycle = self.shared.lifecycle.lock().await;

            let current = self.status();
            if current.is_active() {
                debug!("connect() ignored, session is {}", current);
                return Ok(());
            }

            let session_id = Uuid::new_v4();
            let (cancel, cancelled) = oneshot::channel();
            *self.shared.lock_pending() = Some(PendingConnect { session_id, cancel });
            self.shared.state.send_modify(|snapshot| {
                snapshot.session_id = Some(session_id);
                snapshot.status = SessionStatus::Connecting;
                snapshot.last_error = None;
                snapshot.live_since = None;
            });
            info!(%session_id, backend = self.backend.name(), "Connecting live session");
            (session_id, cancelled)
        };

        let result = self.start(session_id, cancelled).await;
        if let Err(e) = &result {
            let _lifecycle = self.shared.lifecycle.lock().await;
            if self.shared.claim_pending(session_id) {
                error!(%session_id, error_kind = e.kind(), "Failed to start session: {}", e);
                self.shared.state.send_modify(|snapshot| {
                    snapshot.status = SessionStatus::Error;
                    snapshot.last_error = Some(e.to_string());
                });
            } else {
                debug!(%session_id, "Connect abandoned: {}", e);
            }
        }
        result
    }

    async fn start(&self, session_id: Uuid, cancelled: oneshot::Receiver<()>) -> EngineResult<()> {
        let output_rate = self.backend.output_sample_rate()?;
        let (mixer, ended) = OutputMixer::new(output_rate, self.config.visualizer.fft_size);
        let mut resources = ActiveResources::new(session_id, mixer.clone());

        let events = match self.acquire(&mut resources, cancelled).await {
            Ok(events) => events,
            Err(e) => {
                resources.release(None, false).await;
                return Err(e);
            }
        };

        let _lifecycle = self.shared.lifecycle.lock().await;
        if !self.shared.claim_pending(session_id) {
            resources.release(None, false).await;
            return Err(cancelled_error());
        }

        let scheduler = PlaybackScheduler::new(mixer.clone(), self.config.audio.downlink_rate)
            .with_metrics(self.shared.metrics.clone());
        self.shared.taps.send_replace(Some(mixer.tap()));

        let task = DownlinkTask {
            shared: self.shared.clone(),
            session_id,
            scheduler,
            interruption: InterruptionController::new(),
            events,
            ended,
        };
        resources.downlink = Some(tokio::spawn(task.run()));
        *self.shared.resources.lock().await = Some(resources);
        Ok(())
    }

    /// Acquire output, microphone and transport, in that order, into `resources`.
    async fn acquire(
        &self,
        resources: &mut ActiveResources,
        cancelled: oneshot::Receiver<()>,
    ) -> EngineResult<EventReceiver> {
        let audio = &self.config.audio;

        resources.output = Some(self.backend.open_output(resources.mixer.clone())?);

        let input_rate = self.backend.input_sample_rate()?;
        let (frames_tx, frames_rx) = uplink_channel(audio.uplink_queue_frames);
        self.shared.gate.set_transport_active(false);
        let pipeline = CapturePipeline::new(
            input_rate,
            audio.target_rate,
            self.shared.gate.clone(),
            frames_tx,
            self.shared.metrics.clone(),
        );
        resources.input = Some(
            self.backend
                .open_input(Box::new(pipeline.into_callback(audio.capture_frame_size)))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = tokio::select! {
            transport = self.connector.connect(events_tx) => transport?,
            _ = cancelled => return Err(cancelled_error()),
        };
        resources.transport = Some(transport.clone());
        resources.uplink = Some(Uplink::new(transport, self.shared.metrics.clone()).spawn(frames_rx));

        Ok(events_rx)
    }

    /// End the session. Safe to call in any state, any number of times.
    pub async fn disconnect(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let pending = self.shared.lock_pending().take();
        if let Some(pending) = pending {
            info!(session_id = %pending.session_id, "Cancelling connect in progress");
            let _ = pending.cancel.send(());
        }
        self.shared
            .teardown(None, SessionStatus::Closed, None, false)
            .await;
    }

    /// Mute or unmute the microphone. Muted frames are dropped before encoding.
    pub fn set_muted(&self, muted: bool) {
        self.shared.gate.set_muted(muted);
        self.shared.state.send_modify(|snapshot| snapshot.muted = muted);
        debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    pub fn is_muted(&self) -> bool {
        self.shared.gate.is_muted()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.state.borrow().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.borrow().clone()
    }

    /// Observe every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.state.subscribe()
    }

    /// Observe the output analysis tap (`None` while no output graph exists).
    pub fn analysis_taps(&self) -> watch::Receiver<Option<AnalysisBuffer>> {
        self.shared.taps.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.shared.resources.try_lock() {
            if let Some(resources) = slot.take() {
                warn!("Live session dropped without disconnect, aborting");
                resources.abort_now(&self.shared.gate);
            }
        }
    }
}

/// Owns the playback scheduler and reacts to the peer.
struct DownlinkTask {
    shared: Arc<Shared>,
    session_id: Uuid,
    scheduler: PlaybackScheduler<OutputMixer>,
    interruption: InterruptionController,
    events: EventReceiver,
    ended: mpsc::UnboundedReceiver<ChunkId>,
}

impl DownlinkTask {
    async fn run(mut self) {
        debug!(session_id = %self.session_id, "Downlink started");
        let (status, error) = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(TransportEvent::Opened) => self.on_opened(),
                    Some(event) => {
                        if let Some(end) = self.dispatch(event) {
                            break end;
                        }
                    }
                    None => break (SessionStatus::Closed, None),
                },
                Some(id) = self.ended.recv() => {
                    self.scheduler.on_ended(id);
                }
            }
        };

        let _lifecycle = self.shared.lifecycle.lock().await;
        self.shared
            .teardown(Some(self.session_id), status, error, true)
            .await;
    }

    fn on_opened(&mut self) {
        self.shared.gate.set_transport_active(true);
        self.shared.state.send_if_modified(|snapshot| {
            if snapshot.status != SessionStatus::Connecting {
                return false;
            }
            snapshot.status = SessionStatus::Live;
            snapshot.live_since = Some(Utc::now());
            true
        });
        info!(session_id = %self.session_id, "Session live");
    }

    /// Apply one transport event. Returns the final status when the session must end.
    fn dispatch(&mut self, event: TransportEvent) -> Option<(SessionStatus, Option<String>)> {
        for downlink in DownlinkEvent::from_transport(event) {
            match downlink {
                DownlinkEvent::AudioChunk(bytes) => {
                    self.scheduler.schedule_pcm(&bytes);
                }
                DownlinkEvent::Interrupted => {
                    self.interruption.interrupt(&mut self.scheduler);
                }
                DownlinkEvent::TurnComplete => {
                    SessionMetrics::bump(&self.shared.metrics.turns_completed);
                    debug!("Peer turn complete");
                }
                DownlinkEvent::Closed => {
                    info!("Peer closed the session");
                    return Some((SessionStatus::Closed, None));
                }
                DownlinkEvent::Error(message) => {
                    error!("Peer error: {}", message);
                    let message = EngineError::Transport(message).to_string();
                    return Some((SessionStatus::Error, Some(message)));
                }
            }
        }
        None
    }
}
