//! Voice session facade
//!
//! Single entry point tying the subsystems together: microphone capture,
//! chunked upload, the WebSocket, the playback engine and the transcript
//! reconciler. Embedding applications construct a [`VoiceSession`], call
//! `connect()`, and observe the conversation through the message subscriber,
//! the error handler and the live-state getters.
//!
//! # Startup order
//!
//! `connect()` acquires resources strictly in this order, unwinding on the
//! first failure:
//!
//! 1. Microphone (surfaces permission problems before anything opens)
//! 2. Output device
//! 3. WebSocket, then session settings
//! 4. Capture upload begins
//!
//! # Shutdown order
//!
//! `disconnect()` fences background tasks first, then stops capture, closes
//! the socket, tears down playback and clears conversation state. Errors on
//! individual steps are logged and the remaining steps still run.
//!
//! # Error surface
//!
//! Every error reaches the application through the error handler and
//! `last_error()` (latest wins), including locally rejected sends. Fatal
//! errors additionally tear the session down, conversation state included,
//! and land in `Closed`; per-clip decode failures and rejected sends are
//! reported without teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::capture::{run_chunker, ChunkerConfig, Microphone};
use crate::config::{AudioFormat, SessionConfig, SessionSettings};
use crate::error::{ErrorKind, VoiceError};
use crate::playback::{PlaybackEvent, Player};
use crate::protocol::{ClientMessage, ErrorLevel, ServerEvent, ServerMessage};
use crate::reconciler::{MessageSubscriber, ReconcileAction, Reconciler};
use crate::socket::{Phase, Socket, SocketEvent};
use crate::spectrum::{run_spectrum_emitter, shared_spectrum, spectrum_channel};
use crate::spectrum::{SharedSpectrum, NUM_BANDS};

/// Callback invoked for every error surfaced by the session.
pub type ErrorHandler = Box<dyn Fn(&VoiceError) + Send>;

/// Bound on raw sample batches buffered between the device callback and the
/// chunker.
const SAMPLE_CAPACITY: usize = 64;

/// Bound on encoded chunks buffered between the chunker and the socket.
const CHUNK_CAPACITY: usize = 32;

/// State shared between the facade and its background tasks.
#[derive(Clone)]
struct Shared {
    status: Arc<Mutex<Phase>>,
    socket: Arc<AsyncMutex<Option<Socket>>>,
    microphone: Arc<Mutex<Option<Microphone>>>,
    player: Arc<Mutex<Option<Player>>>,
    reconciler: Arc<Mutex<Reconciler>>,
    error_handler: Arc<Mutex<Option<ErrorHandler>>>,
    last_error: Arc<Mutex<Option<VoiceError>>>,
    /// Settings re-sent after every (re)connect.
    settings: Arc<Mutex<Option<SessionSettings>>>,
    paused: Arc<AtomicBool>,
}

impl Shared {
    fn status(&self) -> Phase {
        self.status.lock().map(|s| *s).unwrap_or(Phase::Closed)
    }

    fn set_status(&self, status: Phase) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    /// Record an error and notify the handler. Latest error wins.
    fn report(&self, error: &VoiceError) {
        log::error!("Session error [{}]: {}", error.reason(), error);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.clone());
        }
        if let Ok(handler) = self.error_handler.lock() {
            if let Some(handler) = handler.as_ref() {
                handler(error);
            }
        }
    }

    /// Fatal error path: report, then tear everything down. The session
    /// lands in `Closed` with capture and playback stopped.
    async fn fail(&self, error: VoiceError, cancel: &CancellationToken) {
        self.report(&error);
        self.set_status(Phase::Closed);
        cancel.cancel();

        let microphone = self.microphone.lock().ok().and_then(|mut m| m.take());
        if let Some(mut microphone) = microphone {
            if let Err(e) = microphone.stop().await {
                log::warn!("Session: microphone stop during failure teardown: {}", e);
            }
        }
        if let Some(mut socket) = self.socket.lock().await.take() {
            socket.disconnect().await;
        }
        let player = self.player.lock().ok().and_then(|mut p| p.take());
        if let Some(mut player) = player {
            if let Err(e) = player.stop_all() {
                log::warn!("Session: player stop during failure teardown: {}", e);
            }
        }

        // Same final step as a clean disconnect: conversation state goes too
        if let Ok(mut reconciler) = self.reconciler.lock() {
            reconciler.clear();
        }
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// A real-time conversational voice session.
pub struct VoiceSession {
    config: SessionConfig,
    shared: Shared,
    mic_spectrum: SharedSpectrum,
    output_spectrum: SharedSpectrum,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    connected_at: Option<Instant>,
}

impl VoiceSession {
    pub fn new(config: SessionConfig) -> Self {
        let reconciler = Reconciler::new(config.message_history_limit);
        Self {
            config,
            shared: Shared {
                status: Arc::new(Mutex::new(Phase::Idle)),
                socket: Arc::new(AsyncMutex::new(None)),
                microphone: Arc::new(Mutex::new(None)),
                player: Arc::new(Mutex::new(None)),
                reconciler: Arc::new(Mutex::new(reconciler)),
                error_handler: Arc::new(Mutex::new(None)),
                last_error: Arc::new(Mutex::new(None)),
                settings: Arc::new(Mutex::new(None)),
                paused: Arc::new(AtomicBool::new(false)),
            },
            mic_spectrum: shared_spectrum(),
            output_spectrum: shared_spectrum(),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            connected_at: None,
        }
    }

    /// Subscriber invoked for every message released to the application,
    /// including interim transcripts.
    pub fn set_message_subscriber(&mut self, subscriber: MessageSubscriber) {
        if let Ok(mut reconciler) = self.shared.reconciler.lock() {
            reconciler.set_subscriber(subscriber);
        }
    }

    /// Handler invoked for every surfaced error.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        if let Ok(mut slot) = self.shared.error_handler.lock() {
            *slot = Some(handler);
        }
    }

    /// Start the session. A no-op when already connecting or connected.
    pub async fn connect(&mut self) -> Result<(), VoiceError> {
        match self.shared.status() {
            Phase::Connecting | Phase::Open => {
                log::warn!("Session: connect() while active, ignoring");
                return Ok(());
            }
            Phase::Idle | Phase::Closed => {}
        }

        log::info!("Session: connecting");
        self.shared.set_status(Phase::Connecting);
        if let Ok(mut last) = self.shared.last_error.lock() {
            *last = None;
        }
        self.cancel = CancellationToken::new();

        let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_CAPACITY);
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CAPACITY);
        let (mic_spectrum_tx, mic_spectrum_rx) = spectrum_channel();
        let (out_spectrum_tx, out_spectrum_rx) = spectrum_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();

        // 1. Microphone. Kept muted until the socket is open so no audio
        // captured during setup leaks into the stream.
        let microphone = match Microphone::start(&self.config.audio, sample_tx, mic_spectrum_tx) {
            Ok(m) => m,
            Err(e) => {
                self.shared.set_status(Phase::Closed);
                self.shared.report(&e);
                return Err(e);
            }
        };
        microphone.mute();
        let negotiated = microphone.negotiated();

        // 2. Output device
        let player = match Player::start(playback_tx, out_spectrum_tx) {
            Ok(p) => p,
            Err(e) => {
                let mut microphone = microphone;
                if let Err(stop_err) = microphone.stop().await {
                    log::warn!("Session: microphone stop during unwind: {}", stop_err);
                }
                self.shared.set_status(Phase::Closed);
                self.shared.report(&e);
                return Err(e);
            }
        };

        // 3. Socket, then session settings describing the audio we will send
        let mut socket = Socket::new(self.config.clone(), socket_tx);
        if let Err(e) = socket.connect().await {
            let mut microphone = microphone;
            if let Err(stop_err) = microphone.stop().await {
                log::warn!("Session: microphone stop during unwind: {}", stop_err);
            }
            let mut player = player;
            if let Err(stop_err) = player.stop_all() {
                log::warn!("Session: player stop during unwind: {}", stop_err);
            }
            self.shared.set_status(Phase::Closed);
            self.shared.report(&e);
            return Err(e);
        }

        let mut settings = self.config.session_settings.clone().unwrap_or_default();
        if settings.audio.is_none() {
            settings.audio = Some(AudioFormat::linear16(
                negotiated.sample_rate,
                negotiated.channels,
            ));
        }
        if let Err(e) = socket
            .send_message(ClientMessage::SessionSettings {
                settings: settings.clone(),
            })
            .await
        {
            log::warn!("Session: failed to send session settings: {}", e);
        }
        if let Ok(mut slot) = self.shared.settings.lock() {
            *slot = Some(settings);
        }

        // 4. Hand everything to the background tasks and open the gates
        let output_rate = player.output_sample_rate();
        *self.shared.socket.lock().await = Some(socket);
        if let Ok(mut slot) = self.shared.microphone.lock() {
            *slot = Some(microphone);
        }
        if let Ok(mut slot) = self.shared.player.lock() {
            *slot = Some(player);
        }

        let chunker_config = ChunkerConfig {
            sample_rate: negotiated.sample_rate,
            chunk_interval_ms: self.config.chunk_interval_ms,
        };
        let chunker_cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            run_chunker(sample_rx, chunker_config, chunk_tx, chunker_cancel).await;
        }));
        self.tasks.push(tokio::spawn(run_upload(
            chunk_rx,
            self.shared.socket.clone(),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(run_spectrum_emitter(
            mic_spectrum_rx,
            negotiated.sample_rate,
            self.mic_spectrum.clone(),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(run_spectrum_emitter(
            out_spectrum_rx,
            output_rate,
            self.output_spectrum.clone(),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(run_event_loop(
            self.shared.clone(),
            socket_rx,
            playback_rx,
            self.cancel.clone(),
        )));

        if let Ok(slot) = self.shared.microphone.lock() {
            if let Some(microphone) = slot.as_ref() {
                microphone.unmute();
            }
        }
        self.shared.set_status(Phase::Open);
        self.connected_at = Some(Instant::now());
        log::info!("Session: open");
        Ok(())
    }

    /// Stop the session in strict order: fence background tasks, stop
    /// capture, close the socket, tear down playback, clear state.
    ///
    /// Safe to call at any time; returns the first step error, but every
    /// step runs regardless.
    pub async fn disconnect(&mut self) -> Result<(), VoiceError> {
        if self.shared.status() == Phase::Idle {
            return Ok(());
        }
        log::info!("Session: disconnecting");
        let mut first_error: Option<VoiceError> = None;

        // 1. Fence: no more uploads, spectrum frames or routed events
        self.cancel.cancel();

        // 2. Microphone
        let microphone = self.shared.microphone.lock().ok().and_then(|mut m| m.take());
        if let Some(mut microphone) = microphone {
            if let Err(e) = microphone.stop().await {
                log::warn!("Session: microphone stop failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        // 3. Socket (clean close, no Closed event)
        if let Some(mut socket) = self.shared.socket.lock().await.take() {
            socket.disconnect().await;
        }

        // 4. Playback
        let player = self.shared.player.lock().ok().and_then(|mut p| p.take());
        if let Some(mut player) = player {
            if let Err(e) = player.stop_all() {
                log::warn!("Session: player stop failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        // 5. Conversation state, atomically with the phase change
        if let Ok(mut reconciler) = self.shared.reconciler.lock() {
            reconciler.clear();
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        self.connected_at = None;
        self.shared.set_status(Phase::Closed);

        for task in self.tasks.drain(..) {
            task.abort();
        }

        log::info!("Session: closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Outbound messages
    // ------------------------------------------------------------------

    /// Send text the service should treat as user speech.
    pub async fn send_user_input(&self, text: String) -> Result<(), VoiceError> {
        self.send(ClientMessage::UserInput { text }).await
    }

    /// Send text the assistant should speak verbatim.
    pub async fn send_assistant_input(&self, text: String) -> Result<(), VoiceError> {
        self.send(ClientMessage::AssistantInput { text }).await
    }

    /// Push updated session settings mid-conversation.
    pub async fn send_session_settings(&self, settings: SessionSettings) -> Result<(), VoiceError> {
        if let Ok(mut slot) = self.shared.settings.lock() {
            *slot = Some(settings.clone());
        }
        self.send(ClientMessage::SessionSettings { settings }).await
    }

    /// Respond to a pending tool call. `content` must be a JSON document.
    pub async fn send_tool_response(
        &self,
        tool_call_id: String,
        content: String,
    ) -> Result<(), VoiceError> {
        if let Err(e) = validate_tool_payload(&tool_call_id, &content) {
            self.shared.report(&e);
            return Err(e);
        }
        self.send(ClientMessage::ToolResponseMessage {
            tool_call_id,
            content,
        })
        .await
    }

    /// Report a failed tool call back to the service.
    pub async fn send_tool_error(
        &self,
        tool_call_id: String,
        error: String,
        code: Option<String>,
        level: Option<ErrorLevel>,
    ) -> Result<(), VoiceError> {
        if tool_call_id.is_empty() {
            let e = VoiceError::ToolResponseInvalid("tool_call_id is empty".into());
            self.shared.report(&e);
            return Err(e);
        }
        self.send(ClientMessage::ToolErrorMessage {
            tool_call_id,
            error,
            code,
            level,
            content: None,
        })
        .await
    }

    /// Ask the assistant to stop speaking until resumed. Clips already
    /// queued locally stay queued; only the service-side stream pauses.
    pub async fn pause_assistant(&mut self) -> Result<(), VoiceError> {
        self.send(ClientMessage::PauseAssistantMessage).await?;
        self.shared.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Resume assistant speech after a pause.
    pub async fn resume_assistant(&mut self) -> Result<(), VoiceError> {
        self.send(ClientMessage::ResumeAssistantMessage).await?;
        self.shared.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Send over the socket, routing any rejection through the error channel
    /// as well as back to the caller.
    async fn send(&self, message: ClientMessage) -> Result<(), VoiceError> {
        let result = {
            let guard = self.shared.socket.lock().await;
            match guard.as_ref() {
                Some(socket) => socket.send_message(message).await,
                None => Err(VoiceError::SendNotConnected {
                    what: message.label(),
                }),
            }
        };
        if let Err(e) = &result {
            self.shared.report(e);
        }
        result
    }

    // ------------------------------------------------------------------
    // Microphone and output controls
    // ------------------------------------------------------------------

    /// Gate the microphone. The capture stream keeps running; silence is
    /// substituted so timing and chunk cadence are unchanged.
    pub fn mute_microphone(&self) {
        if let Ok(slot) = self.shared.microphone.lock() {
            if let Some(microphone) = slot.as_ref() {
                microphone.mute();
            }
        }
    }

    pub fn unmute_microphone(&self) {
        if let Ok(slot) = self.shared.microphone.lock() {
            if let Some(microphone) = slot.as_ref() {
                microphone.unmute();
            }
        }
    }

    pub fn is_microphone_muted(&self) -> bool {
        self.shared
            .microphone
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|m| m.is_muted()))
            .unwrap_or(false)
    }

    /// Mute playback output. Decoding and queue progression continue.
    pub fn mute_output(&self) -> Result<(), VoiceError> {
        self.with_player(|player| {
            player.mute_output();
            Ok(())
        })
    }

    pub fn unmute_output(&self) -> Result<(), VoiceError> {
        self.with_player(|player| {
            player.unmute_output();
            Ok(())
        })
    }

    pub fn is_output_muted(&self) -> bool {
        self.with_player(|player| Ok(player.is_output_muted()))
            .unwrap_or(false)
    }

    /// Set playback volume, clamped to 0.0-1.0.
    pub fn set_volume(&self, volume: f32) -> Result<(), VoiceError> {
        self.with_player(|player| {
            player.set_volume(volume);
            Ok(())
        })
    }

    pub fn volume(&self) -> f32 {
        self.with_player(|player| Ok(player.volume())).unwrap_or(1.0)
    }

    fn with_player<T>(
        &self,
        f: impl FnOnce(&Player) -> Result<T, VoiceError>,
    ) -> Result<T, VoiceError> {
        let slot = self
            .shared
            .player
            .lock()
            .map_err(|_| VoiceError::PlaybackNotInitialized)?;
        match slot.as_ref() {
            Some(player) => f(player),
            None => Err(VoiceError::PlaybackNotInitialized),
        }
    }

    // ------------------------------------------------------------------
    // Live state
    // ------------------------------------------------------------------

    pub fn status(&self) -> Phase {
        self.shared.status()
    }

    /// Elapsed time since the session opened.
    pub fn call_duration(&self) -> Option<Duration> {
        self.connected_at.map(|t| t.elapsed())
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Whether a clip is currently audible.
    pub fn is_playing(&self) -> bool {
        self.with_player(|player| Ok(player.is_playing())).unwrap_or(false)
    }

    /// Clips queued behind the one playing.
    pub fn queue_len(&self) -> usize {
        self.with_player(|player| Ok(player.queue_len())).unwrap_or(0)
    }

    /// Snapshot of the released message history, oldest first.
    pub fn messages(&self) -> Vec<ServerEvent> {
        self.shared
            .reconciler
            .lock()
            .map(|r| r.history().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_user_message(&self) -> Option<ServerEvent> {
        self.shared
            .reconciler
            .lock()
            .ok()
            .and_then(|r| r.last_user_message().cloned())
    }

    pub fn last_assistant_message(&self) -> Option<ServerEvent> {
        self.shared
            .reconciler
            .lock()
            .ok()
            .and_then(|r| r.last_assistant_message().cloned())
    }

    /// Tool calls still waiting for a response.
    pub fn pending_tool_calls(&self) -> Vec<ServerEvent> {
        self.shared
            .reconciler
            .lock()
            .map(|r| {
                r.tool_calls()
                    .values()
                    .filter(|entry| entry.resolved.is_none())
                    .map(|entry| entry.call.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Chat and chat-group ids assigned by the service, once known.
    pub fn chat_metadata(&self) -> (Option<String>, Option<String>) {
        self.shared
            .reconciler
            .lock()
            .map(|r| {
                let (chat, group) = r.chat_metadata();
                (chat.map(String::from), group.map(String::from))
            })
            .unwrap_or((None, None))
    }

    /// Latest microphone spectrum snapshot (24 bands, 0.0-1.0).
    pub fn microphone_spectrum(&self) -> [f32; NUM_BANDS] {
        self.mic_spectrum
            .lock()
            .map(|s| *s)
            .unwrap_or([0.0; NUM_BANDS])
    }

    /// Latest playback spectrum snapshot (24 bands, 0.0-1.0).
    pub fn output_spectrum(&self) -> [f32; NUM_BANDS] {
        self.output_spectrum
            .lock()
            .map(|s| *s)
            .unwrap_or([0.0; NUM_BANDS])
    }

    /// Most recent surfaced error, if any.
    pub fn last_error(&self) -> Option<VoiceError> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Whether the latest surfaced error came from the given subsystem.
    pub fn has_error(&self, kind: ErrorKind) -> bool {
        self.last_error().map(|e| e.kind() == kind).unwrap_or(false)
    }
}

fn validate_tool_payload(tool_call_id: &str, content: &str) -> Result<(), VoiceError> {
    if tool_call_id.is_empty() {
        return Err(VoiceError::ToolResponseInvalid(
            "tool_call_id is empty".into(),
        ));
    }
    serde_json::from_str::<serde_json::Value>(content)
        .map(|_| ())
        .map_err(|e| VoiceError::ToolResponseInvalid(format!("content is not JSON: {}", e)))
}

/// Forward encoded chunks to the socket until cancelled.
///
/// Send failures during reconnect windows are expected and dropped; the
/// chunker upstream already bounds how much audio can pile up.
async fn run_upload(
    mut chunk_rx: mpsc::Receiver<Vec<u8>>,
    socket: Arc<AsyncMutex<Option<Socket>>>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            recv = chunk_rx.recv() => match recv {
                Some(chunk) => chunk,
                None => break,
            },
        };
        let guard = socket.lock().await;
        match guard.as_ref() {
            Some(socket) => {
                if let Err(e) = socket.send_audio(chunk) {
                    log::debug!("Session: dropping audio chunk: {}", e);
                }
            }
            None => break,
        }
    }
    log::debug!("Session: upload task exiting");
}

/// Central event loop: routes socket events to the player and reconciler,
/// playback signals to the reconciler, and supervises reconnection.
async fn run_event_loop(
    shared: Shared,
    mut socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = socket_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SocketEvent::Opened => {
                        log::debug!("Session: socket opened");
                    }
                    SocketEvent::Message(event) => {
                        handle_server_event(&shared, event, &cancel).await;
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                    SocketEvent::Closed { detail } => {
                        log::warn!("Session: socket closed unexpectedly ({})", detail);
                        if !supervise_reconnect(&shared, &cancel).await {
                            break;
                        }
                    }
                }
            }

            event = playback_rx.recv() => {
                let Some(event) = event else { break };
                if let Ok(mut reconciler) = shared.reconciler.lock() {
                    reconciler.handle_playback_event(&event);
                }
            }
        }
    }
    log::debug!("Session: event loop exiting");
}

/// Route one inbound wire event. Audio goes straight to the player; all
/// other messages go through the reconciler.
async fn handle_server_event(shared: &Shared, event: ServerEvent, cancel: &CancellationToken) {
    match &event.message {
        ServerMessage::AudioOutput { id, data } => {
            let result = {
                let slot = shared.player.lock();
                match slot {
                    Ok(slot) => match slot.as_ref() {
                        Some(player) => player.add_clip(id, data),
                        None => Err(VoiceError::PlaybackNotInitialized),
                    },
                    Err(_) => Err(VoiceError::PlaybackNotInitialized),
                }
            };
            if let Err(e) = result {
                // Scoped to this clip; the queue keeps playing
                shared.report(&e);
            }
        }

        ServerMessage::Error { code, message } => {
            if let Ok(mut reconciler) = shared.reconciler.lock() {
                reconciler.handle_event(event.clone());
            }
            let error = VoiceError::ServerError {
                code: code.clone(),
                message: message.clone(),
            };
            shared.fail(error, cancel).await;
        }

        _ => {
            let actions = shared
                .reconciler
                .lock()
                .map(|mut r| r.handle_event(event))
                .unwrap_or_default();
            for action in actions {
                match action {
                    ReconcileAction::ClearPlaybackQueue => {
                        if let Ok(slot) = shared.player.lock() {
                            if let Some(player) = slot.as_ref() {
                                player.clear_queue();
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Drive bounded reconnection after an unexpected closure. Returns false
/// when the event loop should exit.
async fn supervise_reconnect(shared: &Shared, cancel: &CancellationToken) -> bool {
    shared.set_status(Phase::Connecting);

    let result = {
        let mut guard = shared.socket.lock().await;
        let Some(socket) = guard.as_mut() else {
            return false;
        };
        tokio::select! {
            _ = cancel.cancelled() => return false,
            result = socket.reconnect() => result,
        }
    };

    match result {
        Ok(()) => {
            // Re-assert session settings on the fresh connection
            let settings = shared.settings.lock().ok().and_then(|s| s.clone());
            if let Some(settings) = settings {
                let guard = shared.socket.lock().await;
                if let Some(socket) = guard.as_ref() {
                    if let Err(e) = socket
                        .send_message(ClientMessage::SessionSettings { settings })
                        .await
                    {
                        log::warn!("Session: failed to re-send session settings: {}", e);
                    }
                }
            }
            shared.set_status(Phase::Open);
            true
        }
        Err(e) => {
            shared.fail(e, cancel).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Auth;
    use crate::protocol::parse_text;

    fn session() -> VoiceSession {
        VoiceSession::new(SessionConfig::new(Auth::ApiKey { key: "k".into() }))
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = session();
        assert_eq!(session.status(), Phase::Idle);
        assert!(session.call_duration().is_none());
        assert!(session.messages().is_empty());
        assert!(session.last_error().is_none());
        assert!(!session.has_error(ErrorKind::Socket));
        assert!(!session.is_playing());
        assert!(!session.is_paused());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails_fast() {
        let session = session();
        let err = session.send_user_input("hi".into()).await.unwrap_err();
        assert_eq!(err.reason(), "send_not_connected");
    }

    #[tokio::test]
    async fn test_pause_before_connect_leaves_flag_unset() {
        let mut session = session();
        assert!(session.pause_assistant().await.is_err());
        assert!(!session.is_paused());
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let mut session = session();
        assert!(session.disconnect().await.is_ok());
        assert_eq!(session.status(), Phase::Idle);
    }

    #[test]
    fn test_output_controls_require_player() {
        let session = session();
        assert!(matches!(
            session.set_volume(0.5),
            Err(VoiceError::PlaybackNotInitialized)
        ));
        assert!(matches!(
            session.mute_output(),
            Err(VoiceError::PlaybackNotInitialized)
        ));
        // Getters degrade instead of failing
        assert_eq!(session.volume(), 1.0);
        assert!(!session.is_output_muted());
    }

    #[test]
    fn test_microphone_controls_are_noops_without_device() {
        let session = session();
        session.mute_microphone();
        assert!(!session.is_microphone_muted());
    }

    #[tokio::test]
    async fn test_tool_response_requires_json_content() {
        let session = session();
        let err = session
            .send_tool_response("t1".into(), "not json".into())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "tool_response_invalid");

        let err = session
            .send_tool_response(String::new(), "{}".into())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "tool_response_invalid");

        // Valid payload passes validation and fails only on the socket
        let err = session
            .send_tool_response("t1".into(), r#"{"ok":true}"#.into())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "send_not_connected");
    }

    #[tokio::test]
    async fn test_tool_error_requires_call_id() {
        let session = session();
        let err = session
            .send_tool_error(String::new(), "boom".into(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "tool_response_invalid");
    }

    #[tokio::test]
    async fn test_rejected_send_reaches_error_channel() {
        let mut session = session();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.set_error_handler(Box::new(move |error| {
            sink.lock().unwrap().push(error.reason());
        }));

        let err = session.send_user_input("hello".into()).await.unwrap_err();
        assert_eq!(err.reason(), "send_not_connected");

        // The rejection is an error-channel event, not just a return value
        assert_eq!(
            session.last_error().map(|e| e.reason()),
            Some("send_not_connected")
        );
        assert_eq!(seen.lock().unwrap().as_slice(), &["send_not_connected"]);
        assert!(session.has_error(ErrorKind::Socket));
    }

    #[tokio::test]
    async fn test_invalid_tool_payload_reaches_error_channel() {
        let mut session = session();
        let count = Arc::new(Mutex::new(0u32));
        let sink = count.clone();
        session.set_error_handler(Box::new(move |_| {
            *sink.lock().unwrap() += 1;
        }));

        assert!(session
            .send_tool_response("t1".into(), "not json".into())
            .await
            .is_err());
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(
            session.last_error().map(|e| e.reason()),
            Some("tool_response_invalid")
        );
    }

    #[tokio::test]
    async fn test_server_error_event_clears_conversation_state() {
        let session = session();
        {
            let mut reconciler = session.shared.reconciler.lock().unwrap();
            reconciler.handle_event(
                parse_text(r#"{"type":"user_message","message":{"role":"user","content":"Hi"}}"#)
                    .unwrap(),
            );
            reconciler.handle_event(
                parse_text(
                    r#"{"type":"assistant_message","id":"a1","message":{"role":"assistant","content":"pending"}}"#,
                )
                .unwrap(),
            );
            reconciler.handle_event(
                parse_text(
                    r#"{"type":"tool_call","tool_call_id":"t1","name":"f","parameters":"{}"}"#,
                )
                .unwrap(),
            );
        }
        session.shared.paused.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (_playback_tx, playback_rx) = mpsc::unbounded_channel::<PlaybackEvent>();
        let event_loop = tokio::spawn(run_event_loop(
            session.shared.clone(),
            socket_rx,
            playback_rx,
            cancel.clone(),
        ));

        socket_tx
            .send(SocketEvent::Message(
                parse_text(r#"{"type":"error","code":"E1","message":"boom"}"#).unwrap(),
            ))
            .unwrap();
        event_loop.await.unwrap();

        // Fatal teardown ends in Closed with conversation state cleared
        assert_eq!(session.status(), Phase::Closed);
        assert_eq!(
            session.last_error().map(|e| e.reason()),
            Some("server_error")
        );
        assert!(session.messages().is_empty());
        assert!(session.pending_tool_calls().is_empty());
        assert!(!session.is_paused());
        assert_eq!(
            session.shared.reconciler.lock().unwrap().pending_count(),
            0
        );
    }

    #[test]
    fn test_spectra_start_zeroed() {
        let session = session();
        assert_eq!(session.microphone_spectrum(), [0.0; NUM_BANDS]);
        assert_eq!(session.output_spectrum(), [0.0; NUM_BANDS]);
    }
}
