//! WebSocket connection state machine
//!
//! Owns the connection lifecycle for a voice session.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish the WebSocket with credentials on the URL
//! 2. `send_message()` / `send_audio()` - Outbound text and binary frames
//! 3. The reader task parses inbound frames in arrival order and forwards
//!    them as [`SocketEvent`]s
//! 4. `disconnect()` - Clean shutdown; no `Closed` event is emitted
//!
//! # Phases
//!
//! `Idle -> Connecting -> Open -> Closed`, with `Closed -> Connecting` on
//! reconnect. `connect()` while already `Connecting` or `Open` is a no-op.
//! Sends outside `Open` fail with [`VoiceError::SendNotConnected`] without
//! touching the wire.
//!
//! Parse failures (unknown types, malformed frames) are protocol noise: they
//! are logged at debug level and dropped, never surfaced as session errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::config::SessionConfig;
use crate::error::VoiceError;
use crate::protocol::{parse_binary, parse_text, ClientMessage, ServerEvent};

/// Timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on queued outbound frames. Audio chunks beyond this are dropped
/// rather than letting a stalled socket back up the capture pipeline.
const OUTBOUND_CAPACITY: usize = 256;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Never connected.
    Idle,
    /// Handshake in flight.
    Connecting,
    /// Connected; sends are allowed.
    Open,
    /// Connection ended (cleanly or not).
    Closed,
}

/// Events emitted by the socket toward the session event loop.
#[derive(Debug)]
pub enum SocketEvent {
    /// The connection is open and configured.
    Opened,
    /// One parsed inbound frame, in arrival order.
    Message(ServerEvent),
    /// The connection dropped unexpectedly. Not emitted for `disconnect()`.
    Closed { detail: String },
}

enum Outbound {
    Text(String),
    Audio(Vec<u8>),
    Close,
}

/// Handle to the WebSocket connection.
///
/// The socket itself lives in two spawned tasks (reader and writer); this
/// handle carries the phase, the outbound queue and teardown.
pub struct Socket {
    config: SessionConfig,
    phase: Arc<Mutex<Phase>>,
    /// Set during `disconnect()` so the reader suppresses its `Closed` event.
    closing: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    outbound_tx: Option<mpsc::Sender<Outbound>>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    writer_task: Option<tokio::task::JoinHandle<()>>,
}

impl Socket {
    /// Create a disconnected socket. Events go to `event_tx` once connected.
    pub fn new(config: SessionConfig, event_tx: mpsc::UnboundedSender<SocketEvent>) -> Self {
        Self {
            config,
            phase: Arc::new(Mutex::new(Phase::Idle)),
            closing: Arc::new(AtomicBool::new(false)),
            event_tx,
            outbound_tx: None,
            reader_task: None,
            writer_task: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.lock().map(|p| *p).unwrap_or(Phase::Closed)
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut p) = self.phase.lock() {
            *p = phase;
        }
    }

    /// Establish the connection.
    ///
    /// A no-op when already `Connecting` or `Open`. On failure the phase
    /// lands in `Closed` and the error is returned; no `Closed` event fires
    /// for a connect that never opened.
    pub async fn connect(&mut self) -> Result<(), VoiceError> {
        match self.phase() {
            Phase::Connecting | Phase::Open => {
                log::warn!("Socket: connect() while {:?}, ignoring", self.phase());
                return Ok(());
            }
            Phase::Idle | Phase::Closed => {}
        }

        self.set_phase(Phase::Connecting);
        match self.open_socket().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_phase(Phase::Closed);
                Err(e)
            }
        }
    }

    /// Reconnect after an unexpected closure, bounded by the configured
    /// policy. Exhausting the budget leaves the socket `Closed` and returns
    /// [`VoiceError::ReconnectExhausted`].
    pub async fn reconnect(&mut self) -> Result<(), VoiceError> {
        let max_attempts = self.config.reconnect.max_attempts.max(1);
        let backoff = Duration::from_millis(self.config.reconnect.backoff_ms);

        self.set_phase(Phase::Connecting);
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
            }
            match self.open_socket().await {
                Ok(()) => {
                    log::info!("Socket: reconnected on attempt {}/{}", attempt, max_attempts);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Socket: reconnect attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        e
                    );
                }
            }
        }

        self.set_phase(Phase::Closed);
        Err(VoiceError::ReconnectExhausted {
            attempts: max_attempts,
        })
    }

    /// Single connection attempt. On success the phase is `Open`, the reader
    /// and writer tasks are running, and an `Opened` event has been emitted.
    async fn open_socket(&mut self) -> Result<(), VoiceError> {
        self.teardown_tasks();

        let url = self.config.connection_url();
        log::info!("Socket: connecting to {}", self.config.endpoint);

        let (ws_stream, _response) = timeout(CONNECTION_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| VoiceError::ConnectionFailed("Connection timeout".to_string()))?
            .map_err(|e| VoiceError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
        self.outbound_tx = Some(outbound_tx);

        self.writer_task = Some(tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = match frame {
                    Outbound::Text(json) => write.send(WsMessage::Text(json)).await,
                    Outbound::Audio(bytes) => write.send(WsMessage::Binary(bytes)).await,
                    Outbound::Close => {
                        if let Err(e) = write.close().await {
                            log::debug!("Socket: error sending close frame: {}", e);
                        }
                        break;
                    }
                };
                if let Err(e) = result {
                    log::warn!("Socket: send failed: {}", e);
                    break;
                }
            }
            log::debug!("Socket: writer task exiting");
        }));

        let phase = self.phase.clone();
        let closing = self.closing.clone();
        let event_tx = self.event_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let detail = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => match parse_text(&text) {
                        Ok(event) => {
                            if event_tx.send(SocketEvent::Message(event)).is_err() {
                                break "event channel closed".to_string();
                            }
                        }
                        Err(e) => {
                            // Protocol noise, dropped in place
                            log::debug!("Socket: dropping frame: {}", e);
                        }
                    },
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        let event = parse_binary(&bytes);
                        if event_tx.send(SocketEvent::Message(event)).is_err() {
                            break "event channel closed".to_string();
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break format!("closed by server: {:?}", frame);
                    }
                    Some(Ok(_)) => {} // ping/pong/raw frames
                    Some(Err(e)) => break format!("read error: {}", e),
                    None => break "stream ended".to_string(),
                }
            };

            if let Ok(mut p) = phase.lock() {
                *p = Phase::Closed;
            }
            if closing.load(Ordering::SeqCst) {
                log::debug!("Socket: reader exiting after disconnect");
            } else {
                log::info!("Socket: connection lost ({})", detail);
                let _ = event_tx.send(SocketEvent::Closed { detail });
            }
        }));

        self.closing.store(false, Ordering::SeqCst);
        self.set_phase(Phase::Open);
        let _ = self.event_tx.send(SocketEvent::Opened);
        log::info!("Socket: open");
        Ok(())
    }

    /// Send a JSON control message. Fails without touching the wire unless
    /// the phase is `Open`.
    pub async fn send_message(&self, message: ClientMessage) -> Result<(), VoiceError> {
        let what = message.label();
        let tx = self.sender(what)?;
        let json = message
            .to_text_frame()
            .map_err(|e| VoiceError::ToolResponseInvalid(e.to_string()))?;
        tx.send(Outbound::Text(json))
            .await
            .map_err(|_| VoiceError::SendNotConnected { what })
    }

    /// Queue one binary audio frame. Drops the frame (with a debug log) when
    /// the outbound queue is full so capture latency stays bounded.
    pub fn send_audio(&self, bytes: Vec<u8>) -> Result<(), VoiceError> {
        let tx = self.sender("audio chunk")?;
        match tx.try_send(Outbound::Audio(bytes)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Socket: outbound queue full, dropping audio chunk");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(VoiceError::SendNotConnected { what: "audio chunk" })
            }
        }
    }

    fn sender(&self, what: &'static str) -> Result<&mpsc::Sender<Outbound>, VoiceError> {
        if self.phase() != Phase::Open {
            return Err(VoiceError::SendNotConnected { what });
        }
        self.outbound_tx
            .as_ref()
            .ok_or(VoiceError::SendNotConnected { what })
    }

    /// Clean shutdown. Marks the phase `Closed` before touching the wire so
    /// concurrent sends fail fast, then closes the connection. Suppresses the
    /// `Closed` event.
    pub async fn disconnect(&mut self) {
        if self.phase() == Phase::Idle {
            return;
        }
        log::info!("Socket: disconnecting");
        self.closing.store(true, Ordering::SeqCst);
        self.set_phase(Phase::Closed);

        if let Some(tx) = self.outbound_tx.take() {
            let _ = tx.send(Outbound::Close).await;
        }
        // Give the close frame a moment on the wire, then stop both tasks
        if let Some(task) = self.writer_task.take() {
            if timeout(Duration::from_secs(1), task).await.is_err() {
                log::debug!("Socket: writer did not finish in time");
            }
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }

    fn teardown_tasks(&mut self) {
        self.outbound_tx = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.teardown_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Auth, SessionConfig};

    fn test_socket() -> (Socket, mpsc::UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig::new(Auth::ApiKey { key: "k".into() });
        (Socket::new(config, tx), rx)
    }

    #[test]
    fn test_starts_idle() {
        let (socket, _rx) = test_socket();
        assert_eq!(socket.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_send_message_while_idle_fails_fast() {
        let (socket, _rx) = test_socket();
        let err = socket
            .send_message(ClientMessage::UserInput { text: "hi".into() })
            .await
            .unwrap_err();
        match err {
            VoiceError::SendNotConnected { what } => assert_eq!(what, "user_input"),
            other => panic!("Expected SendNotConnected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_audio_while_idle_fails_fast() {
        let (socket, _rx) = test_socket();
        let err = socket.send_audio(vec![0u8; 4]).unwrap_err();
        assert_eq!(err.reason(), "send_not_connected");
    }

    #[tokio::test]
    async fn test_connect_failure_lands_in_closed() {
        let (mut socket, mut rx) = test_socket();
        // Unroutable endpoint; handshake fails immediately
        socket.config.endpoint = "ws://127.0.0.1:1/chat".into();

        let result = socket.connect().await;
        assert!(result.is_err());
        assert_eq!(socket.phase(), Phase::Closed);

        // A connect that never opened emits neither Opened nor Closed
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_exhausts_attempt_budget() {
        let (mut socket, _rx) = test_socket();
        socket.config.endpoint = "ws://127.0.0.1:1/chat".into();
        socket.config.reconnect.max_attempts = 2;
        socket.config.reconnect.backoff_ms = 1;

        let err = socket.reconnect().await.unwrap_err();
        match err {
            VoiceError::ReconnectExhausted { attempts } => assert_eq!(attempts, 2),
            other => panic!("Expected ReconnectExhausted, got {:?}", other),
        }
        assert_eq!(socket.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_while_idle_is_noop() {
        let (mut socket, mut rx) = test_socket();
        socket.disconnect().await;
        assert_eq!(socket.phase(), Phase::Idle);
        assert!(rx.try_recv().is_err());
    }

    /// Loopback WebSocket server that records the text frames it receives
    /// until the client closes.
    async fn spawn_recording_server() -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("handshake");
            let mut frames = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    WsMessage::Text(text) => frames.push(text),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            frames
        });
        (format!("ws://{}/chat", addr), handle)
    }

    #[tokio::test]
    async fn test_connect_and_send_over_loopback() {
        let (endpoint, server) = spawn_recording_server().await;
        let (mut socket, mut rx) = test_socket();
        socket.config.endpoint = endpoint;

        socket.connect().await.expect("connect failed");
        assert_eq!(socket.phase(), Phase::Open);
        assert!(matches!(rx.recv().await, Some(SocketEvent::Opened)));

        socket
            .send_message(ClientMessage::UserInput { text: "hi".into() })
            .await
            .expect("send failed");
        socket.disconnect().await;

        let frames = server.await.expect("server task");
        assert_eq!(frames, vec![r#"{"type":"user_input","text":"hi"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_pause_is_a_wire_message_only() {
        let (endpoint, server) = spawn_recording_server().await;
        let (mut socket, mut rx) = test_socket();
        socket.config.endpoint = endpoint;

        socket.connect().await.expect("connect failed");
        assert!(matches!(rx.recv().await, Some(SocketEvent::Opened)));

        socket
            .send_message(ClientMessage::PauseAssistantMessage)
            .await
            .expect("send failed");
        socket.disconnect().await;

        // Exactly the pause frame goes out; pausing has no local side
        // effects beyond it
        let frames = server.await.expect("server task");
        assert_eq!(
            frames,
            vec![r#"{"type":"pause_assistant_message"}"#.to_string()]
        );
        assert!(rx.try_recv().is_err(), "no synthetic events from a pause");
    }

    #[tokio::test]
    #[ignore] // Requires a reachable voice service endpoint
    async fn test_connect_against_live_service() {
        let (mut socket, mut rx) = test_socket();
        socket.connect().await.expect("connect failed");
        assert_eq!(socket.phase(), Phase::Open);
        assert!(matches!(rx.recv().await, Some(SocketEvent::Opened)));
        socket.disconnect().await;
    }
}
