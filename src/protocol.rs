//! Wire protocol types for the conversational voice service
//!
//! Defines the JSON message types exchanged over the WebSocket, plus the
//! parse boundary that turns raw frames into typed events.
//!
//! # Protocol Overview
//!
//! 1. Connect to the service endpoint with credentials as query parameters
//! 2. Optionally send `session_settings` to configure the session
//! 3. Stream microphone audio as raw binary frames
//! 4. Receive transcript, tool and synthesized-audio events as JSON text
//!    frames (`audio_output` payloads are base64)
//!
//! Unknown or malformed inbound frames produce a typed [`ParseError`] and are
//! dropped at the connection boundary - they never reach the application and
//! never panic past the parse boundary.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionSettings;

/// Why an inbound frame could not be parsed.
///
/// Both variants are protocol noise (keepalives, future message types), not
/// session errors.
#[derive(Debug, Clone)]
pub enum ParseError {
    /// The `type` discriminator is not one we understand.
    UnknownType(String),
    /// The frame is not valid JSON, or a known type failed schema validation.
    Malformed(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnknownType(t) => write!(f, "Unknown message type: {}", t),
            ParseError::Malformed(e) => write!(f, "Malformed message: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

/// One transcript message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
}

/// Speaker role on a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Expression/prosody inference attached to transcript messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prosody: Option<ProsodyScores>,
}

/// Per-emotion prosody scores, keyed by emotion name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProsodyScores {
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

/// Time span of an utterance, in milliseconds since session start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeSpan {
    pub begin: u64,
    pub end: u64,
}

/// Severity reported alongside a tool error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    Warn,
    Error,
}

// ============================================================================
// Server messages (received FROM the service)
// ============================================================================

/// Messages received from the voice service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One chunk of synthesized speech.
    AudioOutput {
        /// Identifies the assistant message this chunk speaks.
        id: String,
        /// Base64-encoded audio payload (WAV-framed or raw PCM16).
        data: String,
    },

    /// Transcript of user speech. `interim` marks a provisional result that a
    /// later final transcript supersedes.
    UserMessage {
        message: ChatMessage,
        #[serde(default)]
        models: Inference,
        #[serde(default)]
        time: Option<TimeSpan>,
        #[serde(default)]
        interim: bool,
    },

    /// Assistant transcript. Held back until the matching clip starts playing.
    AssistantMessage {
        id: String,
        message: ChatMessage,
        #[serde(default)]
        models: Inference,
        /// True when this message came from injected text rather than speech.
        #[serde(default)]
        from_text: bool,
    },

    /// The user interrupted the assistant mid-utterance.
    UserInterruption {
        #[serde(default)]
        time: Option<u64>,
    },

    /// Session identifiers assigned by the service.
    ChatMetadata {
        chat_id: String,
        #[serde(default)]
        chat_group_id: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// The assistant wants a tool invoked.
    ToolCall {
        tool_call_id: String,
        name: String,
        /// JSON-encoded parameters, passed through opaquely.
        parameters: String,
        #[serde(default)]
        tool_type: Option<String>,
        #[serde(default)]
        response_required: bool,
    },

    /// Result of a tool the service ran itself.
    ToolResponse {
        tool_call_id: String,
        content: String,
    },

    /// A tool invocation failed.
    ToolError {
        tool_call_id: String,
        error: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        level: Option<ErrorLevel>,
        #[serde(default)]
        content: Option<String>,
    },

    /// The service reported an error.
    Error {
        #[serde(default)]
        code: String,
        message: String,
    },

    /// Catch-all for message types we don't handle. Mapped to
    /// [`ParseError::UnknownType`] at the parse boundary.
    #[serde(other)]
    Unknown,
}

/// A parsed inbound event with its arrival timestamp.
///
/// `received_at` is attached at parse time and never mutated afterward.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub received_at: DateTime<Utc>,
    pub message: ServerMessage,
}

impl ServerEvent {
    fn now(message: ServerMessage) -> Self {
        Self {
            received_at: Utc::now(),
            message,
        }
    }
}

/// Parse a text frame into a typed event.
///
/// Returns `UnknownType` for unrecognized discriminators and `Malformed` for
/// invalid JSON or schema violations on known types. Never panics.
pub fn parse_text(raw: &str) -> Result<ServerEvent, ParseError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let message: ServerMessage =
        serde_json::from_value(value.clone()).map_err(|e| ParseError::Malformed(e.to_string()))?;

    if matches!(message, ServerMessage::Unknown) {
        let discriminator = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<missing>")
            .to_string();
        return Err(ParseError::UnknownType(discriminator));
    }

    Ok(ServerEvent::now(message))
}

/// Decode a binary frame. Binary frames are always audio and skip JSON
/// parsing entirely; a local id is minted since binary frames carry none.
pub fn parse_binary(bytes: &[u8]) -> ServerEvent {
    ServerEvent::now(ServerMessage::AudioOutput {
        id: Uuid::new_v4().to_string(),
        data: STANDARD.encode(bytes),
    })
}

// ============================================================================
// Client messages (sent TO the service)
// ============================================================================

/// Messages sent from client to the voice service as JSON text frames.
/// Microphone audio is sent as raw binary frames and does not appear here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Text input spoken on behalf of the user.
    UserInput { text: String },

    /// Text the assistant should say verbatim.
    AssistantInput { text: String },

    /// Configure the session (system prompt, audio encoding, context).
    SessionSettings {
        #[serde(flatten)]
        settings: SessionSettings,
    },

    /// Successful result for a pending tool call.
    ToolResponseMessage {
        tool_call_id: String,
        content: String,
    },

    /// Failure result for a pending tool call.
    ToolErrorMessage {
        tool_call_id: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        level: Option<ErrorLevel>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// Stop the assistant from speaking until resumed.
    PauseAssistantMessage,

    /// Resume assistant speech after a pause.
    ResumeAssistantMessage,
}

impl ClientMessage {
    /// Serialize to the JSON text frame body.
    pub fn to_text_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short label for logging and not-connected error reporting.
    pub fn label(&self) -> &'static str {
        match self {
            ClientMessage::UserInput { .. } => "user_input",
            ClientMessage::AssistantInput { .. } => "assistant_input",
            ClientMessage::SessionSettings { .. } => "session_settings",
            ClientMessage::ToolResponseMessage { .. } => "tool_response_message",
            ClientMessage::ToolErrorMessage { .. } => "tool_error_message",
            ClientMessage::PauseAssistantMessage => "pause_assistant_message",
            ClientMessage::ResumeAssistantMessage => "resume_assistant_message",
        }
    }
}
