//! Session configuration
//!
//! All knobs for a voice session live here. `SessionConfig::default()` is a
//! working configuration for the hosted service; embedding applications
//! usually only need to supply credentials.

use serde::{Deserialize, Serialize};

/// Default WebSocket endpoint for the conversational voice service.
pub const DEFAULT_ENDPOINT: &str = "wss://api.voicelink.dev/v1/chat";

/// Connection-time credentials.
///
/// Credentials ride on the connection URL as query parameters and are never
/// embedded in message payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Auth {
    /// Long-lived static API key.
    ApiKey { key: String },
    /// Short-lived bearer access token minted by the embedding application's
    /// backend.
    AccessToken { token: String },
}

impl Auth {
    /// Query parameter name and value for the connection URL.
    pub fn query_param(&self) -> (&'static str, &str) {
        match self {
            Auth::ApiKey { key } => ("api_key", key),
            Auth::AccessToken { token } => ("access_token", token),
        }
    }
}

/// Requested microphone capture parameters.
///
/// These are requests, not guarantees: the negotiated values are clamped into
/// whatever range the concrete device supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    /// Desired capture sample rate in Hz.
    pub sample_rate: u32,

    /// Desired channel count (1 = mono).
    pub channels: u16,

    /// Echo cancellation hint for platforms that support it.
    pub echo_cancellation: bool,

    /// Noise suppression hint for platforms that support it.
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Reconnection policy for unexpected socket closures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Maximum automatic reconnect attempts before giving up with a fatal
    /// socket error.
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds. The original service client
    /// retried instantly; a short fixed backoff avoids retry storms without
    /// noticeably delaying recovery.
    pub backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            backoff_ms: 500,
        }
    }
}

/// Top-level configuration for a voice session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// WebSocket endpoint of the voice service.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Connection credentials.
    pub auth: Auth,

    /// Microphone capture constraints.
    #[serde(default)]
    pub audio: AudioConstraints,

    /// Bound on retained message history. Oldest entries are evicted first.
    #[serde(default = "default_history_limit")]
    pub message_history_limit: usize,

    /// Reconnection policy for unexpected socket closures.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Interval between outbound microphone chunks in milliseconds.
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval_ms: u32,

    /// Resume a previous conversation by chat group id, if the service
    /// supports it.
    #[serde(default)]
    pub resumed_chat_group_id: Option<String>,

    /// Session settings pushed to the service right after the socket opens.
    #[serde(default)]
    pub session_settings: Option<SessionSettings>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_history_limit() -> usize {
    100
}

fn default_chunk_interval() -> u32 {
    100
}

impl SessionConfig {
    /// Minimal configuration with just credentials; everything else defaulted.
    pub fn new(auth: Auth) -> Self {
        Self {
            endpoint: default_endpoint(),
            auth,
            audio: AudioConstraints::default(),
            message_history_limit: default_history_limit(),
            reconnect: ReconnectPolicy::default(),
            chunk_interval_ms: default_chunk_interval(),
            resumed_chat_group_id: None,
            session_settings: None,
        }
    }

    /// Build the full connection URL with credentials as query parameters.
    pub fn connection_url(&self) -> String {
        let (name, value) = self.auth.query_param();
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        let mut url = format!("{}{}{}={}", self.endpoint, sep, name, value);
        if let Some(group) = &self.resumed_chat_group_id {
            url.push_str("&resumed_chat_group_id=");
            url.push_str(group);
        }
        url
    }
}

/// Session settings message sent after the socket opens.
///
/// All fields optional; only populated fields are serialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    /// System prompt override for this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Input audio description so the service can decode raw binary frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioFormat>,

    /// Free-form context injected into the conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSettings>,
}

/// Encoding description for outbound microphone audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Encoding name, e.g. "linear16".
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// PCM16 little-endian, the format the capture pipeline produces.
    pub fn linear16(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: "linear16".to_string(),
            sample_rate,
            channels,
        }
    }
}

/// Conversation context injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    pub text: String,
    /// "persistent" or "temporary".
    #[serde(rename = "type")]
    pub context_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new(Auth::ApiKey { key: "k".into() });
        assert_eq!(config.message_history_limit, 100);
        assert_eq!(config.chunk_interval_ms, 100);
        assert_eq!(config.reconnect.max_attempts, 30);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.channels, 1);
    }

    #[test]
    fn test_connection_url_api_key() {
        let config = SessionConfig::new(Auth::ApiKey { key: "abc123".into() });
        let url = config.connection_url();
        assert!(url.starts_with(DEFAULT_ENDPOINT));
        assert!(url.contains("?api_key=abc123"));
    }

    #[test]
    fn test_connection_url_access_token_and_resume() {
        let mut config = SessionConfig::new(Auth::AccessToken { token: "tok".into() });
        config.resumed_chat_group_id = Some("grp-1".into());
        let url = config.connection_url();
        assert!(url.contains("?access_token=tok"));
        assert!(url.contains("&resumed_chat_group_id=grp-1"));
    }

    #[test]
    fn test_connection_url_endpoint_with_existing_query() {
        let mut config = SessionConfig::new(Auth::ApiKey { key: "k".into() });
        config.endpoint = "wss://example.com/chat?version=2".into();
        assert!(config.connection_url().contains("?version=2&api_key=k"));
    }

    #[test]
    fn test_session_settings_skip_empty_fields() {
        let settings = SessionSettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(json, "{}");

        let settings = SessionSettings {
            audio: Some(AudioFormat::linear16(48_000, 1)),
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"encoding\":\"linear16\""));
        assert!(!json.contains("system_prompt"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SessionConfig::new(Auth::ApiKey { key: "k".into() });
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_history_limit, config.message_history_limit);
    }
}
