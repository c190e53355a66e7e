//! Error taxonomy for the voice session
//!
//! Every error is tagged with the subsystem it came from and carries a stable
//! reason code, so embedding applications can branch on `reason()` without
//! string-matching display text. Wire-level parse noise (unknown or malformed
//! frames) is NOT represented here - it is dropped at the codec boundary and
//! never becomes a session error.

/// Subsystem that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Socket,
    AudioPlayer,
    Microphone,
}

/// Errors surfaced through the session error channel.
///
/// Fatal errors force the session into its terminal `Closed` state and run
/// the full ordered disconnect, conversation state included. Rejected sends
/// (only possible while the socket is already not open) and per-clip decode
/// failures are reported through the same channel without further teardown.
#[derive(Debug, Clone)]
pub enum VoiceError {
    // Socket
    /// Could not establish the WebSocket connection.
    ConnectionFailed(String),
    /// An outbound send was attempted while the socket was not open.
    SendNotConnected {
        /// What was being sent (e.g. "audio chunk", "user_input").
        what: &'static str,
    },
    /// The assistant service reported an error event over the wire.
    ServerError { code: String, message: String },
    /// Automatic reconnection gave up after the configured attempt budget.
    ReconnectExhausted { attempts: u32 },
    /// A tool response/error payload failed local validation before send.
    ToolResponseInvalid(String),

    // Audio player
    /// The output device context could not be initialized.
    PlaybackInitFailed(String),
    /// A received clip could not be decoded. Playback of other clips continues;
    /// this is surfaced for visibility but scoped to the one clip.
    ClipDecodeFailed { clip_id: String, detail: String },
    /// A playback operation was attempted before the player was initialized.
    PlaybackNotInitialized,
    /// Tearing down the output device context failed.
    PlaybackTeardownFailed(String),

    // Microphone
    /// The user (or OS) denied microphone access.
    MicPermissionDenied(String),
    /// Generic microphone/device initialization failure.
    MicInitFailed(String),
    /// The device supports no usable stream configuration.
    UnsupportedAudioConfig(String),
    /// Stopping the microphone kept failing after the retry budget.
    MicStopFailed { attempts: u32 },
}

impl VoiceError {
    /// Subsystem this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        use VoiceError::*;
        match self {
            ConnectionFailed(_)
            | SendNotConnected { .. }
            | ServerError { .. }
            | ReconnectExhausted { .. }
            | ToolResponseInvalid(_) => ErrorKind::Socket,
            PlaybackInitFailed(_)
            | ClipDecodeFailed { .. }
            | PlaybackNotInitialized
            | PlaybackTeardownFailed(_) => ErrorKind::AudioPlayer,
            MicPermissionDenied(_)
            | MicInitFailed(_)
            | UnsupportedAudioConfig(_)
            | MicStopFailed { .. } => ErrorKind::Microphone,
        }
    }

    /// Stable reason code, independent of display text.
    pub fn reason(&self) -> &'static str {
        use VoiceError::*;
        match self {
            ConnectionFailed(_) => "connection_failed",
            SendNotConnected { .. } => "send_not_connected",
            ServerError { .. } => "server_error",
            ReconnectExhausted { .. } => "reconnect_exhausted",
            ToolResponseInvalid(_) => "tool_response_invalid",
            PlaybackInitFailed(_) => "playback_init_failed",
            ClipDecodeFailed { .. } => "clip_decode_failed",
            PlaybackNotInitialized => "playback_not_initialized",
            PlaybackTeardownFailed(_) => "playback_teardown_failed",
            MicPermissionDenied(_) => "mic_permission_denied",
            MicInitFailed(_) => "mic_init_failed",
            UnsupportedAudioConfig(_) => "unsupported_audio_config",
            MicStopFailed { .. } => "mic_stop_failed",
        }
    }
}

impl std::fmt::Display for VoiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use VoiceError::*;
        match self {
            ConnectionFailed(e) => write!(f, "Failed to connect to voice service: {}", e),
            SendNotConnected { what } => {
                write!(f, "Cannot send {} while the socket is not open", what)
            }
            ServerError { code, message } => {
                write!(f, "Voice service reported error ({}): {}", code, message)
            }
            ReconnectExhausted { attempts } => {
                write!(f, "Gave up reconnecting after {} attempts", attempts)
            }
            ToolResponseInvalid(e) => write!(f, "Invalid tool response payload: {}", e),
            PlaybackInitFailed(e) => write!(f, "Failed to initialize audio output: {}", e),
            ClipDecodeFailed { clip_id, detail } => {
                write!(f, "Failed to decode audio clip {}: {}", clip_id, detail)
            }
            PlaybackNotInitialized => write!(f, "Audio player is not initialized"),
            PlaybackTeardownFailed(e) => write!(f, "Failed to stop audio output: {}", e),
            MicPermissionDenied(e) => write!(f, "Microphone access denied: {}", e),
            MicInitFailed(e) => write!(f, "Failed to initialize microphone: {}", e),
            UnsupportedAudioConfig(e) => {
                write!(f, "No supported audio configuration: {}", e)
            }
            MicStopFailed { attempts } => {
                write!(f, "Microphone failed to stop after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for VoiceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tagging() {
        assert_eq!(
            VoiceError::ConnectionFailed("x".into()).kind(),
            ErrorKind::Socket
        );
        assert_eq!(
            VoiceError::PlaybackNotInitialized.kind(),
            ErrorKind::AudioPlayer
        );
        assert_eq!(
            VoiceError::MicStopFailed { attempts: 3 }.kind(),
            ErrorKind::Microphone
        );
    }

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(
            VoiceError::SendNotConnected { what: "audio chunk" }.reason(),
            "send_not_connected"
        );
        assert_eq!(
            VoiceError::ReconnectExhausted { attempts: 30 }.reason(),
            "reconnect_exhausted"
        );
        assert_eq!(
            VoiceError::MicPermissionDenied("denied".into()).reason(),
            "mic_permission_denied"
        );
    }

    #[test]
    fn test_display_includes_detail() {
        let err = VoiceError::ServerError {
            code: "E0101".into(),
            message: "rate limited".into(),
        };
        assert!(err.to_string().contains("E0101"));
        assert!(err.to_string().contains("rate limited"));

        let err = VoiceError::ClipDecodeFailed {
            clip_id: "clip-7".into(),
            detail: "truncated".into(),
        };
        assert!(err.to_string().contains("clip-7"));
    }
}
