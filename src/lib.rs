//! voicelink - real-time conversational voice client
//!
//! Client library for bidirectional voice conversations with an assistant
//! service over a WebSocket: microphone capture streams up as raw PCM16
//! frames, synthesized speech streams down as base64 clips, and transcripts
//! stay synchronized with what is actually audible.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  PCM16   ┌─────────┐  100ms chunks  ┌────────┐
//! │ Microphone │─────────▶│ Chunker │───────────────▶│        │
//! └────────────┘          └─────────┘                │        │
//!                                                    │ Socket │◀──▶ service
//! ┌────────────┐  clips   ┌────────────┐   events    │        │
//! │   Player   │◀─────────│ Event loop │◀────────────│        │
//! └─────┬──────┘          └─────┬──────┘             └────────┘
//!       │ clip started          │ transcripts/tools/metadata
//!       ▼                       ▼
//! ┌─────────────────────────────────────┐
//! │ Reconciler (pending map + history)  │──▶ message subscriber
//! └─────────────────────────────────────┘
//! ```
//!
//! [`VoiceSession`] is the facade over all of it. Typical use:
//!
//! ```no_run
//! use voicelink::{Auth, SessionConfig, VoiceSession};
//!
//! # async fn run() -> Result<(), voicelink::VoiceError> {
//! let config = SessionConfig::new(Auth::ApiKey { key: "...".into() });
//! let mut session = VoiceSession::new(config);
//! session.set_message_subscriber(Box::new(|event| {
//!     println!("{:?}", event.message);
//! }));
//! session.connect().await?;
//! // ... converse ...
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod reconciler;
pub mod retry;
pub mod session;
pub mod socket;
pub mod spectrum;

pub use config::{Auth, AudioConstraints, ReconnectPolicy, SessionConfig, SessionSettings};
pub use error::{ErrorKind, VoiceError};
pub use playback::PlaybackEvent;
pub use protocol::{ChatMessage, ClientMessage, Role, ServerEvent, ServerMessage};
pub use session::{ErrorHandler, VoiceSession};
pub use socket::Phase;
pub use spectrum::NUM_BANDS;
