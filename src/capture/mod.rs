//! Microphone capture pipeline
//!
//! The device callback (sync, cpal thread) converts samples to PCM16 and fans
//! them out over channels; the async chunker accumulates fixed-interval
//! chunks for the socket, and the spectrum emitter consumes a copy for the
//! live input visualization.
//!
//! ```text
//! Device Thread (sync)                 Tokio Runtime (async)
//! ┌──────────────────┐                 ┌──────────────────────┐
//! │ cpal callback    │──samples──────▶ │ run_chunker()        │
//! │ (mute gate here) │──samples──────▶ │ spectrum emitter     │
//! └──────────────────┘                 └──────────────────────┘
//! ```

mod chunker;
mod microphone;

pub use chunker::{pcm16_to_bytes, run_chunker, ChunkerConfig};
pub use microphone::{clamp_rate, Microphone, NegotiatedConfig};
