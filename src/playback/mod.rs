//! Ordered playback of synthesized speech
//!
//! Clips are decoded on arrival and queued strictly FIFO; the cpal output
//! callback drains the queue with at most one clip audible at a time and no
//! gap between clips. Starting a clip emits a `ClipStarted` signal carrying
//! the clip id - the sole trigger the reconciler uses to release the matching
//! pending transcript.

mod player;
mod queue;

pub use player::Player;
pub use queue::{AudioClip, ClipQueue, PlaybackEvent};
