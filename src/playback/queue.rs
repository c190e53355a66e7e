//! FIFO clip queue drained by the output device callback
//!
//! Pure data structure, no device dependency, so the ordering and signal
//! semantics are testable on their own. The output callback calls
//! [`ClipQueue::next_samples`] to fill its buffer; clip lifecycle signals are
//! collected into the caller's event vector.

use std::collections::VecDeque;

/// One decoded unit of synthesized speech, mono at the output sample rate.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Join key used by the reconciler to release the matching transcript.
    pub id: String,
    pub samples: Vec<f32>,
}

/// Playback lifecycle signals emitted as the queue is drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A clip just became audible.
    ClipStarted { id: String },
    /// A clip played to completion. Not emitted for clips discarded by
    /// `clear()`.
    ClipEnded { id: String },
}

struct Playing {
    clip: AudioClip,
    pos: usize,
}

/// Strictly FIFO queue with at most one clip audible at a time.
///
/// NOT internally synchronized; the player wraps it in `Arc<Mutex<_>>`.
#[derive(Default)]
pub struct ClipQueue {
    queue: VecDeque<AudioClip>,
    current: Option<Playing>,
}

impl ClipQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a decoded clip behind everything already queued.
    pub fn push(&mut self, clip: AudioClip) {
        self.queue.push_back(clip);
    }

    /// Whether a clip is currently audible (not merely queued).
    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Queued clips not yet started (excludes the one playing).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.current.is_none()
    }

    /// Stop the current clip immediately and drop all queued clips.
    ///
    /// Discarded clips never emit started signals; the interrupted clip emits
    /// no ended signal either - silence is immediate.
    pub fn clear(&mut self) {
        let dropped = self.queue.len() + usize::from(self.current.is_some());
        self.current = None;
        self.queue.clear();
        if dropped > 0 {
            log::debug!("ClipQueue: cleared {} clip(s)", dropped);
        }
    }

    /// Fill `out` with the next mono samples, advancing through clips
    /// back-to-back with no gap. Remaining space after the queue runs dry is
    /// zero-filled. Lifecycle signals are appended to `events`.
    pub fn next_samples(&mut self, out: &mut [f32], events: &mut Vec<PlaybackEvent>) {
        let mut written = 0;

        while written < out.len() {
            if self.current.is_none() {
                match self.queue.pop_front() {
                    Some(clip) => {
                        events.push(PlaybackEvent::ClipStarted {
                            id: clip.id.clone(),
                        });
                        self.current = Some(Playing { clip, pos: 0 });
                    }
                    None => break,
                }
            }

            let playing = self.current.as_mut().expect("current set above");
            let remaining = &playing.clip.samples[playing.pos..];
            let take = remaining.len().min(out.len() - written);
            out[written..written + take].copy_from_slice(&remaining[..take]);
            written += take;
            playing.pos += take;

            if playing.pos >= playing.clip.samples.len() {
                events.push(PlaybackEvent::ClipEnded {
                    id: playing.clip.id.clone(),
                });
                self.current = None;
            }
        }

        out[written..].fill(0.0);
    }
}
