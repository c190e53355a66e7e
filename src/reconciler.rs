//! Message/transcript reconciliation
//!
//! Decouples "transcript received" from "transcript exposed to the
//! application" so captions and history stay synchronized with audio:
//! assistant transcripts wait in a pending map until the playback engine
//! signals that the clip with the matching id has started, then move into the
//! bounded history exactly once. User transcripts bypass the pending map;
//! interim user transcripts replace the history tail instead of accumulating.
//!
//! Single consumer: the session event loop feeds wire events and playback
//! signals in arrival order. No internal synchronization.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::playback::PlaybackEvent;
use crate::protocol::{ServerEvent, ServerMessage};

/// Callback invoked for every event released to the application.
pub type MessageSubscriber = Box<dyn Fn(&ServerEvent) + Send>;

/// Side effect the session must carry out after handling a wire event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// A user interruption arrived: silence playback immediately.
    ClearPlaybackQueue,
}

/// A pending tool invocation and, once available, its resolution.
#[derive(Debug, Clone)]
pub struct ToolCallEntry {
    pub call: ServerEvent,
    /// Populated exactly once by the matching tool_response or tool_error.
    pub resolved: Option<ServerEvent>,
}

/// Reconciles transcript, tool and metadata events with playback timing.
pub struct Reconciler {
    history: VecDeque<ServerEvent>,
    history_limit: usize,
    /// Assistant messages waiting for their clip to start, keyed by id.
    pending_voice: HashMap<String, ServerEvent>,
    tool_calls: HashMap<String, ToolCallEntry>,
    last_user_message: Option<ServerEvent>,
    last_assistant_message: Option<ServerEvent>,
    chat_id: Option<String>,
    chat_group_id: Option<String>,
    subscriber: Option<MessageSubscriber>,
    /// Every event delivered to the subscriber, interim included.
    forwarded_count: u64,
}

impl Reconciler {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            pending_voice: HashMap::new(),
            tool_calls: HashMap::new(),
            last_user_message: None,
            last_assistant_message: None,
            chat_id: None,
            chat_group_id: None,
            subscriber: None,
            forwarded_count: 0,
        }
    }

    /// Replace the message subscriber. Explicit setter rather than a mutable
    /// closure cell.
    pub fn set_subscriber(&mut self, subscriber: MessageSubscriber) {
        self.subscriber = Some(subscriber);
    }

    /// Process one inbound wire event, in arrival order.
    pub fn handle_event(&mut self, event: ServerEvent) -> Vec<ReconcileAction> {
        match &event.message {
            ServerMessage::AssistantMessage { id, from_text, .. } => {
                if *from_text {
                    // Injected text has no clip to wait for
                    self.release(event.clone());
                    self.last_assistant_message = Some(event);
                } else {
                    // Held back until the matching clip starts playing
                    self.pending_voice.insert(id.clone(), event);
                }
                vec![]
            }

            ServerMessage::UserMessage { interim, .. } => {
                let interim = *interim;
                self.notify(&event);
                self.push_or_replace_interim_tail(event.clone());
                if !interim {
                    self.last_user_message = Some(event);
                }
                vec![]
            }

            ServerMessage::UserInterruption { .. } => {
                self.release(event);
                vec![ReconcileAction::ClearPlaybackQueue]
            }

            ServerMessage::ChatMetadata {
                chat_id,
                chat_group_id,
                ..
            } => {
                self.chat_id = Some(chat_id.clone());
                self.chat_group_id = chat_group_id.clone();
                log::info!(
                    "Reconciler: chat {} (group {:?})",
                    chat_id,
                    self.chat_group_id
                );
                self.release(event);
                vec![]
            }

            ServerMessage::ToolCall { tool_call_id, .. } => {
                self.tool_calls.insert(
                    tool_call_id.clone(),
                    ToolCallEntry {
                        call: event.clone(),
                        resolved: None,
                    },
                );
                self.release(event);
                vec![]
            }

            ServerMessage::ToolResponse { tool_call_id, .. }
            | ServerMessage::ToolError { tool_call_id, .. } => {
                match self.tool_calls.get_mut(tool_call_id) {
                    Some(entry) if entry.resolved.is_none() => {
                        entry.resolved = Some(event.clone());
                    }
                    Some(_) => {
                        log::debug!("Reconciler: tool call {} already resolved", tool_call_id);
                    }
                    None => {
                        log::debug!("Reconciler: resolution for unknown tool call {}", tool_call_id);
                    }
                }
                self.release(event);
                vec![]
            }

            ServerMessage::Error { .. } => {
                self.release(event);
                vec![]
            }

            // Audio payloads are routed to the player by the session, not
            // through the reconciler.
            ServerMessage::AudioOutput { .. } | ServerMessage::Unknown => {
                log::debug!("Reconciler: ignoring non-transcript event");
                vec![]
            }
        }
    }

    /// Process a playback lifecycle signal.
    ///
    /// A started clip releases the matching pending assistant transcript
    /// exactly once; duplicate signals for an already-consumed id are no-ops.
    pub fn handle_playback_event(&mut self, event: &PlaybackEvent) {
        if let PlaybackEvent::ClipStarted { id } = event {
            if let Some(message) = self.pending_voice.remove(id) {
                self.last_assistant_message = Some(message.clone());
                self.release(message);
            }
        }
    }

    /// Release an event into history and notify the subscriber.
    fn release(&mut self, event: ServerEvent) {
        self.notify(&event);
        self.push_bounded(event);
    }

    fn notify(&mut self, event: &ServerEvent) {
        if let Some(subscriber) = &self.subscriber {
            subscriber(event);
        }
        self.forwarded_count += 1;
        if self.forwarded_count % 50 == 0 {
            log::debug!("Reconciler: {} events forwarded", self.forwarded_count);
        }
    }

    fn push_bounded(&mut self, event: ServerEvent) {
        self.history.push_back(event);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    /// Append a user message, replacing an interim tail in place so interim
    /// noise never accumulates. A final message also replaces the interim
    /// tail it supersedes.
    fn push_or_replace_interim_tail(&mut self, event: ServerEvent) {
        let tail_is_interim = matches!(
            self.history.back().map(|e| &e.message),
            Some(ServerMessage::UserMessage { interim: true, .. })
        );
        if tail_is_interim {
            if let Some(tail) = self.history.back_mut() {
                *tail = event;
            }
        } else {
            self.push_bounded(event);
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &ServerEvent> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn last_user_message(&self) -> Option<&ServerEvent> {
        self.last_user_message.as_ref()
    }

    pub fn last_assistant_message(&self) -> Option<&ServerEvent> {
        self.last_assistant_message.as_ref()
    }

    pub fn tool_calls(&self) -> &HashMap<String, ToolCallEntry> {
        &self.tool_calls
    }

    pub fn chat_metadata(&self) -> (Option<&str>, Option<&str>) {
        (self.chat_id.as_deref(), self.chat_group_id.as_deref())
    }

    pub fn pending_count(&self) -> usize {
        self.pending_voice.len()
    }

    /// Atomic reset on disconnect: history, pending map, tool calls and
    /// latest-message pointers all go together.
    pub fn clear(&mut self) {
        self.history.clear();
        self.pending_voice.clear();
        self.tool_calls.clear();
        self.last_user_message = None;
        self.last_assistant_message = None;
        self.chat_id = None;
        self.chat_group_id = None;
        self.forwarded_count = 0;
    }
}
