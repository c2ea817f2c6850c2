use std::time::Duration;

use tracing::{debug, trace};
use wcs_core::{Activity, ActivityType, ConnectionQuality, SessionEvent};

use crate::network::typing_penalty;
use crate::streaming::{StreamOutcome, StreamingReassembler};

pub const BASE_TYPING_TIMEOUT: Duration = Duration::from_millis(8_000);
pub const MAX_TYPING_TIMEOUT: Duration = Duration::from_millis(20_000);

const EXPLAIN_KEYWORDS: &[&str] = &["explain", "describe", "analyze", "analyse"];
const WH_WORDS: &[&str] = &["what", "why", "how", "when", "where", "who", "which"];

/// How long to wait for a reply after the agent starts typing, scaled by the
/// complexity of the last user message and the link quality.
pub fn typing_timeout(last_user_message: Option<&str>, quality: ConnectionQuality) -> Duration {
    let mut factor = 1.0 + typing_penalty(quality);
    if let Some(message) = last_user_message {
        if message.chars().count() > 100 {
            factor += 0.5;
        }
        if message.contains('?') {
            factor += 0.3;
        }
        let lower = message.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();
        if words
            .iter()
            .any(|word| EXPLAIN_KEYWORDS.iter().any(|k| word.starts_with(k)))
        {
            factor += 0.7;
        }
        if words.iter().any(|word| WH_WORDS.contains(word)) {
            factor += 0.4;
        }
    }
    let millis = (BASE_TYPING_TIMEOUT.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis).min(MAX_TYPING_TIMEOUT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingAction {
    None,
    Arm(Duration),
    Clear,
}

/// Result of routing one inbound activity.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub events: Vec<SessionEvent>,
    pub typing: TypingAction,
    /// Set when a guessed stream is open and should be flushed after this long.
    pub stream_idle: Option<Duration>,
    pub ignored: bool,
}

impl DispatchOutcome {
    fn ignored() -> Self {
        Self {
            events: Vec::new(),
            typing: TypingAction::None,
            stream_idle: None,
            ignored: true,
        }
    }
}

pub struct ActivityDispatcher {
    user_id: String,
    debug_mode: bool,
    reassembler: StreamingReassembler,
    last_user_message: Option<String>,
    typing_pending: bool,
    typing_session_open: bool,
    messages_received: u64,
}

impl ActivityDispatcher {
    pub fn new(user_id: impl Into<String>, debug_mode: bool) -> Self {
        Self {
            user_id: user_id.into(),
            debug_mode,
            reassembler: StreamingReassembler::new(),
            last_user_message: None,
            typing_pending: false,
            typing_session_open: false,
            messages_received: 0,
        }
    }

    /// Remembers the last outgoing text for typing-timeout scaling.
    pub fn note_outgoing(&mut self, text: &str) {
        if !text.trim().is_empty() {
            self.last_user_message = Some(text.to_string());
        }
    }

    pub fn dispatch(&mut self, activity: Activity, quality: ConnectionQuality) -> DispatchOutcome {
        if self.debug_mode {
            match serde_json::to_string(&activity) {
                Ok(json) => debug!(activity = %json, "inbound activity"),
                Err(err) => debug!(error = %err, "inbound activity not serializable"),
            }
        }

        let is_typing = activity.r#type == ActivityType::Typing;
        if !is_typing && activity.from_id() == Some(self.user_id.as_str()) {
            trace!(activity_id = %activity.id, "skipping echo of own activity");
            return DispatchOutcome::ignored();
        }
        if activity.r#type == ActivityType::Unknown {
            debug!(activity_id = %activity.id, "ignoring activity of unknown type");
            return DispatchOutcome::ignored();
        }

        if is_typing {
            let timeout = typing_timeout(self.last_user_message.as_deref(), quality);
            self.typing_pending = true;
            self.typing_session_open = true;
            return DispatchOutcome {
                events: vec![SessionEvent::TypingIndicator {
                    active: true,
                    timeout_ms: Some(timeout.as_millis() as u64),
                }],
                typing: TypingAction::Arm(timeout),
                stream_idle: None,
                ignored: false,
            };
        }

        let mut events = Vec::new();
        let mut typing = TypingAction::None;
        if self.typing_pending {
            self.typing_pending = false;
            typing = TypingAction::Clear;
            events.push(SessionEvent::TypingIndicator {
                active: false,
                timeout_ms: None,
            });
        }

        self.messages_received += 1;
        let mut stream_idle = None;
        if activity.r#type == ActivityType::Message {
            let outcome = self.reassembler.ingest(activity, self.typing_session_open);
            if matches!(outcome, StreamOutcome::Chunk { .. }) {
                if self.reassembler.has_heuristic_buffers() {
                    stream_idle = Some(typing_timeout(self.last_user_message.as_deref(), quality));
                }
            } else if self.reassembler.open_streams() == 0 {
                self.typing_session_open = false;
            }
            push_outcome(&mut events, outcome);
        } else {
            events.push(SessionEvent::MessageReceived { activity });
        }

        DispatchOutcome {
            events,
            typing,
            stream_idle,
            ignored: false,
        }
    }

    /// The typing timer fired without any reply arriving.
    pub fn typing_expired(&mut self) -> Vec<SessionEvent> {
        if !self.typing_pending {
            return Vec::new();
        }
        self.typing_pending = false;
        if self.reassembler.open_streams() == 0 {
            self.typing_session_open = false;
        }
        vec![SessionEvent::TypingIndicator {
            active: false,
            timeout_ms: None,
        }]
    }

    /// No fragment arrived for a guessed stream; deliver what was buffered.
    pub fn stream_idle(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for outcome in self.reassembler.flush_heuristic() {
            push_outcome(&mut events, outcome);
        }
        if self.reassembler.open_streams() == 0 {
            self.typing_session_open = false;
        }
        events
    }

    pub fn reset(&mut self) {
        self.reassembler.clear();
        self.typing_pending = false;
        self.typing_session_open = false;
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }
}

fn push_outcome(events: &mut Vec<SessionEvent>, outcome: StreamOutcome) {
    match outcome {
        StreamOutcome::Chunk {
            message_id,
            chunk_number,
            duration,
            text,
        } => events.push(SessionEvent::StreamingChunk {
            message_id,
            chunk_number,
            duration_ms: duration.as_millis() as u64,
            text,
        }),
        StreamOutcome::Completed {
            message_id,
            chunk_count,
            duration,
            activity,
        } => {
            events.push(SessionEvent::StreamingEnd {
                message_id,
                chunk_count,
                duration_ms: duration.as_millis() as u64,
            });
            events.push(SessionEvent::MessageReceived { activity });
        }
        StreamOutcome::Message(activity) => events.push(SessionEvent::MessageReceived { activity }),
    }
}
