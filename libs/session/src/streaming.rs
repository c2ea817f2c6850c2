//! Reassembly of incrementally delivered agent replies.
//!
//! Explicit `channelData.streaming` / `channelData.streamingEnd` flags always
//! win. Without them a short message that arrives while a typing session is
//! open is treated as a fragment; such heuristic buffers are flushed as
//! complete messages once the stream goes quiet.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};
use wcs_core::Activity;

/// Messages at least this long are never guessed to be fragments.
pub const SHORT_TEXT_THRESHOLD: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationMode {
    /// Each fragment carries only new text.
    Append,
    /// Each fragment carries the whole text so far.
    Cumulative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    Explicit,
    Heuristic,
}

#[derive(Debug, Clone)]
pub struct StreamingBuffer {
    pub message_id: String,
    pub accumulated_text: String,
    pub chunk_count: u32,
    pub started_at: Instant,
    pub mode: Option<AccumulationMode>,
    pub origin: BufferOrigin,
    template: Activity,
}

impl StreamingBuffer {
    fn new(message_id: String, origin: BufferOrigin, template: Activity) -> Self {
        Self {
            message_id,
            accumulated_text: String::new(),
            chunk_count: 0,
            started_at: Instant::now(),
            mode: None,
            origin,
            template,
        }
    }

    fn push(&mut self, text: &str, declared: Option<AccumulationMode>) {
        self.chunk_count += 1;
        if self.mode.is_none() {
            if let Some(mode) = declared {
                self.mode = Some(mode);
            } else if !self.accumulated_text.is_empty() && !text.is_empty() {
                // The first fragment after non-empty text decides, then the mode is locked.
                self.mode = Some(if text.starts_with(self.accumulated_text.as_str()) {
                    AccumulationMode::Cumulative
                } else {
                    AccumulationMode::Append
                });
            }
        }
        match self.mode {
            Some(AccumulationMode::Append) => self.append(text),
            Some(AccumulationMode::Cumulative) | None => {
                if !text.is_empty() {
                    self.accumulated_text = text.to_string();
                }
            }
        }
    }

    fn append(&mut self, text: &str) {
        let separator = self.separator(text);
        self.accumulated_text.push_str(separator);
        self.accumulated_text.push_str(text);
    }

    /// Guessed fragments sharing a `replyToId` may be separate short replies;
    /// a finished sentence followed by a new word gets a space.
    fn separator(&self, next: &str) -> &'static str {
        let sentence_ended = self
            .accumulated_text
            .ends_with(|c: char| matches!(c, '.' | '!' | '?'));
        let starts_word = next.starts_with(|c: char| c.is_alphanumeric());
        if self.origin == BufferOrigin::Heuristic && sentence_ended && starts_word {
            " "
        } else {
            ""
        }
    }

    fn final_text(&self, terminal: &str) -> String {
        if terminal.is_empty() {
            self.accumulated_text.clone()
        } else if self.mode == Some(AccumulationMode::Cumulative)
            || terminal.starts_with(self.accumulated_text.as_str())
        {
            terminal.to_string()
        } else {
            format!("{}{}{}", self.accumulated_text, self.separator(terminal), terminal)
        }
    }

    fn into_activity(self, text: String) -> Activity {
        let mut activity = self.template;
        activity.text = Some(text);
        if activity.id.is_empty() {
            activity.id = self.message_id;
        }
        activity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Fragment,
    Terminal,
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Chunk {
        message_id: String,
        chunk_number: u32,
        duration: Duration,
        text: String,
    },
    Completed {
        message_id: String,
        chunk_count: u32,
        duration: Duration,
        activity: Activity,
    },
    Message(Activity),
}

/// Buffer key: `channelData.streamId`, then `channelData.messageId`, then
/// `replyToId`, then the activity id.
///
/// On the heuristic path `replyToId` groups every short reply to the same
/// user message, so two distinct answers can land in one buffer. Appends in
/// such buffers keep sentence boundaries apart and the idle flush bounds how
/// long they stay open.
pub fn stream_key(activity: &Activity) -> String {
    activity
        .channel_str("streamId")
        .or_else(|| activity.channel_str("messageId"))
        .or_else(|| activity.reply_to_id.as_deref().filter(|id| !id.is_empty()))
        .unwrap_or(activity.id.as_str())
        .to_string()
}

fn declared_mode(activity: &Activity) -> Option<AccumulationMode> {
    if activity.channel_flag("realtime") {
        Some(AccumulationMode::Append)
    } else if activity.channel_flag("cumulative") || activity.channel_flag("simulated") {
        Some(AccumulationMode::Cumulative)
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct StreamingReassembler {
    buffers: HashMap<String, StreamingBuffer>,
}

impl StreamingReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, activity: &Activity, typing_open: bool) -> Classification {
        if activity.channel_flag("streamingEnd") {
            return Classification::Terminal;
        }
        if activity.channel_flag("streaming") {
            return Classification::Fragment;
        }
        if activity.has_attachments() || activity.has_suggested_actions() {
            return Classification::Terminal;
        }
        if typing_open && activity.text().chars().count() < SHORT_TEXT_THRESHOLD {
            return Classification::Fragment;
        }
        if self.buffers.contains_key(&stream_key(activity)) {
            Classification::Terminal
        } else {
            Classification::Complete
        }
    }

    pub fn ingest(&mut self, activity: Activity, typing_open: bool) -> StreamOutcome {
        let key = stream_key(&activity);
        match self.classify(&activity, typing_open) {
            Classification::Fragment => self.fragment(key, activity),
            Classification::Terminal => self.finish(key, activity),
            Classification::Complete => StreamOutcome::Message(activity),
        }
    }

    fn fragment(&mut self, key: String, activity: Activity) -> StreamOutcome {
        let origin = if activity.channel_flag("streaming") {
            BufferOrigin::Explicit
        } else {
            BufferOrigin::Heuristic
        };
        let buffer = self.buffers.entry(key.clone()).or_insert_with(|| {
            debug!(message_id = %key, ?origin, "stream started");
            StreamingBuffer::new(key.clone(), origin, activity.clone())
        });
        if origin == BufferOrigin::Explicit {
            buffer.origin = BufferOrigin::Explicit;
        }
        buffer.push(activity.text(), declared_mode(&activity));
        buffer.template = activity;
        trace!(
            message_id = %key,
            chunk = buffer.chunk_count,
            "stream fragment"
        );
        StreamOutcome::Chunk {
            message_id: key,
            chunk_number: buffer.chunk_count,
            duration: buffer.started_at.elapsed(),
            text: buffer.accumulated_text.clone(),
        }
    }

    fn finish(&mut self, key: String, activity: Activity) -> StreamOutcome {
        let Some(buffer) = self.buffers.remove(&key) else {
            return StreamOutcome::Message(activity);
        };
        let text = buffer.final_text(activity.text());
        let chunk_count = buffer.chunk_count;
        let duration = buffer.started_at.elapsed();
        debug!(message_id = %key, chunk_count, ?duration, "stream completed");

        let mut assembled = activity;
        assembled.text = Some(text);
        if assembled.id.is_empty() {
            assembled.id = key.clone();
        }
        StreamOutcome::Completed {
            message_id: key,
            chunk_count,
            duration,
            activity: assembled,
        }
    }

    pub fn buffer(&self, key: &str) -> Option<&StreamingBuffer> {
        self.buffers.get(key)
    }

    pub fn open_streams(&self) -> usize {
        self.buffers.len()
    }

    pub fn has_heuristic_buffers(&self) -> bool {
        self.buffers
            .values()
            .any(|buffer| buffer.origin == BufferOrigin::Heuristic)
    }

    /// Completes every buffer that was opened by guesswork rather than flags.
    pub fn flush_heuristic(&mut self) -> Vec<StreamOutcome> {
        let keys: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| buffer.origin == BufferOrigin::Heuristic)
            .map(|(key, _)| key.clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.buffers.remove(&key))
            .map(|buffer| {
                let message_id = buffer.message_id.clone();
                let chunk_count = buffer.chunk_count;
                let duration = buffer.started_at.elapsed();
                let text = buffer.accumulated_text.clone();
                debug!(%message_id, chunk_count, "flushing idle stream");
                StreamOutcome::Completed {
                    message_id,
                    chunk_count,
                    duration,
                    activity: buffer.into_activity(text),
                }
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
