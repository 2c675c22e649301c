//! Transcript reconstruction: raw session event log → ordered display
//! messages.
//!
//! The runtime's log interleaves human turns, assistant turns, tool calls,
//! and tool results. Tool results come back wrapped in synthetic `user`
//! turns and point at their call only through an id, so reconstruction runs
//! in two passes:
//!
//! 1. index every `tool_result` by the id of the `tool_use` it answers
//!    ([`tool_results`]), over the whole log;
//! 2. walk the events in order and emit [`DisplayMessage`]s, attaching the
//!    indexed result to each tool invocation.
//!
//! Output is stable-sorted by timestamp. Everything here is pure; the
//! [`Transcript`] accumulator only caches the previous fetch so that a
//! grown log can be applied as a delta.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::COMMAND_MARKERS;

// ── Raw log ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of a session's durable event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub role: Role,
    pub content: RawContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl RawEvent {
    pub fn new(role: Role, content: RawContent, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content,
            timestamp,
            correlation_id: None,
        }
    }
}

/// Event content: either a bare string or a list of typed parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A typed content part. Runtime logs spell the fields in snake_case, the
/// task API in camelCase; both are accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(rename = "toolId", alias = "id")]
        tool_id: String,
        #[serde(rename = "toolName", alias = "name")]
        tool_name: String,
        #[serde(rename = "toolInput", alias = "input", default)]
        tool_input: Value,
    },
    ToolResult {
        #[serde(rename = "toolUseId", alias = "tool_use_id", default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(rename = "isError", alias = "is_error", default)]
        is_error: bool,
    },
    /// Thinking blocks, images, and anything else without a transcript row.
    #[serde(other)]
    Other,
}

// ── Display messages ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
}

/// A reconstructed transcript row. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    /// `None` on a tool invocation means the result has not arrived yet.
    #[serde(default)]
    pub tool_result: Option<String>,
    #[serde(default)]
    pub tool_error: Option<bool>,
}

impl DisplayMessage {
    fn text(id: String, kind: MessageKind, content: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            content: content.to_string(),
            timestamp,
            tool_use_id: None,
            tool_name: None,
            tool_input: None,
            tool_result: None,
            tool_error: None,
        }
    }

    pub fn is_tool_invocation(&self) -> bool {
        self.tool_name.is_some()
    }

    /// A tool invocation whose result has not been logged yet.
    pub fn is_pending(&self) -> bool {
        self.is_tool_invocation() && self.tool_result.is_none()
    }
}

// ── Pass 1: tool-result index ────────────────────────────────────────

/// A logged tool result, keyed in the index by the originating call id.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// Index every tool result in the log by the id of the call it answers.
///
/// Only user-role events carry results. When a part has no `toolUseId`, the
/// event-level correlation id is used instead.
pub fn tool_results(events: &[RawEvent]) -> HashMap<String, ToolOutcome> {
    let mut index = HashMap::new();
    for event in events.iter().filter(|event| event.role == Role::User) {
        let RawContent::Parts(parts) = &event.content else {
            continue;
        };
        for part in parts {
            let ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = part
            else {
                continue;
            };
            let key = if tool_use_id.is_empty() {
                match &event.correlation_id {
                    Some(id) => id.clone(),
                    None => continue,
                }
            } else {
                tool_use_id.clone()
            };
            index.insert(
                key,
                ToolOutcome {
                    content: render_result(content),
                    is_error: *is_error,
                    timestamp: event.timestamp,
                },
            );
        }
    }
    index
}

/// Flatten tool-result content: strings verbatim, block arrays by their
/// `text` blocks, anything else as JSON.
fn render_result(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                Value::String(text) => Some(text.as_str()),
                other => other.get("text").and_then(|v| v.as_str()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

// ── Pass 2: message construction ─────────────────────────────────────

fn is_command_output(text: &str) -> bool {
    COMMAND_MARKERS.iter().any(|marker| text.starts_with(marker))
}

/// Genuine human text of a user event; tool-result carriers contribute nothing.
fn user_text(content: &RawContent) -> String {
    match content {
        RawContent::Text(text) => text.clone(),
        RawContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn tool_message(
    id: String,
    tool_id: &str,
    tool_name: &str,
    tool_input: &Value,
    timestamp: DateTime<Utc>,
    index: &HashMap<String, ToolOutcome>,
) -> DisplayMessage {
    let outcome = index.get(tool_id);
    DisplayMessage {
        id,
        kind: MessageKind::Assistant,
        content: tool_name.to_string(),
        timestamp,
        tool_use_id: Some(tool_id.to_string()),
        tool_name: Some(tool_name.to_string()),
        tool_input: Some(serde_json::to_string(tool_input).unwrap_or_default()),
        tool_result: outcome.map(|o| o.content.clone()),
        tool_error: outcome.map(|o| o.is_error),
    }
}

/// Emit display messages for `events[offset..]`, in log order, unsorted.
/// Ids use absolute event positions so a delta build matches a full one.
fn build_messages(
    events: &[RawEvent],
    offset: usize,
    index: &HashMap<String, ToolOutcome>,
) -> Vec<DisplayMessage> {
    let mut messages = Vec::new();
    for (position, event) in events.iter().enumerate().skip(offset) {
        match event.role {
            Role::User => {
                let text = user_text(&event.content);
                let text = text.trim();
                if text.is_empty() || is_command_output(text) {
                    continue;
                }
                messages.push(DisplayMessage::text(
                    position.to_string(),
                    MessageKind::User,
                    text,
                    event.timestamp,
                ));
            }
            Role::Assistant => match &event.content {
                RawContent::Text(text) => {
                    if !text.trim().is_empty() {
                        messages.push(DisplayMessage::text(
                            position.to_string(),
                            MessageKind::Assistant,
                            text,
                            event.timestamp,
                        ));
                    }
                }
                RawContent::Parts(parts) => {
                    for (part_index, part) in parts.iter().enumerate() {
                        let part_id = format!("{position}.{part_index}");
                        match part {
                            ContentPart::Text { text } if !text.trim().is_empty() => {
                                messages.push(DisplayMessage::text(
                                    part_id,
                                    MessageKind::Assistant,
                                    text,
                                    event.timestamp,
                                ));
                            }
                            ContentPart::ToolUse {
                                tool_id,
                                tool_name,
                                tool_input,
                            } => {
                                let id = if tool_id.is_empty() {
                                    part_id
                                } else {
                                    tool_id.clone()
                                };
                                messages.push(tool_message(
                                    id,
                                    tool_id,
                                    tool_name,
                                    tool_input,
                                    event.timestamp,
                                    index,
                                ));
                            }
                            _ => {}
                        }
                    }
                }
            },
        }
    }
    messages
}

fn sort_by_time(messages: &mut [DisplayMessage]) {
    // `sort_by_key` is stable: equal timestamps keep log order.
    messages.sort_by_key(|message| message.timestamp);
}

/// Reconstruct the full transcript of a raw event log.
pub fn reconstruct(events: &[RawEvent]) -> Vec<DisplayMessage> {
    reconstruct_from(events, 0)
}

/// Reconstruct only the messages of `events[offset..]`.
///
/// Tool results are still indexed over the whole log, since a result for an
/// old call can land in the appended slice and vice versa.
pub fn reconstruct_from(events: &[RawEvent], offset: usize) -> Vec<DisplayMessage> {
    let index = tool_results(events);
    let mut messages = build_messages(events, offset, &index);
    sort_by_time(&mut messages);
    messages
}

// ── Incremental accumulator ──────────────────────────────────────────

/// How a [`Transcript`] changed after applying a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranscriptUpdate {
    Unchanged,
    /// The fetch extended the known log; this many messages were added.
    Appended(usize),
    /// The fetch did not extend the known log and everything was rebuilt.
    Rebuilt,
}

/// The last fetched log of a session and its reconstructed messages.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    events: Vec<RawEvent>,
    messages: Vec<DisplayMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Apply a freshly fetched log.
    ///
    /// When `fetched` starts with the events already known, only the new
    /// tail is reconstructed and existing tool invocations pick up their
    /// latest indexed result; otherwise the transcript is rebuilt. Either way
    /// the result equals `reconstruct(&fetched)`.
    pub fn apply(&mut self, fetched: Vec<RawEvent>) -> TranscriptUpdate {
        let known = self.events.len();
        let extends = fetched.len() >= known && fetched[..known] == self.events[..];
        if !extends {
            self.messages = reconstruct(&fetched);
            self.events = fetched;
            return TranscriptUpdate::Rebuilt;
        }
        if fetched.len() == known {
            return TranscriptUpdate::Unchanged;
        }

        let index = tool_results(&fetched);
        // A later result for the same call replaces an earlier one.
        for message in &mut self.messages {
            let Some(outcome) = message.tool_use_id.as_ref().and_then(|id| index.get(id)) else {
                continue;
            };
            message.tool_result = Some(outcome.content.clone());
            message.tool_error = Some(outcome.is_error);
        }

        let mut fresh = build_messages(&fetched, known, &index);
        let added = fresh.len();
        self.messages.append(&mut fresh);
        sort_by_time(&mut self.messages);
        self.events = fetched;
        TranscriptUpdate::Appended(added)
    }
}
