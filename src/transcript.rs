//! JSONL transcript parsing.
//!
//! A transcript is one JSON object per line. Only `user` and `assistant`
//! records whose nested `message.role` agrees with the outer `type` become
//! messages; tool results, summaries, progress and snapshot records are
//! dropped. Message content is either a plain string or a list of typed
//! blocks, and only `text` blocks survive.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::Role;

/// `message.content` as it appears on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    PlainText(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Text content with non-text blocks removed, newline-joined.
    pub fn text(&self) -> String {
        match self {
            MessageContent::PlainText(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.kind == "text")
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: Option<String>,
    message: Option<RawMessage>,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    role: Option<String>,
    content: Option<MessageContent>,
}

/// A role-tagged message in transcript order.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Position among emitted messages, starting at 0.
    pub index: usize,
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTranscript {
    pub messages: Vec<Message>,
    /// Earliest record timestamp seen in the file, if any parsed.
    pub first_timestamp: Option<DateTime<Utc>>,
    /// Lines that were not valid JSON records.
    pub malformed_lines: usize,
}

impl ParsedTranscript {
    /// First line of the first user message, used as the conversation title.
    pub fn title(&self, max_chars: usize) -> Option<String> {
        let first = self.messages.iter().find(|m| m.role == Role::User)?;
        let line = first.text.lines().map(str::trim).find(|l| !l.is_empty())?;
        if line.chars().count() <= max_chars {
            Some(line.to_string())
        } else {
            let truncated: String = line.chars().take(max_chars).collect();
            Some(format!("{}...", truncated.trim_end()))
        }
    }
}

/// Parse transcript text. Never fails: bad lines are skipped and counted.
pub fn parse_transcript(raw: &str) -> ParsedTranscript {
    let mut parsed = ParsedTranscript::default();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: RawRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed transcript line");
                parsed.malformed_lines += 1;
                continue;
            }
        };

        if let Some(ts) = record.timestamp.as_deref().and_then(parse_timestamp) {
            parsed.first_timestamp = Some(match parsed.first_timestamp {
                Some(existing) if existing <= ts => existing,
                _ => ts,
            });
        }

        let Some(role) = record_role(&record) else {
            continue;
        };
        let Some(content) = record.message.and_then(|m| m.content) else {
            continue;
        };

        let text = content.text();
        if text.trim().is_empty() {
            continue;
        }

        let index = parsed.messages.len();
        parsed.messages.push(Message { index, role, text });
    }

    parsed
}

/// The record's role, if outer type and nested role agree on user/assistant.
fn record_role(record: &RawRecord) -> Option<Role> {
    let outer: Role = record.record_type.as_deref()?.parse().ok()?;
    let inner: Role = record.message.as_ref()?.role.as_deref()?.parse().ok()?;
    (outer == inner).then_some(outer)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
