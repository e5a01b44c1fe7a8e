//! Core data types shared by the indexer, storage layer and search engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Author of a message or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => anyhow::bail!("invalid role: '{}'", other),
        }
    }
}

/// One indexed transcript file.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub project: String,
    pub title: String,
    /// Unix seconds.
    pub created_at: i64,
    pub file_path: String,
    pub content_hash: String,
    /// Unix milliseconds.
    pub source_mtime: i64,
    /// Unix seconds.
    pub indexed_at: i64,
}

/// A chunk ready to be written; the storage layer assigns the row id.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: i64,
    pub page_number: Option<i64>,
    pub role: Role,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
}

/// A stored chunk row.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i64,
    pub conversation_id: String,
    pub chunk_index: i64,
    pub page_number: Option<i64>,
    pub role: Role,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
}

/// What the change detector knows about an already-indexed file.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    /// `None` for a file recorded as holding no messages.
    pub conversation_id: Option<String>,
    pub source_mtime: i64,
    pub content_hash: String,
}

/// Result of diffing the source tree against the conversations table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<String>,
    /// Stored paths of vanished files that had no messages.
    pub forgotten: Vec<String>,
    /// Stored path and new mtime of files touched without a content change.
    pub touched: Vec<(String, i64)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.forgotten.is_empty()
            && self.touched.is_empty()
    }
}

/// A chunk matched by the lexical or vector channel, joined with its
/// conversation.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub conversation_id: String,
    pub title: String,
    pub project: String,
    pub role: Role,
    pub content: String,
    pub page_number: Option<i64>,
    /// Channel-specific relevance: negated BM25 for lexical, cosine for vector.
    pub score: f64,
}

/// A conversation as listed by the empty-query fallback.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub project: String,
    pub title: String,
    pub created_at: String,
    pub chunk_count: i64,
    pub url: String,
}

/// Filters applied inside both retrieval channels.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub project: Option<String>,
    pub role: Option<Role>,
    /// Inclusive lower bound on `conversations.created_at` (unix seconds).
    pub created_after: Option<i64>,
    /// Inclusive upper bound on `conversations.created_at` (unix seconds).
    pub created_before: Option<i64>,
}
