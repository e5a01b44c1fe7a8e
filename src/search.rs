//! Hybrid search engine.
//!
//! A non-empty query runs two retrieval channels with identical filters:
//!
//! - **Lexical**: FTS5 trigram match over sanitized, quoted tokens, ranked
//!   by BM25.
//! - **Vector**: cosine similarity between the query embedding and stored
//!   chunk vectors, used only when the sidecar is healthy and its model
//!   matches the one the vectors were built with.
//!
//! Both lists are merged with Reciprocal Rank Fusion:
//!
//! ```text
//! score(d) = Σ_lists 1 / (k + rank_list(d))      rank zero-based, k = 60
//! ```
//!
//! When the vector channel cannot be used the response is lexical-only and
//! says so through `degraded` and `degraded_reason`.
//!
//! An empty query lists the most recent conversations instead.
//!
//! User input never makes a search fail: negative paging, unknown roles,
//! unparsable dates and inverted date ranges all produce an empty result.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{EmbedOutcome, Embedder, SidecarHealth};
use crate::models::{ChunkFilter, ConversationSummary, Role, SearchResult};
use crate::snippet::{make_snippet, TermMatcher};
use crate::store::Storage;

/// Trigram tokenizer: shorter substrings never match.
const MIN_TOKEN_CHARS: usize = 3;

const QUERY_OPERATORS: &[&str] = &["AND", "OR", "NOT", "NEAR"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    pub project: Option<String>,
    pub role: Option<String>,
    /// `YYYY-MM-DD` or RFC 3339, inclusive.
    pub after: Option<String>,
    /// `YYYY-MM-DD` (whole day included) or RFC 3339, inclusive.
    pub before: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub filters: SearchFilters,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Hybrid,
    Lexical,
    /// Empty query: most recent conversations.
    Recent,
}

/// Why the vector channel was or was not used for a query.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorStatus {
    Used,
    Unavailable(String),
    ModelMismatch { indexed: String, live: String },
    Stale,
}

impl VectorStatus {
    pub fn reason(&self) -> Option<String> {
        match self {
            VectorStatus::Used => None,
            VectorStatus::Unavailable(reason) => Some(format!("sidecar_unavailable: {}", reason)),
            VectorStatus::ModelMismatch { indexed, live } => Some(format!(
                "model_mismatch: indexed with {}, sidecar serves {}",
                indexed, live
            )),
            VectorStatus::Stale => Some("stale_embeddings".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: i64,
    pub conversation_id: String,
    pub title: String,
    pub project: String,
    pub role: Role,
    pub snippet: String,
    pub page_number: Option<i64>,
    pub score: f64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub mode: SearchMode,
    pub results: Vec<SearchHit>,
    pub conversations: Vec<ConversationSummary>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

impl SearchResponse {
    fn empty(mode: SearchMode) -> Self {
        Self {
            mode,
            results: Vec::new(),
            conversations: Vec::new(),
            degraded: false,
            degraded_reason: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.conversations.is_empty()
    }
}

#[derive(Clone)]
pub struct SearchEngine {
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    retrieval: RetrievalConfig,
    base_url: String,
}

impl SearchEngine {
    pub fn new(config: &Config, storage: Storage, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            embedder,
            retrieval: config.retrieval.clone(),
            base_url: config.display.base_url.clone(),
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let query = request.query.trim();
        let mode = if query.is_empty() {
            SearchMode::Recent
        } else {
            SearchMode::Lexical
        };

        let limit = request.limit.unwrap_or(self.retrieval.default_limit);
        let offset = request.offset.unwrap_or(0);
        if limit <= 0 || offset < 0 {
            return Ok(SearchResponse::empty(mode));
        }
        let limit = limit.min(self.retrieval.max_limit);

        if mode == SearchMode::Recent {
            return self
                .recent(request.filters.project.as_deref(), limit, offset)
                .await;
        }

        let Some(filter) = resolve_filter(&request.filters) else {
            return Ok(SearchResponse::empty(mode));
        };

        let tokens = sanitize_tokens(query);
        if tokens.is_empty() {
            return Ok(SearchResponse::empty(mode));
        }
        let (indexed, short) = split_short_tokens(tokens.clone());
        let match_expr = (!indexed.is_empty()).then(|| to_match_expr(&indexed));

        let wanted = offset.saturating_add(limit);
        let candidates = self.retrieval.candidate_k.max(wanted);

        let (lexical, vector) = tokio::join!(
            self.storage
                .lexical_search(match_expr.as_deref(), &short, &filter, candidates, 0),
            self.vector_candidates(query, &filter, candidates)
        );
        let lexical = lexical?;

        let (mode, ranked, status) = match vector {
            (VectorStatus::Used, hits) => (
                SearchMode::Hybrid,
                rrf_merge(&[lexical, hits], self.retrieval.rrf_k),
                VectorStatus::Used,
            ),
            (status, _) => (SearchMode::Lexical, lexical, status),
        };

        let matcher = TermMatcher::new(&tokens);
        let results = ranked
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|r| self.to_hit(r, matcher.as_ref()))
            .collect();

        let degraded_reason = status.reason();
        Ok(SearchResponse {
            mode,
            results,
            conversations: Vec::new(),
            degraded: degraded_reason.is_some(),
            degraded_reason,
        })
    }

    /// Whether vector search may be trusted right now.
    pub async fn vector_status(&self) -> Result<(VectorStatus, Option<usize>)> {
        let (live_model, live_dim) = match self.embedder.health().await {
            SidecarHealth::Available { model, dim } => (model, dim),
            SidecarHealth::Unavailable { reason } => {
                return Ok((VectorStatus::Unavailable(reason), None))
            }
        };

        match self.storage.embedding_identity().await? {
            Some((model, dim)) if model == live_model && dim == live_dim => {}
            Some((model, dim)) => {
                return Ok((
                    VectorStatus::ModelMismatch {
                        indexed: format!("{} ({})", model, dim),
                        live: format!("{} ({})", live_model, live_dim),
                    },
                    None,
                ))
            }
            None => {
                return Ok((
                    VectorStatus::Unavailable("no embeddings indexed yet".to_string()),
                    None,
                ))
            }
        }

        if self.storage.embeddings_stale().await? {
            return Ok((VectorStatus::Stale, None));
        }
        Ok((VectorStatus::Used, Some(live_dim)))
    }

    /// Vector channel. Any failure degrades to an empty, flagged list.
    async fn vector_candidates(
        &self,
        query: &str,
        filter: &ChunkFilter,
        k: i64,
    ) -> (VectorStatus, Vec<SearchResult>) {
        let dim = match self.vector_status().await {
            Ok((VectorStatus::Used, Some(dim))) => dim,
            Ok((status, _)) => return (status, Vec::new()),
            Err(e) => return (VectorStatus::Unavailable(format!("{:#}", e)), Vec::new()),
        };

        let query_vec = match self.embedder.embed(query).await {
            EmbedOutcome::Embedded(v) if v.len() == dim => v,
            EmbedOutcome::Embedded(v) => {
                return (
                    VectorStatus::Unavailable(format!(
                        "query embedding has {} dimensions, expected {}",
                        v.len(),
                        dim
                    )),
                    Vec::new(),
                )
            }
            EmbedOutcome::Unavailable(reason) => {
                return (VectorStatus::Unavailable(reason), Vec::new())
            }
        };

        match self.storage.vector_search(&query_vec, filter, k).await {
            Ok(hits) => (VectorStatus::Used, hits),
            Err(e) => {
                tracing::warn!(error = %e, "vector query failed");
                (VectorStatus::Unavailable(format!("{:#}", e)), Vec::new())
            }
        }
    }

    async fn recent(
        &self,
        project: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<SearchResponse> {
        let project = project.map(str::trim).filter(|p| !p.is_empty());
        let rows = self
            .storage
            .recent_conversations(project, limit, offset)
            .await?;

        let conversations = rows
            .into_iter()
            .map(|row| {
                let c = row.conversation;
                ConversationSummary {
                    url: display_url(&self.base_url, &c.project, &c.id, Some(1)),
                    created_at: DateTime::from_timestamp(c.created_at, 0)
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_default(),
                    chunk_count: row.chunk_count,
                    id: c.id,
                    project: c.project,
                    title: c.title,
                }
            })
            .collect();

        Ok(SearchResponse {
            conversations,
            ..SearchResponse::empty(SearchMode::Recent)
        })
    }

    fn to_hit(&self, r: SearchResult, matcher: Option<&TermMatcher>) -> SearchHit {
        let snippet = make_snippet(
            &r.content,
            matcher,
            self.retrieval.snippet_radius,
            self.retrieval.snippet_fallback_chars,
        );
        let snippet = match matcher {
            Some(m) => m.highlight(
                &snippet,
                &self.retrieval.highlight_open,
                &self.retrieval.highlight_close,
            ),
            None => snippet,
        };

        SearchHit {
            url: display_url(&self.base_url, &r.project, &r.conversation_id, r.page_number),
            chunk_id: r.chunk_id,
            conversation_id: r.conversation_id,
            title: r.title,
            project: r.project,
            role: r.role,
            snippet,
            page_number: r.page_number,
            score: r.score,
        }
    }
}

/// Merge ranked lists with Reciprocal Rank Fusion.
///
/// Each item scores `1 / (k + rank)` per list it appears in (rank
/// zero-based), summed across lists. Metadata comes from the first list an
/// item appears in. Ties keep first-seen order.
pub fn rrf_merge(lists: &[Vec<SearchResult>], k: f64) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = Vec::new();
    let mut position: HashMap<i64, usize> = HashMap::new();

    for list in lists {
        for (rank, item) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f64);
            match position.get(&item.chunk_id) {
                Some(&i) => merged[i].score += contribution,
                None => {
                    position.insert(item.chunk_id, merged.len());
                    merged.push(SearchResult {
                        score: contribution,
                        ..item.clone()
                    });
                }
            }
        }
    }

    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

/// Split a raw query into literal tokens safe to quote for FTS5.
///
/// Query-syntax characters become separators and boolean operators are
/// dropped.
pub fn sanitize_tokens(query: &str) -> Vec<String> {
    let cleaned: String = query
        .chars()
        .map(|c| match c {
            '"' | '\'' | '*' | '(' | ')' | '^' | ':' | '{' | '}' | '[' | ']' | '+' | '-' | '~'
            | ',' | ';' => ' ',
            c => c,
        })
        .collect();

    let mut tokens: Vec<String> = Vec::new();
    for token in cleaned.split_whitespace() {
        if QUERY_OPERATORS.contains(&token) {
            continue;
        }
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// Split tokens into those the trigram index can match and the shorter
/// ones, which are matched as plain substrings.
pub fn split_short_tokens(tokens: Vec<String>) -> (Vec<String>, Vec<String>) {
    tokens
        .into_iter()
        .partition(|t| t.chars().count() >= MIN_TOKEN_CHARS)
}

/// FTS5 expression matching every token as a quoted phrase.
pub fn to_match_expr(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve user filters into storage bounds. `None` means no row can match.
pub fn resolve_filter(filters: &SearchFilters) -> Option<ChunkFilter> {
    let non_empty = |s: &Option<String>| {
        s.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let role = match non_empty(&filters.role) {
        Some(r) => Some(r.parse::<Role>().ok()?),
        None => None,
    };
    let created_after = match non_empty(&filters.after) {
        Some(s) => Some(parse_bound(&s, false)?),
        None => None,
    };
    let created_before = match non_empty(&filters.before) {
        Some(s) => Some(parse_bound(&s, true)?),
        None => None,
    };
    if let (Some(a), Some(b)) = (created_after, created_before) {
        if a > b {
            return None;
        }
    }

    Some(ChunkFilter {
        project: non_empty(&filters.project),
        role,
        created_after,
        created_before,
    })
}

/// Unix seconds for a date bound. A bare date as an upper bound covers the
/// whole day.
fn parse_bound(s: &str, end_of_day: bool) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59)?
    } else {
        NaiveTime::MIN
    };
    Some(date.and_time(time).and_utc().timestamp())
}

/// Link to a conversation page in the static archive.
pub fn display_url(base_url: &str, project: &str, conversation_id: &str, page: Option<i64>) -> String {
    format!(
        "{}/{}/{}/page-{:03}.html",
        base_url.trim_end_matches('/'),
        project,
        conversation_id,
        page.unwrap_or(1)
    )
}
