//! Indexing pass orchestration.
//!
//! One pass runs: sidecar health probe → embedding identity reconciliation →
//! change detection → tombstone deletes → per-file pipeline for added and
//! modified files → embedding backfill.
//!
//! The directory walk, hashing and file reads run on tokio's blocking pool.
//!
//! The per-file pipeline (read → hash → parse → chunk → embed → write) is the
//! unit of atomicity. Embeddings are computed before storage is touched, and
//! the conversation row, its chunks and both index mirrors are written in a
//! single transaction by [`Storage::replace_conversation`]. A failing file is
//! recorded in [`IndexStats::errors`] and the pass moves on; the next pass
//! picks it up again through change detection.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config, EmbeddingConfig, SourceConfig};
use crate::embedding::{BatchOutcome, Embedder, SidecarHealth};
use crate::models::{Conversation, NewChunk};
use crate::scanner::{hash_bytes, path_key, system_time_millis, SourceScanner};
use crate::store::{Storage, META_LAST_FULL_INDEX};
use crate::transcript::parse_transcript;

/// Conversation titles are cut to this many characters.
const TITLE_MAX_CHARS: usize = 120;

/// Project label for transcripts sitting directly under the source root.
pub const DEFAULT_PROJECT: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    /// Files that parsed to zero messages.
    pub skipped: usize,
    pub chunks: usize,
    /// Chunks embedded inline by the per-file pipeline.
    pub embedded: usize,
    /// Chunks embedded by the backfill step.
    pub reembedded: usize,
    /// Stored embeddings dropped because the sidecar model changed.
    pub invalidated: u64,
    pub malformed_lines: usize,
    pub errors: Vec<FileError>,
}

impl IndexStats {
    /// Whether the pass changed anything a downstream consumer would see.
    pub fn changed_anything(&self) -> bool {
        self.added + self.modified + self.deleted > 0
    }
}

/// Sidecar state for the duration of one pass.
struct PassEmbedding {
    dim: Option<usize>,
}

impl PassEmbedding {
    fn active(&self) -> bool {
        self.dim.is_some()
    }

    /// Stop embedding for the rest of the pass after the first failure.
    fn disable(&mut self, reason: &str) {
        if self.dim.take().is_some() {
            tracing::warn!(reason, "embedding sidecar unavailable; continuing without vectors");
        }
    }
}

pub struct Indexer {
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    source: SourceConfig,
    chunking: ChunkingConfig,
    embedding: EmbeddingConfig,
}

impl Indexer {
    pub fn new(config: &Config, storage: Storage, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            embedder,
            source: config.source.clone(),
            chunking: config.chunking.clone(),
            embedding: config.embedding.clone(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source.root
    }

    /// Run one incremental pass over `source_root`.
    ///
    /// Returns `Err` only for systemic failures (source root unreadable,
    /// storage unreachable). Per-file failures land in the stats.
    pub async fn run_index(&self, source_root: &Path) -> Result<IndexStats> {
        let mut stats = IndexStats::default();

        let health = self.embedder.health().await;
        let mut pass = PassEmbedding {
            dim: health.identity().map(|(_, dim)| dim),
        };
        match &health {
            SidecarHealth::Available { model, dim } => {
                tracing::debug!(model, dim, "embedding sidecar available");
                stats.invalidated = self.reconcile_embedding_identity(model, *dim).await?;
            }
            SidecarHealth::Unavailable { reason } => {
                if self.embedding.is_enabled() {
                    tracing::warn!(reason, "embedding sidecar unavailable; indexing lexically only");
                }
            }
        }

        let scanner = SourceScanner::new(&SourceConfig {
            root: source_root.to_path_buf(),
            ..self.source.clone()
        })?;
        let indexed = self.storage.indexed_files().await?;
        let changes = tokio::task::spawn_blocking(move || scanner.detect_changes(&indexed))
            .await
            .context("Change detection task failed")??;
        tracing::info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            touched = changes.touched.len(),
            "change detection complete"
        );

        for id in &changes.deleted {
            self.storage
                .delete_conversation(id)
                .await
                .with_context(|| format!("Failed to delete conversation {}", id))?;
            stats.deleted += 1;
        }
        for file_path in &changes.forgotten {
            self.storage.forget_skipped_file(file_path).await?;
        }
        for (file_path, mtime) in &changes.touched {
            self.storage.touch_file(file_path, *mtime).await?;
        }

        let work = changes
            .added
            .iter()
            .map(|p| (p, true))
            .chain(changes.modified.iter().map(|p| (p, false)));
        for (path, is_new) in work {
            match self.index_file(source_root, path, &mut pass, &mut stats).await {
                Ok(true) if is_new => stats.added += 1,
                Ok(true) => stats.modified += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to index file");
                    stats.errors.push(FileError {
                        path: path_key(path),
                        message: format!("{:#}", e),
                    });
                }
            }
        }

        self.backfill_embeddings(&mut pass, &mut stats).await?;

        self.storage
            .set_metadata(META_LAST_FULL_INDEX, &chrono::Utc::now().to_rfc3339())
            .await?;

        tracing::info!(
            added = stats.added,
            modified = stats.modified,
            deleted = stats.deleted,
            chunks = stats.chunks,
            embedded = stats.embedded + stats.reembedded,
            errors = stats.errors.len(),
            "index pass complete"
        );
        Ok(stats)
    }

    /// Compare the live sidecar identity with the recorded one. On a change
    /// every stored embedding is dropped and the stale flag is raised until
    /// backfill catches up.
    async fn reconcile_embedding_identity(&self, model: &str, dim: usize) -> Result<u64> {
        match self.storage.embedding_identity().await? {
            Some((recorded_model, recorded_dim))
                if recorded_model == model && recorded_dim == dim =>
            {
                Ok(0)
            }
            Some((recorded_model, recorded_dim)) => {
                tracing::info!(
                    from_model = %recorded_model,
                    from_dim = recorded_dim,
                    to_model = model,
                    to_dim = dim,
                    "embedding model changed; invalidating stored vectors"
                );
                let invalidated = self.storage.invalidate_embeddings().await?;
                self.storage.set_embedding_identity(model, dim).await?;
                self.storage.set_embeddings_stale(true).await?;
                Ok(invalidated)
            }
            None => {
                self.storage.set_embedding_identity(model, dim).await?;
                Ok(0)
            }
        }
    }

    /// Index one file. Returns `Ok(false)` when it held no messages.
    async fn index_file(
        &self,
        source_root: &Path,
        path: &Path,
        pass: &mut PassEmbedding,
        stats: &mut IndexStats,
    ) -> Result<bool> {
        let file_path = path_key(path);
        let id = conversation_id(path)?;

        if let Some(existing) = self.storage.conversation_file_path(&id).await? {
            if existing != file_path && Path::new(&existing).exists() {
                anyhow::bail!(
                    "conversation id '{}' already belongs to {}",
                    id,
                    existing
                );
            }
        }

        let (bytes, mtime, content_hash) = read_source(path.to_path_buf()).await?;

        let parsed = parse_transcript(&String::from_utf8_lossy(&bytes));
        stats.malformed_lines += parsed.malformed_lines;
        if parsed.messages.is_empty() {
            tracing::debug!(path = %path.display(), "no messages; skipping");
            // Drops any conversation the file used to hold.
            self.storage
                .record_skipped_file(&file_path, &content_hash, mtime)
                .await?;
            return Ok(false);
        }

        let mut chunks = Vec::new();
        for message in &parsed.messages {
            for piece in chunk_text(
                &message.text,
                self.chunking.max_tokens,
                self.chunking.overlap_tokens,
            ) {
                let chunk_index = chunks.len() as i64;
                chunks.push(NewChunk {
                    chunk_index,
                    page_number: Some(page_for(chunk_index, self.chunking.chunks_per_page)),
                    role: message.role,
                    content: piece,
                    embedding: None,
                });
            }
        }

        stats.embedded += self.embed_chunks(&mut chunks, pass).await;

        let now = chrono::Utc::now().timestamp();
        let conversation = Conversation {
            title: parsed.title(TITLE_MAX_CHARS).unwrap_or_else(|| id.clone()),
            project: project_for(source_root, path),
            created_at: parsed
                .first_timestamp
                .map(|ts| ts.timestamp())
                .unwrap_or(mtime / 1000),
            id,
            file_path,
            content_hash,
            source_mtime: mtime,
            indexed_at: now,
        };

        self.storage
            .replace_conversation(&conversation, &chunks)
            .await
            .with_context(|| format!("Failed to store conversation {}", conversation.id))?;
        stats.chunks += chunks.len();
        Ok(true)
    }

    /// Best-effort batch embedding. Returns how many chunks got a vector.
    async fn embed_chunks(&self, chunks: &mut [NewChunk], pass: &mut PassEmbedding) -> usize {
        let mut embedded = 0;
        for batch in chunks.chunks_mut(self.embedding.batch_size.max(1)) {
            let Some(dim) = pass.dim else {
                break;
            };
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            match self.embedder.embed_batch(&texts).await {
                BatchOutcome::Embedded(vectors) => {
                    for (chunk, vec) in batch.iter_mut().zip(vectors) {
                        if vec.len() == dim {
                            chunk.embedding = Some(vec);
                            embedded += 1;
                        } else {
                            tracing::debug!(got = vec.len(), dim, "discarding embedding of wrong size");
                        }
                    }
                }
                BatchOutcome::Unavailable(reason) => pass.disable(&reason),
            }
        }
        embedded
    }

    /// Embed chunks stored without a vector, oldest first, up to
    /// `backfill_limit`. Clears the stale flag once none remain.
    async fn backfill_embeddings(
        &self,
        pass: &mut PassEmbedding,
        stats: &mut IndexStats,
    ) -> Result<()> {
        if !pass.active() {
            return Ok(());
        }

        let batch_size = self.embedding.batch_size.max(1);
        let mut budget = self.embedding.backfill_limit.unwrap_or(usize::MAX);
        let mut after_id = 0i64;

        while budget > 0 {
            let Some(dim) = pass.dim else {
                break;
            };
            let take = batch_size.min(budget);
            let pending = self
                .storage
                .chunks_missing_embeddings(after_id, take as i64)
                .await?;
            let Some(&(last_id, _)) = pending.last() else {
                break;
            };
            after_id = last_id;
            budget -= pending.len();

            let texts: Vec<String> = pending.iter().map(|(_, text)| text.clone()).collect();
            match self.embedder.embed_batch(&texts).await {
                BatchOutcome::Embedded(vectors) => {
                    let updates: Vec<(i64, Vec<f32>)> = pending
                        .iter()
                        .zip(vectors)
                        .filter(|(_, vec)| vec.len() == dim)
                        .map(|((id, _), vec)| (*id, vec))
                        .collect();
                    stats.reembedded += updates.len();
                    self.storage.set_chunk_embeddings(&updates).await?;
                }
                BatchOutcome::Unavailable(reason) => pass.disable(&reason),
            }
        }

        if pass.active()
            && self.storage.embeddings_stale().await?
            && self.storage.count_missing_embeddings().await? == 0
        {
            tracing::info!("embedding backfill complete; vector search re-enabled");
            self.storage.set_embeddings_stale(false).await?;
        }
        Ok(())
    }
}

/// Read a transcript with its mtime (ms) and content hash, off the runtime
/// threads.
async fn read_source(path: PathBuf) -> Result<(Vec<u8>, i64, String)> {
    tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, i64, String)> {
        let bytes =
            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let mtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(system_time_millis)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let content_hash = hash_bytes(&bytes);
        Ok((bytes, mtime, content_hash))
    })
    .await
    .context("File read task failed")?
}

/// Stable conversation id: the transcript's file stem.
pub fn conversation_id(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .with_context(|| format!("Cannot derive a conversation id from {}", path.display()))
}

/// Project label: the first directory under the source root.
pub fn project_for(source_root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(source_root).unwrap_or(path);
    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(first), Some(_)) => first.as_os_str().to_string_lossy().to_string(),
        _ => DEFAULT_PROJECT.to_string(),
    }
}

/// 1-based display page of a chunk.
pub fn page_for(chunk_index: i64, chunks_per_page: usize) -> i64 {
    chunk_index / chunks_per_page.max(1) as i64 + 1
}
