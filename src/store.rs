//! Storage layer over SQLite.
//!
//! [`Storage`] owns the connection pool and is the only code that writes
//! SQL. Every chunk mutation mirrors into `chunks_fts` and `chunk_vectors`
//! inside the same transaction as the `chunks` row, so the secondary
//! indexes never drift from the source table:
//!
//! | Mutation | `chunks_fts` | `chunk_vectors` |
//! |----------|--------------|-----------------|
//! | insert   | insert rowid | insert if embedded |
//! | update   | delete + insert | replace |
//! | delete   | delete rowid | delete |
//!
//! Lexical and vector queries apply every filter inside the SQL predicate,
//! before ranking, so narrow filters never shrink a fixed-size top-K.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::Path;

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::migrate;
use crate::models::{Chunk, ChunkFilter, Conversation, IndexedFile, NewChunk, Role, SearchResult};

pub const META_EMBEDDING_MODEL: &str = "embedding_model";
pub const META_EMBEDDING_DIM: &str = "embedding_dim";
pub const META_EMBEDDINGS_STALE: &str = "embeddings_stale";
pub const META_LAST_FULL_INDEX: &str = "last_full_index_at";

/// A conversation row plus its chunk count, for recency listings.
#[derive(Debug, Clone)]
pub struct RecentConversation {
    pub conversation: Conversation,
    pub chunk_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StoreCounts {
    pub conversations: i64,
    pub chunks: i64,
    pub embedded_chunks: i64,
    pub last_full_index_at: Option<String>,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if needed) and migrate the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;
        Ok(Self { pool })
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Conversations ============

    /// Everything the change detector needs, keyed by stored file path.
    ///
    /// Covers indexed conversations and files recorded as empty.
    pub async fn indexed_files(&self) -> Result<HashMap<String, IndexedFile>> {
        let skipped = sqlx::query("SELECT file_path, source_mtime, content_hash FROM skipped_files")
            .fetch_all(&self.pool)
            .await?;
        let rows = sqlx::query("SELECT id, file_path, source_mtime, content_hash FROM conversations")
            .fetch_all(&self.pool)
            .await?;

        let mut files = HashMap::with_capacity(skipped.len() + rows.len());
        for row in &skipped {
            files.insert(
                row.get::<String, _>("file_path"),
                IndexedFile {
                    conversation_id: None,
                    source_mtime: row.get("source_mtime"),
                    content_hash: row.get("content_hash"),
                },
            );
        }
        for row in &rows {
            files.insert(
                row.get::<String, _>("file_path"),
                IndexedFile {
                    conversation_id: Some(row.get("id")),
                    source_mtime: row.get("source_mtime"),
                    content_hash: row.get("content_hash"),
                },
            );
        }
        Ok(files)
    }

    /// Record a transcript that holds no messages, dropping any
    /// conversation previously indexed from it. Returns true if one was
    /// dropped.
    pub async fn record_skipped_file(
        &self,
        file_path: &str,
        content_hash: &str,
        source_mtime: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM conversations WHERE file_path = ?")
            .bind(file_path)
            .fetch_all(&mut *tx)
            .await?;
        let mut dropped = false;
        for id in &ids {
            dropped |= delete_conversation_tx(&mut tx, id).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO skipped_files (file_path, content_hash, source_mtime, recorded_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                source_mtime = excluded.source_mtime,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(file_path)
        .bind(content_hash)
        .bind(source_mtime)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(dropped)
    }

    pub async fn forget_skipped_file(&self, file_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM skipped_files WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store a new mtime for a file whose content did not change.
    pub async fn touch_file(&self, file_path: &str, source_mtime: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE conversations SET source_mtime = ? WHERE file_path = ?")
            .bind(source_mtime)
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE skipped_files SET source_mtime = ? WHERE file_path = ?")
            .bind(source_mtime)
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, project, title, created_at, file_path, content_hash, source_mtime, indexed_at
            FROM conversations WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(conversation_from_row))
    }

    pub async fn conversation_file_path(&self, id: &str) -> Result<Option<String>> {
        let path: Option<String> =
            sqlx::query_scalar("SELECT file_path FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(path)
    }

    /// Replace a conversation and all of its chunks in one transaction.
    ///
    /// Any existing row with the same id or file path is deleted first so
    /// chunk ordinals restart dense from zero.
    pub async fn replace_conversation(
        &self,
        conversation: &Conversation,
        chunks: &[NewChunk],
    ) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;

        let stale_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE id = ? OR file_path = ?")
                .bind(&conversation.id)
                .bind(&conversation.file_path)
                .fetch_all(&mut *tx)
                .await?;
        for id in &stale_ids {
            delete_conversation_tx(&mut tx, id).await?;
        }
        sqlx::query("DELETE FROM skipped_files WHERE file_path = ?")
            .bind(&conversation.file_path)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, project, title, created_at, file_path, content_hash, source_mtime, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.project)
        .bind(&conversation.title)
        .bind(conversation.created_at)
        .bind(&conversation.file_path)
        .bind(&conversation.content_hash)
        .bind(conversation.source_mtime)
        .bind(conversation.indexed_at)
        .execute(&mut *tx)
        .await?;

        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let blob = chunk.embedding.as_deref().map(vec_to_blob);
            let result = sqlx::query(
                r#"
                INSERT INTO chunks (conversation_id, chunk_index, page_number, role, content, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&conversation.id)
            .bind(chunk.chunk_index)
            .bind(chunk.page_number)
            .bind(chunk.role.as_str())
            .bind(&chunk.content)
            .bind(&blob)
            .execute(&mut *tx)
            .await?;
            let chunk_id = result.last_insert_rowid();

            sqlx::query("INSERT INTO chunks_fts (rowid, content) VALUES (?, ?)")
                .bind(chunk_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;

            if let (Some(vec), Some(blob)) = (&chunk.embedding, &blob) {
                sqlx::query("INSERT INTO chunk_vectors (chunk_id, dims, embedding) VALUES (?, ?, ?)")
                    .bind(chunk_id)
                    .bind(vec.len() as i64)
                    .bind(blob)
                    .execute(&mut *tx)
                    .await?;
            }
            ids.push(chunk_id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Delete a conversation with its chunks and their index entries.
    /// Returns false when no such conversation existed.
    pub async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_conversation_tx(&mut tx, id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Most recent conversations first, optionally for one project.
    pub async fn recent_conversations(
        &self,
        project: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RecentConversation>> {
        let rows = sqlx::query(
            r#"
            SELECT cv.id, cv.project, cv.title, cv.created_at, cv.file_path, cv.content_hash,
                   cv.source_mtime, cv.indexed_at,
                   (SELECT COUNT(*) FROM chunks c WHERE c.conversation_id = cv.id) AS chunk_count
            FROM conversations cv
            WHERE (? IS NULL OR cv.project = ?)
            ORDER BY cv.created_at DESC, cv.id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(project)
        .bind(project)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| RecentConversation {
                conversation: conversation_from_row(row),
                chunk_count: row.get("chunk_count"),
            })
            .collect())
    }

    // ============ Chunks ============

    pub async fn chunks_for_conversation(&self, conversation_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, chunk_index, page_number, role, content, embedding
            FROM chunks WHERE conversation_id = ?
            ORDER BY chunk_index
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let blob: Option<Vec<u8>> = row.get("embedding");
                Ok(Chunk {
                    id: row.get("id"),
                    conversation_id: row.get("conversation_id"),
                    chunk_index: row.get("chunk_index"),
                    page_number: row.get("page_number"),
                    role: row.get::<String, _>("role").parse()?,
                    content: row.get("content"),
                    embedding: blob.map(|b| blob_to_vec(&b)),
                })
            })
            .collect()
    }

    /// Rewrite a chunk's text. The lexical entry is removed and reinserted;
    /// the vector entry is replaced by `embedding` (or dropped when `None`).
    pub async fn update_chunk(
        &self,
        chunk_id: i64,
        content: &str,
        embedding: Option<&[f32]>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE chunks SET content = ? WHERE id = ?")
            .bind(content)
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE rowid = ?")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (rowid, content) VALUES (?, ?)")
            .bind(chunk_id)
            .bind(content)
            .execute(&mut *tx)
            .await?;

        write_embedding_tx(&mut tx, chunk_id, embedding).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Store embeddings for existing chunks in one transaction.
    pub async fn set_chunk_embeddings(&self, embeddings: &[(i64, Vec<f32>)]) -> Result<()> {
        if embeddings.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (chunk_id, vec) in embeddings {
            write_embedding_tx(&mut tx, *chunk_id, Some(vec)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Chunks with no embedding and `id > after_id`, in id order.
    pub async fn chunks_missing_embeddings(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT id, content FROM chunks WHERE embedding IS NULL AND id > ? ORDER BY id LIMIT ?",
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("id"), row.get("content")))
            .collect())
    }

    pub async fn count_missing_embeddings(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Drop every stored embedding. Returns the number of chunks affected.
    pub async fn invalidate_embeddings(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("UPDATE chunks SET embedding = NULL WHERE embedding IS NOT NULL")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    // ============ Retrieval ============

    /// Lexical match over chunk content, best first.
    ///
    /// `match_expr` must already be a sanitized FTS5 expression; its score
    /// is the negated BM25 rank, so higher is better. Every entry of
    /// `substrings` must also occur in the content (case-insensitive
    /// `LIKE`), which covers terms too short for the trigram index. With no
    /// FTS expression, rows score 0 and come newest conversation first.
    pub async fn lexical_search(
        &self,
        match_expr: Option<&str>,
        substrings: &[String],
        filter: &ChunkFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SearchResult>> {
        if match_expr.is_none() && substrings.is_empty() {
            return Ok(Vec::new());
        }

        let (source, rank, order) = match match_expr {
            Some(_) => (
                "chunks_fts JOIN chunks c ON c.id = chunks_fts.rowid",
                "bm25(chunks_fts)",
                "rank, c.id",
            ),
            None => ("chunks c", "0.0", "cv.created_at DESC, c.id"),
        };
        let mut sql = format!(
            r#"
            SELECT c.id AS chunk_id, c.conversation_id, cv.title, cv.project, c.role,
                   c.content, c.page_number, {rank} AS rank
            FROM {source}
            JOIN conversations cv ON cv.id = c.conversation_id
            WHERE (? IS NULL OR cv.project = ?)
              AND (? IS NULL OR c.role = ?)
              AND (? IS NULL OR cv.created_at >= ?)
              AND (? IS NULL OR cv.created_at <= ?)
            "#
        );
        if match_expr.is_some() {
            sql.push_str(" AND chunks_fts MATCH ?");
        }
        for _ in substrings {
            sql.push_str(" AND c.content LIKE ? ESCAPE '\\'");
        }
        sql.push_str(&format!(" ORDER BY {order} LIMIT ? OFFSET ?"));

        let role = filter.role.map(|r| r.as_str());
        let mut query = sqlx::query(&sql)
            .bind(&filter.project)
            .bind(&filter.project)
            .bind(role)
            .bind(role)
            .bind(filter.created_after)
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(filter.created_before);
        if let Some(expr) = match_expr {
            query = query.bind(expr);
        }
        for term in substrings {
            query = query.bind(like_pattern(term));
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Lexical query failed")?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                search_result_from_row(row, -rank)
            })
            .collect()
    }

    /// Cosine nearest neighbours of `query_vec` among filtered chunks.
    ///
    /// Only vectors with the query's dimensionality are compared.
    pub async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &ChunkFilter,
        k: i64,
    ) -> Result<Vec<SearchResult>> {
        if query_vec.is_empty() || k <= 0 {
            return Ok(Vec::new());
        }

        let role = filter.role.map(|r| r.as_str());
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.conversation_id, cv.title, cv.project, c.role,
                   c.content, c.page_number, v.embedding AS vector
            FROM chunk_vectors v
            JOIN chunks c ON c.id = v.chunk_id
            JOIN conversations cv ON cv.id = c.conversation_id
            WHERE v.dims = ?
              AND (? IS NULL OR cv.project = ?)
              AND (? IS NULL OR c.role = ?)
              AND (? IS NULL OR cv.created_at >= ?)
              AND (? IS NULL OR cv.created_at <= ?)
            "#,
        )
        .bind(query_vec.len() as i64)
        .bind(&filter.project)
        .bind(&filter.project)
        .bind(role)
        .bind(role)
        .bind(filter.created_after)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(filter.created_before)
        .fetch_all(&self.pool)
        .await
        .context("Vector query failed")?;

        let mut results = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                search_result_from_row(row, similarity)
            })
            .collect::<Result<Vec<_>>>()?;

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(k as usize);
        Ok(results)
    }

    // ============ Metadata ============

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_metadata(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM metadata WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The embedding model and dimensionality recorded for stored vectors.
    pub async fn embedding_identity(&self) -> Result<Option<(String, usize)>> {
        let model = self.get_metadata(META_EMBEDDING_MODEL).await?;
        let dim = self.get_metadata(META_EMBEDDING_DIM).await?;
        Ok(match (model, dim.and_then(|d| d.parse::<usize>().ok())) {
            (Some(model), Some(dim)) => Some((model, dim)),
            _ => None,
        })
    }

    pub async fn set_embedding_identity(&self, model: &str, dim: usize) -> Result<()> {
        self.set_metadata(META_EMBEDDING_MODEL, model).await?;
        self.set_metadata(META_EMBEDDING_DIM, &dim.to_string()).await
    }

    pub async fn embeddings_stale(&self) -> Result<bool> {
        Ok(self.get_metadata(META_EMBEDDINGS_STALE).await?.as_deref() == Some("1"))
    }

    pub async fn set_embeddings_stale(&self, stale: bool) -> Result<()> {
        if stale {
            self.set_metadata(META_EMBEDDINGS_STALE, "1").await
        } else {
            self.delete_metadata(META_EMBEDDINGS_STALE).await
        }
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedded_chunks: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreCounts {
            conversations,
            chunks,
            embedded_chunks,
            last_full_index_at: self.get_metadata(META_LAST_FULL_INDEX).await?,
        })
    }
}

/// `%term%` with LIKE wildcards in `term` escaped by `\\`.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

async fn delete_conversation_tx(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<bool> {
    sqlx::query("DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE conversation_id = ?)")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE conversation_id = ?)",
    )
    .bind(id)
    .execute(&mut **tx)
    .await?;
    // chunks go with the conversation via ON DELETE CASCADE.
    let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn write_embedding_tx(
    tx: &mut Transaction<'_, Sqlite>,
    chunk_id: i64,
    embedding: Option<&[f32]>,
) -> Result<()> {
    let blob = embedding.map(vec_to_blob);
    sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
        .bind(&blob)
        .bind(chunk_id)
        .execute(&mut **tx)
        .await?;

    match (embedding, blob) {
        (Some(vec), Some(blob)) => {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, dims, embedding) VALUES (?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET dims = excluded.dims, embedding = excluded.embedding
                "#,
            )
            .bind(chunk_id)
            .bind(vec.len() as i64)
            .bind(blob)
            .execute(&mut **tx)
            .await?;
        }
        _ => {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

fn conversation_from_row(row: &SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        project: row.get("project"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        file_path: row.get("file_path"),
        content_hash: row.get("content_hash"),
        source_mtime: row.get("source_mtime"),
        indexed_at: row.get("indexed_at"),
    }
}

fn search_result_from_row(row: &SqliteRow, score: f64) -> Result<SearchResult> {
    let role: Role = row.get::<String, _>("role").parse()?;
    Ok(SearchResult {
        chunk_id: row.get("chunk_id"),
        conversation_id: row.get("conversation_id"),
        title: row.get("title"),
        project: row.get("project"),
        role,
        content: row.get("content"),
        page_number: row.get("page_number"),
        score,
    })
}
