//! Idempotent schema migrations.
//!
//! `conversations`, `chunks` and `metadata` are the source of truth;
//! `skipped_files` remembers transcripts that held no messages. The two
//! secondary indexes, `chunks_fts` (lexical) and `chunk_vectors` (vector),
//! carry no triggers: [`crate::store::Storage`] maintains them explicitly in
//! the same transaction as every chunk mutation.

use anyhow::Result;
use sqlx::SqlitePool;

/// Version written to `metadata.schema_version`.
pub const SCHEMA_VERSION: i64 = 4;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            file_path TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            source_mtime INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Transcripts that parsed to zero messages. Kept so change detection
    // does not treat them as new on every pass.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS skipped_files (
            file_path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            source_mtime INTEGER NOT NULL,
            recorded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL
                REFERENCES conversations(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            page_number INTEGER,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            embedding BLOB,
            UNIQUE(conversation_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Lexical index: rowid = chunks.id, trigram tokens for substring matches.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                content,
                tokenize = 'trigram'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Vector index over chunk embeddings.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id INTEGER PRIMARY KEY
                REFERENCES chunks(id) ON DELETE CASCADE,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_conversation ON chunks(conversation_id, chunk_index)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_role ON chunks(role)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_created ON conversations(created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO metadata (key, value) VALUES ('schema_version', ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(SCHEMA_VERSION.to_string())
    .execute(pool)
    .await?;

    Ok(())
}
