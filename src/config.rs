//! TOML configuration parsing and validation.
//!
//! All sections except `[db]` and `[source]` are optional and fall back to
//! defaults. [`load_config`] parses the file and rejects values the indexer
//! or search engine cannot work with.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where transcripts live and which files count as transcripts.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    /// Chunks per display page; page numbers advance every this many chunks.
    #[serde(default = "default_chunks_per_page")]
    pub chunks_per_page: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            chunks_per_page: default_chunks_per_page(),
        }
    }
}

fn default_max_tokens() -> usize {
    400
}
fn default_overlap() -> usize {
    50
}
fn default_chunks_per_page() -> usize {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_sidecar_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on chunks re-embedded by the backfill step of one pass.
    #[serde(default)]
    pub backfill_limit: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_sidecar_url(),
            timeout_secs: default_timeout_secs(),
            batch_size: default_batch_size(),
            backfill_limit: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_sidecar_url() -> String {
    "http://127.0.0.1:8765".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_batch_size() -> usize {
    32
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Minimum number of candidates pulled from each channel before fusion.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
    #[serde(default = "default_snippet_radius")]
    pub snippet_radius: usize,
    #[serde(default = "default_snippet_fallback")]
    pub snippet_fallback_chars: usize,
    #[serde(default = "default_highlight_open")]
    pub highlight_open: String,
    #[serde(default = "default_highlight_close")]
    pub highlight_close: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_k: default_candidate_k(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            snippet_radius: default_snippet_radius(),
            snippet_fallback_chars: default_snippet_fallback(),
            highlight_open: default_highlight_open(),
            highlight_close: default_highlight_close(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_candidate_k() -> i64 {
    100
}
fn default_limit() -> i64 {
    20
}
fn default_max_limit() -> i64 {
    100
}
fn default_snippet_radius() -> usize {
    120
}
fn default_snippet_fallback() -> usize {
    200
}
fn default_highlight_open() -> String {
    "<mark>".to_string()
}
fn default_highlight_close() -> String {
    "</mark>".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DisplayConfig {
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub index_on_startup: bool,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub lock_path: Option<PathBuf>,
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            index_on_startup: true,
            interval_secs: None,
            lock_path: None,
            stale_lock_secs: default_stale_lock_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_stale_lock_secs() -> u64 {
    6 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7330".to_string()
}

/// External archive generator, run after a pass that changed anything.
#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_archive_timeout")]
    pub timeout_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_archive_timeout(),
        }
    }
}

fn default_archive_timeout() -> u64 {
    300
}

impl Config {
    /// Path of the on-disk indexing lock.
    pub fn lock_path(&self) -> PathBuf {
        match &self.scheduler.lock_path {
            Some(p) => p.clone(),
            None => {
                let mut name = self.db.path.as_os_str().to_owned();
                name.push(".lock");
                PathBuf::from(name)
            }
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }
    if config.chunking.chunks_per_page == 0 {
        anyhow::bail!("chunking.chunks_per_page must be > 0");
    }

    if config.retrieval.rrf_k <= 0.0 {
        anyhow::bail!("retrieval.rrf_k must be > 0");
    }
    if config.retrieval.default_limit < 1 || config.retrieval.max_limit < 1 {
        anyhow::bail!("retrieval.default_limit and retrieval.max_limit must be >= 1");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "sidecar" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or sidecar.",
            other
        ),
    }

    if let Some(cmd) = &config.archive.command {
        if cmd.is_empty() {
            anyhow::bail!("archive.command must not be an empty list");
        }
    }

    Ok(config)
}
