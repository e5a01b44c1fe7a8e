//! Embedding sidecar client and vector utilities.
//!
//! Defines the [`Embedder`] trait and its implementations:
//! - **[`DisabledEmbedder`]**: always unavailable; used when
//!   `embedding.provider = "disabled"`.
//! - **[`SidecarClient`]**: talks to a local embedding sidecar over loopback
//!   HTTP with a per-call timeout.
//!
//! Embedding is best-effort. No method returns an error: transport failures,
//! non-success statuses and malformed bodies all become an `Unavailable`
//! variant carrying the reason, and callers degrade instead of aborting.
//!
//! # Sidecar Protocol
//!
//! | Method | Path | Body | Response |
//! |--------|------|------|----------|
//! | `GET`  | `/health` | | `{ "model": str, "dim": int }` |
//! | `POST` | `/embed` | `{ "text": str }` | `{ "embedding": [f32], "tokens": int }` |
//! | `POST` | `/embed_batch` | `{ "texts": [str] }` | `{ "embeddings": [[f32]] }` |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Sidecar reachability plus the model identity it reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SidecarHealth {
    Available { model: String, dim: usize },
    Unavailable { reason: String },
}

impl SidecarHealth {
    pub fn is_available(&self) -> bool {
        matches!(self, SidecarHealth::Available { .. })
    }

    /// `(model, dim)` when available.
    pub fn identity(&self) -> Option<(&str, usize)> {
        match self {
            SidecarHealth::Available { model, dim } => Some((model.as_str(), *dim)),
            SidecarHealth::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmbedOutcome {
    Embedded(Vec<f32>),
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// One vector per input text, in input order.
    Embedded(Vec<Vec<f32>>),
    Unavailable(String),
}

/// Capability interface for producing embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn health(&self) -> SidecarHealth;
    async fn embed(&self, text: &str) -> EmbedOutcome;
    async fn embed_batch(&self, texts: &[String]) -> BatchOutcome;
}

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn health(&self) -> SidecarHealth {
        SidecarHealth::Unavailable {
            reason: "embedding provider is disabled".to_string(),
        }
    }

    async fn embed(&self, _text: &str) -> EmbedOutcome {
        EmbedOutcome::Unavailable("embedding provider is disabled".to_string())
    }

    async fn embed_batch(&self, texts: &[String]) -> BatchOutcome {
        if texts.is_empty() {
            return BatchOutcome::Embedded(Vec::new());
        }
        BatchOutcome::Unavailable("embedding provider is disabled".to_string())
    }
}

// ============ HTTP sidecar ============

/// Client for the embedding sidecar.
pub struct SidecarClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct HealthBody {
    model: String,
    dim: usize,
}

#[derive(Deserialize)]
struct EmbedBody {
    embedding: Vec<f32>,
    #[serde(default)]
    #[allow(dead_code)]
    tokens: Option<u64>,
}

#[derive(Deserialize)]
struct BatchBody {
    embeddings: Vec<Vec<f32>>,
}

impl SidecarClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn try_health(&self) -> Result<HealthBody> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("sidecar /health returned {}", status);
        }
        let body: HealthBody = resp.json().await?;
        if body.dim == 0 {
            bail!("sidecar reported dim = 0");
        }
        Ok(body)
    }

    async fn try_embed(&self, text: &str) -> Result<Vec<f32>> {
        let resp = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("sidecar /embed returned {}", status);
        }
        let body: EmbedBody = resp.json().await?;
        if body.embedding.is_empty() {
            bail!("sidecar returned an empty embedding");
        }
        Ok(body.embedding)
    }

    async fn try_embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let resp = self
            .client
            .post(format!("{}/embed_batch", self.base_url))
            .json(&serde_json::json!({ "texts": texts }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("sidecar /embed_batch returned {}", status);
        }
        let body: BatchBody = resp.json().await?;
        if body.embeddings.len() != texts.len() {
            bail!(
                "sidecar returned {} embeddings for {} texts",
                body.embeddings.len(),
                texts.len()
            );
        }
        Ok(body.embeddings)
    }
}

#[async_trait]
impl Embedder for SidecarClient {
    async fn health(&self) -> SidecarHealth {
        match self.try_health().await {
            Ok(h) => SidecarHealth::Available {
                model: h.model,
                dim: h.dim,
            },
            Err(e) => SidecarHealth::Unavailable {
                reason: format!("{:#}", e),
            },
        }
    }

    async fn embed(&self, text: &str) -> EmbedOutcome {
        match self.try_embed(text).await {
            Ok(v) => EmbedOutcome::Embedded(v),
            Err(e) => EmbedOutcome::Unavailable(format!("{:#}", e)),
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> BatchOutcome {
        if texts.is_empty() {
            return BatchOutcome::Embedded(Vec::new());
        }
        match self.try_embed_batch(texts).await {
            Ok(v) => BatchOutcome::Embedded(v),
            Err(e) => BatchOutcome::Unavailable(format!("{:#}", e)),
        }
    }
}

/// Create the configured [`Embedder`].
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "sidecar" => Ok(Arc::new(SidecarClient::new(
            &config.url,
            Duration::from_secs(config.timeout_secs),
        )?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
