//! # Transcript Search
//!
//! Incremental indexing and hybrid retrieval over a directory of JSONL
//! conversation transcripts.
//!
//! Transcripts are parsed into role-tagged messages, chunked, optionally
//! embedded by a local sidecar, and stored in SQLite with two secondary
//! indexes kept in lockstep: an FTS5 trigram index for substring matches and
//! a vector table for cosine similarity. Queries run both channels under the
//! same filters and merge them with Reciprocal Rank Fusion, degrading to
//! lexical-only results (and saying so) whenever vectors cannot be trusted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────┐   ┌────────────┐
//! │ Scanner  │──▶│  Parser  │──▶│ Chunker │──▶│  Embedder  │
//! │ (diff)   │   │ (JSONL)  │   │         │   │ (sidecar)  │
//! └──────────┘   └──────────┘   └─────────┘   └─────┬──────┘
//!                                                   ▼
//!                ┌──────────────┐            ┌────────────┐
//!                │ SearchEngine │◀───────────│  Storage   │
//!                │  (RRF merge) │            │ FTS5 + vec │
//!                └──────┬───────┘            └────────────┘
//!                       ▼
//!                ┌──────────────┐
//!                │  HTTP / CLI  │
//!                └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`scanner`] | Source walk and change detection |
//! | [`transcript`] | JSONL transcript parsing |
//! | [`chunk`] | Boundary-aware chunking |
//! | [`embedding`] | Embedding sidecar client |
//! | [`store`] | SQLite storage with index mirroring |
//! | [`ingest`] | Indexing pass orchestration |
//! | [`search`] | Hybrid search and RRF |
//! | [`snippet`] | Snippets and highlighting |
//! | [`lock`] | Cross-process indexing lock |
//! | [`scheduler`] | Background passes and status |
//! | [`archive`] | Archive generator hook |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod archive;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod lock;
pub mod migrate;
pub mod models;
pub mod scanner;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod snippet;
pub mod store;
pub mod transcript;
