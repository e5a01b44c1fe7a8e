//! # Transcript Search CLI (`tsearch`)
//!
//! ## Usage
//!
//! ```bash
//! tsearch --config ./config/tsearch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tsearch init` | Create the SQLite database and run schema migrations |
//! | `tsearch index` | Run one incremental indexing pass in the foreground |
//! | `tsearch search "<query>"` | Search indexed transcripts |
//! | `tsearch status` | Show index counts and sidecar state |
//! | `tsearch serve` | Start the HTTP server with background indexing |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use transcript_search::config::{load_config, Config};
use transcript_search::embedding::create_embedder;
use transcript_search::scheduler::{IndexScheduler, PassOutcome};
use transcript_search::search::{SearchEngine, SearchFilters, SearchMode, SearchRequest};
use transcript_search::server::{run_server, AppState};
use transcript_search::store::Storage;

/// Transcript Search: incremental hybrid search over conversation
/// transcripts.
#[derive(Parser)]
#[command(name = "tsearch", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tsearch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run one indexing pass over the source root.
    ///
    /// Takes the same on-disk lock as the server's background passes, so it
    /// refuses to run while another process is indexing.
    Index,

    /// Search indexed transcripts.
    ///
    /// An empty query lists the most recent conversations.
    Search {
        /// The search query.
        #[arg(default_value = "")]
        query: String,

        /// Only conversations from this project.
        #[arg(long)]
        project: Option<String>,

        /// Only chunks by this author (`user` or `assistant`).
        #[arg(long)]
        role: Option<String>,

        /// Conversations created on or after this date (YYYY-MM-DD).
        #[arg(long)]
        after: Option<String>,

        /// Conversations created on or before this date (YYYY-MM-DD).
        #[arg(long)]
        before: Option<String>,

        #[arg(long, allow_negative_numbers = true)]
        limit: Option<i64>,

        #[arg(long, allow_negative_numbers = true)]
        offset: Option<i64>,

        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics and embedding sidecar state.
    Status,

    /// Serve the HTTP API and run indexing in the background.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let storage = Storage::open(&config.db.path).await?;
            storage.close().await;
            println!("Database initialized at {}", config.db.path.display());
        }
        Commands::Index => run_index(&config).await?,
        Commands::Search {
            query,
            project,
            role,
            after,
            before,
            limit,
            offset,
            json,
        } => {
            let request = SearchRequest {
                query,
                filters: SearchFilters {
                    project,
                    role,
                    after,
                    before,
                },
                limit,
                offset,
            };
            run_search(&config, &request, json).await?;
        }
        Commands::Status => {
            let storage = Storage::open(&config.db.path).await?;
            let embedder = create_embedder(&config.embedding)?;
            let scheduler = IndexScheduler::new(&config, storage.clone(), embedder);
            let status = scheduler.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            storage.close().await;
        }
        Commands::Serve => run_serve(&config).await?,
    }

    Ok(())
}

async fn run_index(config: &Config) -> Result<()> {
    let storage = Storage::open(&config.db.path).await?;
    let embedder = create_embedder(&config.embedding)?;
    let scheduler = IndexScheduler::new(config, storage.clone(), embedder);

    let outcome = scheduler.run_pass().await;
    let status = scheduler.status().await;
    storage.close().await;

    match outcome? {
        PassOutcome::Completed => {}
        PassOutcome::AlreadyRunning | PassOutcome::LockedElsewhere => {
            bail!(
                "{}",
                status
                    .last_error
                    .unwrap_or_else(|| "an indexing pass is already running".to_string())
            );
        }
    }

    let Some(stats) = status.last_stats else {
        return Ok(());
    };
    println!("index {}", config.source.root.display());
    println!("  added: {}", stats.added);
    println!("  modified: {}", stats.modified);
    println!("  deleted: {}", stats.deleted);
    println!("  skipped (no messages): {}", stats.skipped);
    println!("  chunks written: {}", stats.chunks);
    if config.embedding.is_enabled() {
        println!("  embedded: {}", stats.embedded);
        println!("  backfilled: {}", stats.reembedded);
        if stats.invalidated > 0 {
            println!("  invalidated (model change): {}", stats.invalidated);
        }
    }
    if let Some(err) = &status.archive_error {
        println!("  archive: {}", err);
    }
    for e in &stats.errors {
        println!("  error: {}: {}", e.path, e.message);
    }
    println!("ok");
    Ok(())
}

async fn run_search(config: &Config, request: &SearchRequest, json: bool) -> Result<()> {
    let storage = Storage::open(&config.db.path).await?;
    let embedder = create_embedder(&config.embedding)?;
    let engine = SearchEngine::new(config, storage.clone(), embedder);
    let response = engine.search(request).await?;
    storage.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if let Some(reason) = &response.degraded_reason {
        eprintln!("note: lexical-only results ({})", reason);
    }
    if response.is_empty() {
        println!("No results.");
        return Ok(());
    }

    if response.mode == SearchMode::Recent {
        for (i, c) in response.conversations.iter().enumerate() {
            println!("{}. {} / {}", i + 1, c.project, c.title);
            println!("    created: {}", c.created_at);
            println!("    chunks: {}", c.chunk_count);
            println!("    url: {}", c.url);
            println!("    id: {}", c.id);
            println!();
        }
        return Ok(());
    }

    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} / {} ({})",
            i + 1,
            hit.score,
            hit.project,
            hit.title,
            hit.role
        );
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!("    url: {}", hit.url);
        println!("    chunk: {} in {}", hit.chunk_id, hit.conversation_id);
        println!();
    }
    Ok(())
}

async fn run_serve(config: &Config) -> Result<()> {
    let storage = Storage::open(&config.db.path).await?;
    let embedder = create_embedder(&config.embedding)?;
    let scheduler = IndexScheduler::new(config, storage.clone(), embedder.clone());
    let search = SearchEngine::new(config, storage, embedder);

    if config.scheduler.index_on_startup {
        scheduler.trigger();
    }
    if let Some(secs) = config.scheduler.interval_secs.filter(|s| *s > 0) {
        scheduler.spawn_periodic(Duration::from_secs(secs));
    }

    run_server(config, AppState { search, scheduler }).await
}
