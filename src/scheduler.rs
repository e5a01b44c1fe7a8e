//! Background indexing scheduler.
//!
//! Runs indexing passes off the serving path. At most one pass runs at a
//! time: an in-process flag rejects overlapping triggers and the on-disk
//! [`IndexLock`] keeps other processes out. Queries never wait on a pass;
//! they read the last committed state through WAL.
//!
//! Pass results and failures are recorded in [`IndexStatus`] rather than
//! propagated to callers of [`IndexScheduler::trigger`].

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::archive::run_archive;
use crate::config::{ArchiveConfig, Config};
use crate::embedding::{Embedder, SidecarHealth};
use crate::ingest::{IndexStats, Indexer};
use crate::lock::{read_lock, IndexLock};
use crate::store::{Storage, StoreCounts};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStatus {
    pub running: bool,
    pub last_started_at: Option<String>,
    pub last_finished_at: Option<String>,
    pub last_stats: Option<IndexStats>,
    pub last_error: Option<String>,
    pub archive_error: Option<String>,
    pub passes_completed: u64,
    pub counts: StoreCounts,
    pub sidecar: Option<SidecarHealth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    Completed,
    /// A pass was already running in this process.
    AlreadyRunning,
    /// Another live process holds the on-disk lock.
    LockedElsewhere,
}

/// Clears the running flag when a pass ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct IndexScheduler {
    indexer: Indexer,
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    source_root: PathBuf,
    lock_path: PathBuf,
    stale_lock_after: Duration,
    archive: ArchiveConfig,
    running: Arc<AtomicBool>,
    status: RwLock<IndexStatus>,
}

impl IndexScheduler {
    pub fn new(config: &Config, storage: Storage, embedder: Arc<dyn Embedder>) -> Arc<Self> {
        Arc::new(Self {
            indexer: Indexer::new(config, storage.clone(), embedder.clone()),
            storage,
            embedder,
            source_root: config.source.root.clone(),
            lock_path: config.lock_path(),
            stale_lock_after: Duration::from_secs(config.scheduler.stale_lock_secs),
            archive: config.archive.clone(),
            running: Arc::new(AtomicBool::new(false)),
            status: RwLock::new(IndexStatus::default()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard(self.running.clone()))
    }

    /// Start a pass in the background. Returns false if one is running.
    pub fn trigger(self: &Arc<Self>) -> bool {
        let Some(guard) = self.begin() else {
            return false;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_guarded(guard).await {
                tracing::error!(error = %e, "index pass failed");
            }
        });
        true
    }

    /// Run a pass in the foreground.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let Some(guard) = self.begin() else {
            return Ok(PassOutcome::AlreadyRunning);
        };
        self.run_guarded(guard).await
    }

    /// Trigger a pass every `every`, starting one interval from now.
    pub fn spawn_periodic(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !this.trigger() {
                    tracing::debug!("periodic pass skipped; previous pass still running");
                }
            }
        })
    }

    async fn run_guarded(&self, _guard: RunningGuard) -> Result<PassOutcome> {
        let lock_path = self.lock_path.clone();
        let max_age = self.stale_lock_after;
        let acquired = tokio::task::spawn_blocking(move || IndexLock::acquire(&lock_path, max_age))
            .await
            .context("Lock task failed")
            .and_then(|r| r);
        let lock = match acquired {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                let holder = read_lock(&self.lock_path).ok().flatten();
                let message = match holder {
                    Some(info) => format!("index lock held by pid {}", info.pid),
                    None => "index lock held by another process".to_string(),
                };
                tracing::info!("{}", message);
                self.status.write().await.last_error = Some(message);
                return Ok(PassOutcome::LockedElsewhere);
            }
            Err(e) => {
                self.status.write().await.last_error = Some(format!("{:#}", e));
                return Err(e);
            }
        };

        {
            let mut status = self.status.write().await;
            status.running = true;
            status.last_started_at = Some(chrono::Utc::now().to_rfc3339());
        }

        let result = self.indexer.run_index(&self.source_root).await;

        let archive_error = match &result {
            Ok(stats) if stats.changed_anything() => run_archive(&self.archive, &self.source_root)
                .await
                .err()
                .map(|e| {
                    tracing::warn!(error = %e, "archive generator failed");
                    format!("{:#}", e)
                }),
            _ => None,
        };
        drop(lock);

        let counts = self.storage.counts().await.unwrap_or_default();
        let mut status = self.status.write().await;
        status.running = false;
        status.last_finished_at = Some(chrono::Utc::now().to_rfc3339());
        status.counts = counts;
        match result {
            Ok(stats) => {
                status.passes_completed += 1;
                status.last_stats = Some(stats);
                status.last_error = None;
                status.archive_error = archive_error;
                Ok(PassOutcome::Completed)
            }
            Err(e) => {
                status.last_error = Some(format!("{:#}", e));
                Err(e)
            }
        }
    }

    /// Snapshot of the status with live counts and sidecar health.
    pub async fn status(&self) -> IndexStatus {
        let mut status = self.status.read().await.clone();
        status.running = self.is_running();
        match self.storage.counts().await {
            Ok(counts) => status.counts = counts,
            Err(e) => tracing::warn!(error = %e, "failed to read index counts"),
        }
        status.sidecar = Some(self.embedder.health().await);
        status
    }
}
