//! External archive generator hook.
//!
//! After a pass that changed the index, the configured command is spawned
//! with the source root as its working directory. Its failure never fails
//! the pass; the scheduler records the message in status instead.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::config::ArchiveConfig;

/// Run the archive command, if one is configured. Returns whether it ran.
pub async fn run_archive(config: &ArchiveConfig, source_root: &Path) -> Result<bool> {
    let Some(argv) = config.command.as_ref().filter(|a| !a.is_empty()) else {
        return Ok(false);
    };

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(source_root)
        .kill_on_drop(true);

    tracing::info!(command = %argv.join(" "), "running archive generator");
    let output = tokio::time::timeout(Duration::from_secs(config.timeout_secs), cmd.output())
        .await
        .with_context(|| format!("archive command timed out after {}s", config.timeout_secs))?
        .with_context(|| format!("Failed to spawn archive command: {}", argv[0]))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "archive command exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }
    Ok(true)
}
