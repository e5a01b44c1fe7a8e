//! Source tree scanning and change detection.
//!
//! Walks the transcript root with `walkdir`, filters paths through include
//! and exclude glob sets, and diffs the result against what the
//! conversations table already holds.
//!
//! Modification is decided in three tiers, cheapest first: path presence,
//! then mtime (a `stat`), then a SHA-256 of the contents only when the mtime
//! moved. A touched-but-identical file is therefore not reindexed; it is
//! reported as touched so its stored mtime can catch up.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::models::{ChangeSet, IndexedFile};

pub struct SourceScanner {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl SourceScanner {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut excludes = vec!["**/.git/**".to_string(), "**/node_modules/**".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            root: config.root.clone(),
            include,
            exclude,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All transcript files under the root, sorted.
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            bail!("Source root does not exist: {}", self.root.display());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            if self.exclude.is_match(relative) || !self.include.is_match(relative) {
                continue;
            }
            files.push(path.to_path_buf());
        }

        files.sort();
        Ok(files)
    }

    /// Diff the source tree against `indexed` (keyed by stored file path).
    pub fn detect_changes(&self, indexed: &HashMap<String, IndexedFile>) -> Result<ChangeSet> {
        let files = self.list_files()?;
        let current: HashSet<String> = files.iter().map(|p| path_key(p)).collect();

        let mut changes = ChangeSet::default();

        let mut tombstones: Vec<&String> = indexed
            .keys()
            .filter(|path| !current.contains(*path) && !Path::new(path.as_str()).exists())
            .collect();
        tombstones.sort();
        for path in tombstones {
            match &indexed[path].conversation_id {
                Some(id) => changes.deleted.push(id.clone()),
                None => changes.forgotten.push(path.clone()),
            }
        }

        for path in files {
            let key = path_key(&path);
            let Some(known) = indexed.get(&key) else {
                changes.added.push(path);
                continue;
            };

            let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => system_time_millis(t),
                Err(_) => {
                    // Let the pipeline surface the I/O error for this file.
                    changes.modified.push(path);
                    continue;
                }
            };
            if mtime == known.source_mtime {
                continue;
            }

            match hash_file(&path) {
                Ok(hash) if hash == known.content_hash => changes.touched.push((key, mtime)),
                _ => changes.modified.push(path),
            }
        }

        Ok(changes)
    }
}

/// Key under which a path is stored in `conversations.file_path`.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub fn system_time_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn hash_file(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hash_bytes(&bytes))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scanner_for(root: &Path) -> SourceScanner {
        SourceScanner::new(&SourceConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.jsonl".to_string()],
            exclude_globs: vec!["**/skip/**".to_string()],
            follow_symlinks: false,
        })
        .unwrap()
    }

    fn indexed_entry(path: &Path, id: Option<&str>) -> (String, IndexedFile) {
        let mtime = system_time_millis(fs::metadata(path).unwrap().modified().unwrap());
        (
            path_key(path),
            IndexedFile {
                conversation_id: id.map(str::to_string),
                source_mtime: mtime,
                content_hash: hash_file(path).unwrap(),
            },
        )
    }

    #[test]
    fn test_list_files_applies_globs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("proj/skip")).unwrap();
        fs::write(root.join("proj/a.jsonl"), "{}").unwrap();
        fs::write(root.join("proj/notes.md"), "x").unwrap();
        fs::write(root.join("proj/skip/b.jsonl"), "{}").unwrap();

        let files = scanner_for(root).list_files().unwrap();
        assert_eq!(files, vec![root.join("proj/a.jsonl")]);
    }

    #[test]
    fn test_added_modified_deleted() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let kept = root.join("kept.jsonl");
        let edited = root.join("edited.jsonl");
        let new = root.join("new.jsonl");
        fs::write(&kept, "same").unwrap();
        fs::write(&edited, "before").unwrap();

        let mut indexed: HashMap<String, IndexedFile> = HashMap::new();
        indexed.extend([
            indexed_entry(&kept, Some("kept")),
            indexed_entry(&edited, Some("edited")),
        ]);
        indexed.insert(
            path_key(&root.join("gone.jsonl")),
            IndexedFile {
                conversation_id: Some("gone".to_string()),
                source_mtime: 0,
                content_hash: String::new(),
            },
        );

        fs::write(&edited, "after, with more content").unwrap();
        indexed.get_mut(&path_key(&edited)).unwrap().source_mtime -= 10_000;
        fs::write(&new, "fresh").unwrap();

        let changes = scanner_for(root).detect_changes(&indexed).unwrap();
        assert_eq!(changes.added, vec![new]);
        assert_eq!(changes.modified, vec![edited]);
        assert_eq!(changes.deleted, vec!["gone".to_string()]);
    }

    #[test]
    fn test_touch_without_edit_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.jsonl");
        fs::write(&path, "content").unwrap();

        let (key, mut entry) = indexed_entry(&path, Some("t"));
        let actual_mtime = entry.source_mtime;
        // Stored mtime differs, hash is identical.
        entry.source_mtime -= 5_000;
        let indexed = HashMap::from([(key.clone(), entry)]);

        let changes = scanner_for(tmp.path()).detect_changes(&indexed).unwrap();
        assert!(changes.added.is_empty() && changes.modified.is_empty());
        assert_eq!(changes.touched, vec![(key, actual_mtime)]);
    }

    #[test]
    fn test_excluded_but_present_file_is_not_tombstoned() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("skip")).unwrap();
        let path = tmp.path().join("skip/c.jsonl");
        fs::write(&path, "x").unwrap();
        let indexed = HashMap::from([indexed_entry(&path, Some("c"))]);

        let changes = scanner_for(tmp.path()).detect_changes(&indexed).unwrap();
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn test_vanished_empty_file_is_forgotten() {
        let tmp = TempDir::new().unwrap();
        let kept = tmp.path().join("summary.jsonl");
        fs::write(&kept, "{\"type\":\"summary\"}").unwrap();
        let gone = path_key(&tmp.path().join("gone-summary.jsonl"));

        let mut indexed = HashMap::from([indexed_entry(&kept, None)]);
        indexed.insert(
            gone.clone(),
            IndexedFile {
                conversation_id: None,
                source_mtime: 0,
                content_hash: String::new(),
            },
        );

        let changes = scanner_for(tmp.path()).detect_changes(&indexed).unwrap();
        assert!(changes.added.is_empty());
        assert!(changes.deleted.is_empty());
        assert_eq!(changes.forgotten, vec![gone]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let scanner = scanner_for(&tmp.path().join("nope"));
        assert!(scanner.detect_changes(&HashMap::new()).is_err());
    }
}
