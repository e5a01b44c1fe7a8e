use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use transcript_search::config::{parse_config, Config};
use transcript_search::embedding::{BatchOutcome, EmbedOutcome, Embedder, SidecarHealth};
use transcript_search::ingest::Indexer;
use transcript_search::models::Role;
use transcript_search::scanner::SourceScanner;
use transcript_search::scheduler::{IndexScheduler, PassOutcome};
use transcript_search::search::{SearchEngine, SearchFilters, SearchMode, SearchRequest};
use transcript_search::store::Storage;

// ============ Deterministic embedder ============

struct FakeState {
    model: String,
    dim: usize,
    available: bool,
}

/// Bag-of-words hashing embedder whose model and availability can be
/// switched mid-test.
struct FakeEmbedder {
    state: Mutex<FakeState>,
}

impl FakeEmbedder {
    fn new(model: &str, dim: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                model: model.to_string(),
                dim,
                available: true,
            }),
        })
    }

    fn set_model(&self, model: &str, dim: usize) {
        let mut s = self.state.lock().unwrap();
        s.model = model.to_string();
        s.dim = dim;
    }

    fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    fn vectorize(text: &str, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % dim as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn health(&self) -> SidecarHealth {
        let s = self.state.lock().unwrap();
        if s.available {
            SidecarHealth::Available {
                model: s.model.clone(),
                dim: s.dim,
            }
        } else {
            SidecarHealth::Unavailable {
                reason: "fake sidecar down".to_string(),
            }
        }
    }

    async fn embed(&self, text: &str) -> EmbedOutcome {
        let (available, dim) = {
            let s = self.state.lock().unwrap();
            (s.available, s.dim)
        };
        if !available {
            return EmbedOutcome::Unavailable("fake sidecar down".to_string());
        }
        EmbedOutcome::Embedded(Self::vectorize(text, dim))
    }

    async fn embed_batch(&self, texts: &[String]) -> BatchOutcome {
        let (available, dim) = {
            let s = self.state.lock().unwrap();
            (s.available, s.dim)
        };
        if texts.is_empty() {
            return BatchOutcome::Embedded(Vec::new());
        }
        if !available {
            return BatchOutcome::Unavailable("fake sidecar down".to_string());
        }
        BatchOutcome::Embedded(texts.iter().map(|t| Self::vectorize(t, dim)).collect())
    }
}

// ============ Fixtures ============

struct Env {
    _tmp: TempDir,
    root: PathBuf,
    config: Config,
    storage: Storage,
    embedder: Arc<FakeEmbedder>,
}

impl Env {
    async fn new(extra_toml: &str) -> Self {
        Self::build("", extra_toml).await
    }

    async fn build(embedding_toml: &str, extra_toml: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("projects");
        fs::create_dir_all(&root).unwrap();

        let toml = format!(
            r#"
[db]
path = '{db}'

[source]
root = '{root}'

[chunking]
max_tokens = 50
overlap_tokens = 5
chunks_per_page = 2

[embedding]
provider = "sidecar"
batch_size = 4
{embedding}

[display]
base_url = "http://archive.local"

{extra}
"#,
            db = tmp.path().join("data/index.sqlite").display(),
            root = root.display(),
            embedding = embedding_toml,
            extra = extra_toml,
        );
        let config = parse_config(&toml).unwrap();
        let storage = Storage::open(&config.db.path).await.unwrap();

        Self {
            _tmp: tmp,
            root,
            config,
            storage,
            embedder: FakeEmbedder::new("mini-a", 16),
        }
    }

    fn indexer(&self) -> Indexer {
        Indexer::new(&self.config, self.storage.clone(), self.embedder.clone())
    }

    fn engine(&self) -> SearchEngine {
        SearchEngine::new(&self.config, self.storage.clone(), self.embedder.clone())
    }

    async fn index(&self) -> transcript_search::ingest::IndexStats {
        self.indexer().run_index(&self.root).await.unwrap()
    }

    fn write(&self, rel: &str, lines: &[String]) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    async fn search(&self, query: &str, filters: SearchFilters) -> transcript_search::search::SearchResponse {
        self.engine()
            .search(&SearchRequest {
                query: query.to_string(),
                filters,
                limit: None,
                offset: None,
            })
            .await
            .unwrap()
    }

    async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql)
            .fetch_one(self.storage.pool())
            .await
            .unwrap()
    }
}

fn user(text: &str, ts: &str) -> String {
    serde_json::json!({
        "type": "user",
        "timestamp": ts,
        "message": { "role": "user", "content": text }
    })
    .to_string()
}

fn assistant(text: &str, ts: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "timestamp": ts,
        "message": { "role": "assistant", "content": [{ "type": "text", "text": text }] }
    })
    .to_string()
}

fn bump_mtime(path: &Path) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
}

fn project(name: &str) -> SearchFilters {
    SearchFilters {
        project: Some(name.to_string()),
        ..Default::default()
    }
}

// ============ Tests ============

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let env = Env::new("").await;
    env.write(
        "webapp/s1.jsonl",
        &[
            user("How do I spawn an async task?", "2024-03-01T10:00:00Z"),
            assistant("Use tokio::spawn with an async block.", "2024-03-01T10:00:05Z"),
        ],
    );

    let first = env.index().await;
    assert_eq!(first.added, 1);
    assert_eq!(first.chunks, 2);
    assert_eq!(first.embedded, 2);
    assert!(first.errors.is_empty());

    let second = env.index().await;
    assert_eq!((second.added, second.modified, second.deleted), (0, 0, 0));

    let scanner = SourceScanner::new(&env.config.source).unwrap();
    let changes = scanner
        .detect_changes(&env.storage.indexed_files().await.unwrap())
        .unwrap();
    assert!(changes.is_empty());
}

#[tokio::test]
async fn test_empty_transcripts_are_remembered() {
    let env = Env::new("").await;
    env.write("webapp/real.jsonl", &[user("a real question", "2024-03-01T10:00:00Z")]);
    let summary = env.write(
        "webapp/summary-only.jsonl",
        &[serde_json::json!({ "type": "summary", "summary": "Earlier work" }).to_string()],
    );
    let tools = env.write(
        "webapp/tools-only.jsonl",
        &[serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": "t1", "content": "ok" }]
            }
        })
        .to_string()],
    );

    let first = env.index().await;
    assert_eq!((first.added, first.skipped), (1, 2));

    let second = env.index().await;
    assert_eq!((second.added, second.modified, second.skipped), (0, 0, 0));
    let scanner = SourceScanner::new(&env.config.source).unwrap();
    let changes = scanner
        .detect_changes(&env.storage.indexed_files().await.unwrap())
        .unwrap();
    assert!(changes.is_empty(), "{:?}", changes);

    // A skipped file that gains messages is indexed.
    fs::write(&summary, user("now with a message", "2024-03-02T10:00:00Z")).unwrap();
    bump_mtime(&summary);
    let third = env.index().await;
    assert_eq!(third.modified, 1);
    assert!(env.storage.get_conversation("summary-only").await.unwrap().is_some());

    // A skipped file that vanishes is forgotten.
    fs::remove_file(&tools).unwrap();
    env.index().await;
    let files = env.storage.indexed_files().await.unwrap();
    assert!(!files.contains_key(tools.to_str().unwrap()));
    assert_eq!(env.count("SELECT COUNT(*) FROM skipped_files").await, 0);
}

#[tokio::test]
async fn test_emptied_transcript_drops_its_conversation() {
    let env = Env::new("").await;
    let path = env.write("webapp/shrink.jsonl", &[user("about to vanish", "2024-03-01T10:00:00Z")]);
    env.index().await;

    fs::write(&path, "{\"type\":\"summary\"}").unwrap();
    bump_mtime(&path);
    let stats = env.index().await;
    assert_eq!(stats.skipped, 1);
    assert!(env.storage.get_conversation("shrink").await.unwrap().is_none());
    assert_eq!(env.count("SELECT COUNT(*) FROM chunks_fts").await, 0);

    let again = env.index().await;
    assert_eq!(again.skipped, 0);
}

#[tokio::test]
async fn test_touched_file_refreshes_stored_mtime() {
    let env = Env::new("").await;
    let path = env.write("webapp/touch.jsonl", &[user("unchanged content", "2024-03-01T10:00:00Z")]);
    env.index().await;

    bump_mtime(&path);
    let stats = env.index().await;
    assert_eq!((stats.added, stats.modified), (0, 0));

    let on_disk = transcript_search::scanner::system_time_millis(
        fs::metadata(&path).unwrap().modified().unwrap(),
    );
    let conversation = env.storage.get_conversation("touch").await.unwrap().unwrap();
    assert_eq!(conversation.source_mtime, on_disk);

    let scanner = SourceScanner::new(&env.config.source).unwrap();
    let changes = scanner
        .detect_changes(&env.storage.indexed_files().await.unwrap())
        .unwrap();
    assert!(changes.touched.is_empty());
}

#[tokio::test]
async fn test_short_terms_still_match() {
    let env = Env::new("").await;
    env.write(
        "webapp/lang.jsonl",
        &[
            user("Should the CLI be written in Go?", "2024-03-01T10:00:00Z"),
            assistant("Rust fits the UI layer better.", "2024-03-01T10:00:01Z"),
        ],
    );
    env.index().await;

    let lexical_only = SearchFilters {
        role: Some("user".to_string()),
        ..Default::default()
    };
    let response = env.search("go", lexical_only).await;
    assert_eq!(response.results.len(), 1);
    assert!(response.results[0].snippet.contains("<mark>Go</mark>"));

    let response = env.search("ui layer", SearchFilters::default()).await;
    assert!(response
        .results
        .iter()
        .any(|h| h.role == Role::Assistant && h.snippet.contains("<mark>UI</mark>")));
}

#[tokio::test]
async fn test_tool_use_blocks_are_not_indexed() {
    let env = Env::new("").await;
    let tool_use = serde_json::json!({
        "type": "assistant",
        "message": {
            "role": "assistant",
            "content": [
                { "type": "text", "text": "Running the formatter now." },
                { "type": "tool_use", "id": "t1", "name": "Bash", "input": { "command": "cargo fmt --secretflag" } }
            ]
        }
    })
    .to_string();
    env.write(
        "cli/tools.jsonl",
        &[user("Please format the code", "2024-03-02T09:00:00Z"), tool_use],
    );
    env.index().await;

    let chunks = env.storage.chunks_for_conversation("tools").await.unwrap();
    let roles: Vec<Role> = chunks.iter().map(|c| c.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(chunks[1].content, "Running the formatter now.");
    assert!(chunks.iter().all(|c| !c.content.contains("secretflag")));

    let hits = env
        .search(
            "secretflag",
            SearchFilters {
                role: Some("assistant".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(hits.results.iter().all(|h| !h.snippet.contains("secretflag")));
}

#[tokio::test]
async fn test_deleted_file_leaves_no_orphans() {
    let env = Env::new("").await;
    let path = env.write(
        "webapp/gone.jsonl",
        &[
            user("temporary question about lifetimes", "2024-03-01T10:00:00Z"),
            assistant("temporary answer about lifetimes", "2024-03-01T10:00:01Z"),
        ],
    );
    env.index().await;
    assert_eq!(env.count("SELECT COUNT(*) FROM chunk_vectors").await, 2);

    fs::remove_file(&path).unwrap();
    let stats = env.index().await;
    assert_eq!(stats.deleted, 1);

    assert_eq!(env.count("SELECT COUNT(*) FROM conversations").await, 0);
    assert_eq!(env.count("SELECT COUNT(*) FROM chunks").await, 0);
    assert_eq!(env.count("SELECT COUNT(*) FROM chunks_fts").await, 0);
    assert_eq!(env.count("SELECT COUNT(*) FROM chunk_vectors").await, 0);
}

#[tokio::test]
async fn test_modified_file_is_reindexed_with_dense_ordinals() {
    let env = Env::new("").await;
    let long = "word ".repeat(120);
    let path = env.write(
        "webapp/edit.jsonl",
        &[user(&long, "2024-03-01T10:00:00Z"), assistant("short reply", "2024-03-01T10:00:01Z")],
    );
    let first = env.index().await;
    assert!(first.chunks > 2);

    fs::write(&path, user("rewritten conversation about borrowck", "2024-03-01T10:00:00Z")).unwrap();
    bump_mtime(&path);
    let second = env.index().await;
    assert_eq!(second.modified, 1);

    let chunks = env.storage.chunks_for_conversation("edit").await.unwrap();
    let ordinals: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(ordinals, vec![0]);
    assert_eq!(env.count("SELECT COUNT(*) FROM chunks_fts").await, 1);
    assert_eq!(env.count("SELECT COUNT(*) FROM chunk_vectors").await, 1);
}

#[tokio::test]
async fn test_pages_advance_with_chunk_stride() {
    let env = Env::new("").await;
    let lines: Vec<String> = (0..5)
        .map(|i| user(&format!("message number {}", i), "2024-03-01T10:00:00Z"))
        .collect();
    env.write("webapp/paged.jsonl", &lines);
    env.index().await;

    let pages: Vec<Option<i64>> = env
        .storage
        .chunks_for_conversation("paged")
        .await
        .unwrap()
        .iter()
        .map(|c| c.page_number)
        .collect();
    assert_eq!(pages, vec![Some(1), Some(1), Some(2), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_role_and_project_filters() {
    let env = Env::new("").await;
    env.write(
        "webapp/a.jsonl",
        &[
            user("is async fn in traits stable?", "2024-03-01T10:00:00Z"),
            assistant("Yes, async fn in traits is stable since 1.75.", "2024-03-01T10:00:01Z"),
        ],
    );
    env.index().await;

    let response = env
        .search(
            "\"async\"",
            SearchFilters {
                role: Some("assistant".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|h| h.role == Role::Assistant));
    assert!(response.results[0].snippet.contains("<mark>async</mark>"));
    assert!(response.results[0]
        .url
        .starts_with("http://archive.local/webapp/a/page-"));

    let response = env.search("async", project("no-such-project")).await;
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_user_input_never_errors() {
    let env = Env::new("").await;
    env.write(
        "webapp/ops.jsonl",
        &[assistant("the tokio runtime spawns tasks", "2024-03-01T10:00:00Z")],
    );
    env.index().await;

    for query in [
        "tokio AND",
        "NOT tokio",
        "\"tokio",
        "tokio*",
        "(tokio) OR (runtime)",
        "tokio: runtime^",
    ] {
        let response = env.search(query, SearchFilters::default()).await;
        assert_eq!(response.results.len(), 1, "query {:?}", query);
    }

    let response = env.search("AND OR NOT", SearchFilters::default()).await;
    assert!(response.results.is_empty());

    let negative = env
        .engine()
        .search(&SearchRequest {
            query: "tokio".to_string(),
            limit: Some(-1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(negative.is_empty());

    let bad_role = env
        .search(
            "tokio",
            SearchFilters {
                role: Some("system".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(bad_role.results.is_empty());
}

#[tokio::test]
async fn test_empty_query_lists_recent_conversations() {
    let env = Env::new("").await;
    env.write("alpha/old.jsonl", &[user("older chat", "2024-01-01T00:00:00Z")]);
    env.write("alpha/new.jsonl", &[user("newer chat", "2024-02-01T00:00:00Z")]);
    env.write("beta/other.jsonl", &[user("beta chat", "2024-03-01T00:00:00Z")]);
    env.index().await;

    let response = env.search("   ", project("alpha")).await;
    assert_eq!(response.mode, SearchMode::Recent);
    assert!(response.results.is_empty());
    let ids: Vec<&str> = response.conversations.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "old"]);
    assert_eq!(response.conversations[0].title, "newer chat");
}

#[tokio::test]
async fn test_date_bounds_are_inclusive() {
    let env = Env::new("").await;
    env.write("p/jan.jsonl", &[user("release planning", "2024-01-15T12:00:00Z")]);
    env.write("p/feb.jsonl", &[user("release retro", "2024-02-15T12:00:00Z")]);
    env.index().await;

    let response = env
        .search(
            "release",
            SearchFilters {
                after: Some("2024-01-15".to_string()),
                before: Some("2024-01-15".to_string()),
                ..Default::default()
            },
        )
        .await;
    let ids: Vec<&str> = response.results.iter().map(|h| h.conversation_id.as_str()).collect();
    assert_eq!(ids, vec!["jan"]);
}

#[tokio::test]
async fn test_hybrid_search_when_vectors_are_trusted() {
    let env = Env::new("").await;
    env.write(
        "webapp/h.jsonl",
        &[
            user("explain the borrow checker", "2024-03-01T10:00:00Z"),
            assistant("the borrow checker enforces aliasing rules", "2024-03-01T10:00:01Z"),
        ],
    );
    env.index().await;

    let response = env.search("borrow checker", SearchFilters::default()).await;
    assert_eq!(response.mode, SearchMode::Hybrid);
    assert!(!response.degraded);
    assert!(!response.results.is_empty());
    // Fused scores are sums of 1/(k+rank) terms.
    assert!(response.results[0].score <= 2.0 / 60.0 + 1e-9);
}

#[tokio::test]
async fn test_sidecar_outage_degrades_then_backfills() {
    let env = Env::new("").await;
    env.embedder.set_available(false);
    env.write(
        "webapp/down.jsonl",
        &[user("indexing while the sidecar is down", "2024-03-01T10:00:00Z")],
    );
    let stats = env.index().await;
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.embedded, 0);
    assert_eq!(env.count("SELECT COUNT(*) FROM chunks WHERE embedding IS NULL").await, 1);

    let response = env.search("sidecar", SearchFilters::default()).await;
    assert_eq!(response.mode, SearchMode::Lexical);
    assert!(response.degraded);
    assert_eq!(response.results.len(), 1);

    env.embedder.set_available(true);
    let stats = env.index().await;
    assert_eq!(stats.reembedded, 1);
    assert_eq!(env.count("SELECT COUNT(*) FROM chunk_vectors").await, 1);

    let response = env.search("sidecar", SearchFilters::default()).await;
    assert_eq!(response.mode, SearchMode::Hybrid);
}

#[tokio::test]
async fn test_model_change_refuses_vectors_until_reembedded() {
    let env = Env::new("").await;
    env.write(
        "webapp/m.jsonl",
        &[
            user("vectors built with the first model", "2024-03-01T10:00:00Z"),
            assistant("more vectors from the first model", "2024-03-01T10:00:01Z"),
        ],
    );
    env.index().await;

    env.embedder.set_model("large-b", 32);
    let response = env.search("vectors", SearchFilters::default()).await;
    assert_eq!(response.mode, SearchMode::Lexical);
    assert!(response.degraded);
    assert!(response
        .degraded_reason
        .as_deref()
        .unwrap()
        .starts_with("model_mismatch"));

    let stats = env.index().await;
    assert_eq!(stats.invalidated, 2);
    assert_eq!(stats.reembedded, 2);
    assert!(!env.storage.embeddings_stale().await.unwrap());
    assert_eq!(
        env.count("SELECT COUNT(*) FROM chunk_vectors WHERE dims = 32").await,
        2
    );

    let response = env.search("vectors", SearchFilters::default()).await;
    assert_eq!(response.mode, SearchMode::Hybrid);
}

#[tokio::test]
async fn test_partial_backfill_keeps_stale_flag() {
    let env = Env::build("backfill_limit = 1", "").await;
    env.write(
        "webapp/s.jsonl",
        &[
            user("first stale chunk", "2024-03-01T10:00:00Z"),
            assistant("second stale chunk", "2024-03-01T10:00:01Z"),
        ],
    );
    env.index().await;

    env.embedder.set_model("large-b", 32);
    let stats = env.index().await;
    assert_eq!(stats.reembedded, 1);
    assert!(env.storage.embeddings_stale().await.unwrap());

    let response = env.search("stale", SearchFilters::default()).await;
    assert_eq!(response.degraded_reason.as_deref(), Some("stale_embeddings"));

    env.index().await;
    assert!(!env.storage.embeddings_stale().await.unwrap());
}

#[tokio::test]
async fn test_per_file_errors_do_not_abort_the_pass() {
    let env = Env::new("").await;
    env.write("alpha/dup.jsonl", &[user("first copy", "2024-03-01T10:00:00Z")]);
    env.write("beta/dup.jsonl", &[user("second copy", "2024-03-01T10:00:00Z")]);
    env.write(
        "beta/fine.jsonl",
        &["{broken json".to_string(), user("still indexed", "2024-03-01T10:00:00Z")],
    );
    env.write("beta/empty.jsonl", &["{\"type\":\"summary\"}".to_string()]);

    let stats = env.index().await;
    assert_eq!(stats.errors.len(), 1);
    assert!(stats.errors[0].message.contains("already belongs to"));
    assert_eq!(stats.added, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.malformed_lines, 1);
    assert!(env.storage.get_conversation("fine").await.unwrap().is_some());
}

#[tokio::test]
async fn test_scheduler_records_status_and_respects_foreign_lock() {
    let env = Env::new("").await;
    env.write("p/one.jsonl", &[user("scheduled pass", "2024-03-01T10:00:00Z")]);

    let scheduler = IndexScheduler::new(&env.config, env.storage.clone(), env.embedder.clone());
    assert_eq!(scheduler.run_pass().await.unwrap(), PassOutcome::Completed);

    let status = scheduler.status().await;
    assert!(!status.running);
    assert_eq!(status.passes_completed, 1);
    assert_eq!(status.counts.conversations, 1);
    assert_eq!(status.last_stats.as_ref().unwrap().added, 1);
    assert!(status.sidecar.unwrap().is_available());
    assert!(!env.config.lock_path().exists());

    // pid 1 is alive, so a fresh lock owned by it blocks the pass.
    fs::write(
        env.config.lock_path(),
        serde_json::json!({ "pid": 1, "acquired_at": chrono::Utc::now().timestamp() }).to_string(),
    )
    .unwrap();
    assert_eq!(
        scheduler.run_pass().await.unwrap(),
        PassOutcome::LockedElsewhere
    );
    let status = scheduler.status().await;
    assert!(status.last_error.unwrap().contains("pid 1"));
    assert_eq!(status.passes_completed, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_archive_runs_only_after_changes() {
    let env = Env::new("[archive]\ncommand = [\"sh\", \"-c\", \"echo run >> ../archive.log\"]\n").await;
    env.write("p/a.jsonl", &[user("archive me", "2024-03-01T10:00:00Z")]);

    let scheduler = IndexScheduler::new(&env.config, env.storage.clone(), env.embedder.clone());
    scheduler.run_pass().await.unwrap();
    scheduler.run_pass().await.unwrap();

    let log = fs::read_to_string(env.root.parent().unwrap().join("archive.log")).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(scheduler.status().await.archive_error.is_none());
}
