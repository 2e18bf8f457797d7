use std::fs;
use std::path::{Path, PathBuf};

use code_recall::config::Config;
use code_recall::engine::Engine;
use code_recall::models::{LifecycleState, QueueStop};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use tempfile::TempDir;

const CONFIG_RS: &str = "pub fn parse_config(text: &str) -> Config {\n    toml::from_str(text).unwrap_or_default()\n}\n";

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.dir = tmp.path().join("db");
    // Timers stay out of the way; tests flush explicitly.
    config.watcher.debounce_ms = 60_000;
    config.watcher.embed_debounce_ms = 60_000;
    config
}

fn setup_project(tmp: &TempDir) -> PathBuf {
    let root = tmp.path().join("project");
    fs::create_dir_all(root.join("src/net")).unwrap();
    fs::create_dir_all(root.join("target/debug")).unwrap();
    fs::write(root.join("src/config.rs"), CONFIG_RS).unwrap();
    fs::write(
        root.join("src/net/socket.rs"),
        "pub fn open_socket(addr: &str) -> TcpStream {\n    TcpStream::connect(addr).expect(\"connect\")\n}\n",
    )
    .unwrap();
    fs::write(
        root.join("README.md"),
        "Project readme\nexplains how to build and run the server\n",
    )
    .unwrap();
    fs::write(root.join("target/debug/build.log"), "compiler output\n").unwrap();
    root
}

async fn indexed_engine(tmp: &TempDir) -> (Engine, PathBuf) {
    let root = setup_project(tmp);
    let engine = Engine::new(test_config(tmp)).unwrap();
    let status = engine.build_full_index("ws", &[root.clone()]).await.unwrap();
    assert_eq!(status.state, LifecycleState::Ready, "{:?}", status);
    (engine, root)
}

async fn raw_pool(path: &Path) -> SqlitePool {
    SqlitePool::connect_with(SqliteConnectOptions::new().filename(path).create_if_missing(true))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_full_index_then_query() {
    let tmp = TempDir::new().unwrap();
    let (engine, _root) = indexed_engine(&tmp).await;

    let status = engine.get_status("ws").await;
    assert_eq!(status.total_files, 3, "target/ is excluded");
    assert_eq!(status.indexed_files, 3);
    assert!(status.total_chunks >= 3);
    assert_eq!(status.embedded_chunks, status.total_chunks);
    assert!(status.last_full_scan_time.is_some());
    assert!(status.writable);

    let hits = engine.query_similar("ws", CONFIG_RS, 3).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].file_path.ends_with("/src/config.rs"), "{:?}", hits);
    assert!(hits[0].similarity > 0.99);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn test_pause_accumulates_and_resume_drains() {
    let tmp = TempDir::new().unwrap();
    let (engine, root) = indexed_engine(&tmp).await;

    let status = engine.pause("ws", Some("user request")).await.unwrap();
    assert!(status.paused);
    assert_eq!(status.paused_reason.as_deref(), Some("user request"));

    let changed = [
        root.join("src/config.rs"),
        root.join("src/net/socket.rs"),
        root.join("README.md"),
    ];
    for (i, path) in changed.iter().enumerate() {
        fs::write(path, format!("edited file number {}\n", i)).unwrap();
    }
    let paths: Vec<String> = changed.iter().map(|p| p.display().to_string()).collect();
    engine.notify_changed("ws", &paths);
    // Duplicate events collapse.
    engine.notify_changed("ws", &paths[..1]);
    assert_eq!(engine.pending_events("ws"), 3);

    // Writes are no-ops while paused.
    let flushed = engine.flush_pending("ws").await.unwrap();
    assert_eq!(flushed.reindexed, 0);
    let status = engine.index_paths("ws", &paths).await.unwrap();
    assert!(status.paused);
    assert_eq!(engine.pending_events("ws"), 3);

    let report = engine.resume("ws").await.unwrap();
    assert!(!report.status.paused);
    assert_eq!(report.drained.reindexed, 3);
    assert_eq!(report.drained.failed, 0);
    assert_eq!(engine.pending_events("ws"), 0);

    let embedded = engine.run_embedding_queue("ws").await.unwrap();
    assert_eq!(embedded.embedded, 3);
    let hits = engine.query_similar("ws", "edited file number 1", 1).await.unwrap();
    assert!(hits[0].file_path.ends_with("/src/net/socket.rs"), "{:?}", hits);
}

#[tokio::test]
async fn test_events_wait_for_first_full_scan() {
    let tmp = TempDir::new().unwrap();
    let root = setup_project(&tmp);
    let engine = Engine::new(test_config(&tmp)).unwrap();

    let early = vec![root.join("src/config.rs").display().to_string()];
    engine.notify_changed("ws", &early);
    let flushed = engine.flush_pending("ws").await.unwrap();
    assert_eq!(flushed.reindexed, 0);
    assert_eq!(engine.pending_events("ws"), 1);

    engine.build_full_index("ws", &[root]).await.unwrap();
    let flushed = engine.flush_pending("ws").await.unwrap();
    assert_eq!(flushed.skipped, 1, "already indexed by the scan");
    assert_eq!(engine.pending_events("ws"), 0);
}

#[tokio::test]
async fn test_deleted_file_is_soft_deleted() {
    let tmp = TempDir::new().unwrap();
    let (engine, root) = indexed_engine(&tmp).await;

    let gone = root.join("README.md");
    fs::remove_file(&gone).unwrap();
    engine.notify_deleted("ws", &[gone.display().to_string()]);
    let summary = engine.flush_pending("ws").await.unwrap();
    assert_eq!(summary.deleted, 1);

    let status = engine.get_status("ws").await;
    assert_eq!(status.total_files, 2);
    assert_eq!(status.embedded_chunks, status.total_chunks);
    let hits = engine.query_similar("ws", "Project readme", 10).await.unwrap();
    assert!(hits.iter().all(|h| !h.file_path.ends_with("README.md")));
}

#[tokio::test]
async fn test_failed_flush_keeps_events_pending() {
    let tmp = TempDir::new().unwrap();
    let (engine, root) = indexed_engine(&tmp).await;

    fs::remove_file(root.join("README.md")).unwrap();
    engine.notify_deleted("ws", &[root.join("README.md").display().to_string()]);
    engine.notify_changed("ws", &[root.join("src/config.rs").display().to_string()]);

    // Break the store underneath the engine so the first write fails.
    let pool = raw_pool(&engine.config().db.store_path("ws")).await;
    sqlx::query("DROP TABLE chunks").execute(&pool).await.unwrap();
    pool.close().await;

    let summary = engine.flush_pending("ws").await.unwrap();
    assert_eq!(summary.deleted, 0);
    assert_eq!(engine.pending_events("ws"), 2);
    let status = engine.get_status("ws").await;
    assert!(status.last_error_code.is_some(), "{:?}", status);
}

#[tokio::test]
async fn test_restored_file_is_chunked_again() {
    let tmp = TempDir::new().unwrap();
    let (engine, root) = indexed_engine(&tmp).await;
    let before = engine.get_status("ws").await;

    let readme = root.join("README.md");
    let content = fs::read(&readme).unwrap();
    fs::remove_file(&readme).unwrap();
    let status = engine.build_full_index("ws", &[root.clone()]).await.unwrap();
    assert_eq!(status.total_files, 2);
    assert!(status.total_chunks < before.total_chunks);

    // Same bytes as before the deletion.
    fs::write(&readme, content).unwrap();
    let status = engine.build_full_index("ws", &[root]).await.unwrap();
    assert_eq!(status.state, LifecycleState::Ready);
    assert_eq!(status.total_files, 3);
    assert_eq!(status.indexed_files, 3);
    assert_eq!(status.total_chunks, before.total_chunks);
    assert_eq!(status.embedded_chunks, status.total_chunks);

    let hits = engine.query_similar("ws", "Project readme", 1).await.unwrap();
    assert!(hits[0].file_path.ends_with("/README.md"), "{:?}", hits);
}

#[tokio::test]
async fn test_rebuild_resets_store_and_keeps_events() {
    let tmp = TempDir::new().unwrap();
    let (engine, root) = indexed_engine(&tmp).await;

    engine.pause("ws", None).await.unwrap();
    engine.notify_changed("ws", &[root.join("README.md").display().to_string()]);

    let status = engine.rebuild("ws", Some("corrupt index")).await.unwrap();
    assert_eq!(status.state, LifecycleState::Idle);
    assert!(!status.paused);
    assert!(!status.rebuilding);
    assert_eq!(status.total_files, 0);
    assert!(status.last_full_scan_time.is_none());
    assert!(status.vector_backfill_complete);
    assert_eq!(engine.pending_events("ws"), 1);

    let status = engine.build_full_index("ws", &[root]).await.unwrap();
    assert_eq!(status.state, LifecycleState::Ready);
    assert_eq!(status.total_files, 3);
}

#[tokio::test]
async fn test_embedding_queue_runs_once_backlog_is_empty() {
    let tmp = TempDir::new().unwrap();
    let (engine, _root) = indexed_engine(&tmp).await;

    let summary = engine.run_embedding_queue("ws").await.unwrap();
    assert_eq!(summary.embedded, 0);
    assert_eq!(summary.stop, QueueStop::Drained);

    engine.pause("ws", None).await.unwrap();
    let summary = engine.run_embedding_queue("ws").await.unwrap();
    assert_eq!(summary.stop, QueueStop::Skipped);
}

#[tokio::test]
async fn test_embedding_budget_degrades_until_drained() {
    let tmp = TempDir::new().unwrap();
    let root = setup_project(&tmp);
    let mut config = test_config(&tmp);
    config.embedding.max_per_run = 1;
    config.embedding.batch_size = 1;
    let engine = Engine::new(config).unwrap();

    let status = engine.build_full_index("ws", &[root]).await.unwrap();
    assert_eq!(status.state, LifecycleState::Degraded);
    assert_eq!(status.degraded_reason.as_deref(), Some("embedding budget exhausted"));
    assert_eq!(status.embedded_chunks, 1);

    let mut runs = 0;
    loop {
        let summary = engine.run_embedding_queue("ws").await.unwrap();
        runs += 1;
        if summary.stop == QueueStop::Drained || runs > 10 {
            break;
        }
    }
    let status = engine.get_status("ws").await;
    assert_eq!(status.state, LifecycleState::Ready);
    assert_eq!(status.embedded_chunks, status.total_chunks);
}

#[tokio::test]
async fn test_future_schema_is_read_only() {
    let tmp = TempDir::new().unwrap();
    let (engine, root) = indexed_engine(&tmp).await;
    let before = engine.get_status("ws").await;
    let store_path = engine.config().db.store_path("ws");
    drop(engine);

    let pool = raw_pool(&store_path).await;
    sqlx::query("UPDATE workspaces SET schemaVersion = 99")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let engine = Engine::new(test_config(&tmp)).unwrap();
    let status = engine.get_status("ws").await;
    assert!(!status.writable);
    assert_eq!(status.state, LifecycleState::Degraded);
    assert_eq!(status.last_error_code.as_deref(), Some("future_schema"));
    assert_eq!(status.total_files, before.total_files);

    fs::write(root.join("src/config.rs"), "changed\n").unwrap();
    let status = engine.build_full_index("ws", &[root]).await.unwrap();
    assert!(!status.writable);
    assert_eq!(status.indexed_files, before.indexed_files);

    // Reads keep working.
    let hits = engine.query_similar("ws", CONFIG_RS, 1).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_legacy_store_requires_rebuild() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store_path = config.db.store_path("ws");
    fs::create_dir_all(store_path.parent().unwrap()).unwrap();
    let pool = raw_pool(&store_path).await;
    sqlx::query("CREATE TABLE files (path TEXT PRIMARY KEY, hash TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let engine = Engine::new(config).unwrap();
    let status = engine.get_status("ws").await;
    assert_eq!(status.state, LifecycleState::Error);
    assert_eq!(status.last_error_code.as_deref(), Some("old_schema"));

    let status = engine.rebuild("ws", Some("old schema")).await.unwrap();
    assert_eq!(status.state, LifecycleState::Idle);
    assert!(status.writable);
    assert!(status.last_error_code.is_none());
}

#[tokio::test]
async fn test_delete_index_removes_store() {
    let tmp = TempDir::new().unwrap();
    let (engine, _root) = indexed_engine(&tmp).await;
    let store_path = engine.config().db.store_path("ws");
    assert!(store_path.exists());

    engine.delete_index("ws").await.unwrap();
    assert!(!store_path.exists());
    assert_eq!(engine.pending_events("ws"), 0);
}

#[tokio::test]
async fn test_backfill_on_fresh_store_is_noop() {
    let tmp = TempDir::new().unwrap();
    let (engine, _root) = indexed_engine(&tmp).await;
    let status = engine.trigger_vector_backfill("ws").await.unwrap();
    assert!(status.vector_backfill_complete);
    assert!(!status.backfilling_vector_index);
    assert_eq!(status.state, LifecycleState::Ready);
}
