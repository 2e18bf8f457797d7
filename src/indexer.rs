//! Incremental indexer.
//!
//! Applies a bounded set of canonical file paths to the store. Each file
//! is its own unit of work: its old chunks and embeddings are deleted and
//! the new chunks inserted in one immediate transaction, so an interrupted
//! call never leaves a file half-written.
//!
//! Files whose whole-file hash is unchanged (and already `indexed`) are
//! skipped without a single write. A running chunk budget bounds how much
//! one call writes; a file that would overflow it is deferred whole.

use std::time::{Duration, Instant};

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::{chunk_file, hash_text};
use crate::config::Config;
use crate::crawl::{language_id, tombstone_file, RootMap};
use crate::db::{begin_immediate, finish, retry_busy, WorkspaceStore};
use crate::error::StoreResult;
use crate::models::{now_millis, Chunk, FileStatus, IndexSummary};

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub max_lines: usize,
    pub overlap: usize,
    pub chunk_budget: usize,
    pub time_budget: Duration,
}

impl IndexOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_lines: config.chunking.max_lines,
            overlap: config.chunking.overlap,
            chunk_budget: config.indexing.chunk_budget,
            time_budget: config.indexing.time_budget(),
        }
    }
}

struct StoredFile {
    hash: Option<String>,
    status: String,
    deleted: bool,
}

enum FileOutcome {
    Reindexed(usize),
    Skipped,
    Deleted,
    /// Would overflow the remaining chunk budget.
    OverBudget,
    Failed,
}

/// Index `paths` (canonical identities) against the roots in `roots`.
///
/// Paths are processed in order. Storage errors on one file mark it
/// `error` and the batch continues; budget, time and cancellation stop the
/// loop and return the unprocessed paths in [`IndexSummary::deferred`].
pub async fn index_paths(
    store: &WorkspaceStore,
    roots: &RootMap,
    paths: &[String],
    options: &IndexOptions,
    token: &CancellationToken,
) -> StoreResult<IndexSummary> {
    store.ensure_writable()?;
    let started = Instant::now();
    let mut summary = IndexSummary::default();
    let mut budget_left = options.chunk_budget;

    for (i, path) in paths.iter().enumerate() {
        if token.is_cancelled() || started.elapsed() > options.time_budget {
            summary.deferred.extend(paths[i..].iter().cloned());
            break;
        }

        match index_one(store, roots, path, options, budget_left).await {
            FileOutcome::Reindexed(written) => {
                summary.reindexed += 1;
                summary.written_chunks += written;
                budget_left -= written;
            }
            FileOutcome::Skipped => summary.skipped += 1,
            FileOutcome::Deleted => summary.deleted += 1,
            FileOutcome::Failed => summary.failed += 1,
            FileOutcome::OverBudget => {
                summary.deferred.extend(paths[i..].iter().cloned());
                break;
            }
        }
    }

    debug!(
        workspace = store.workspace_id(),
        reindexed = summary.reindexed,
        skipped = summary.skipped,
        deleted = summary.deleted,
        failed = summary.failed,
        deferred = summary.deferred.len(),
        "index_paths done in {:?}",
        started.elapsed()
    );
    Ok(summary)
}

async fn index_one(
    store: &WorkspaceStore,
    roots: &RootMap,
    path: &str,
    options: &IndexOptions,
    budget_left: usize,
) -> FileOutcome {
    let Some(disk_path) = roots.resolve(path) else {
        warn!(path, "no known root for path; skipping");
        return FileOutcome::Failed;
    };

    let bytes = match tokio::fs::read(&disk_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return match soft_delete(store, path).await {
                Ok(()) => FileOutcome::Deleted,
                Err(err) => {
                    warn!(path, "soft delete failed: {}", err);
                    FileOutcome::Failed
                }
            };
        }
        Err(err) => {
            warn!(path, "cannot read file: {}", err);
            mark_error(store, path).await;
            return FileOutcome::Failed;
        }
    };
    let content = String::from_utf8_lossy(&bytes);
    let file_hash = hash_text(&content);

    let stored = match load_file(store, path).await {
        Ok(stored) => stored,
        Err(err) => {
            warn!(path, "cannot read file row: {}", err);
            return FileOutcome::Failed;
        }
    };
    if let Some(stored) = &stored {
        if !stored.deleted
            && stored.status == FileStatus::Indexed.as_str()
            && stored.hash.as_deref() == Some(file_hash.as_str())
        {
            return FileOutcome::Skipped;
        }
    }

    let chunks = chunk_file(path, &content, options.max_lines, options.overlap);
    if chunks.len() > options.chunk_budget {
        warn!(
            path,
            chunks = chunks.len(),
            budget = options.chunk_budget,
            "file exceeds the whole chunk budget; marking error"
        );
        mark_error(store, path).await;
        return FileOutcome::Failed;
    }
    if chunks.len() > budget_left {
        return FileOutcome::OverBudget;
    }

    let metadata = tokio::fs::metadata(&disk_path).await.ok();
    let row = FileRow {
        path,
        folder_path: parent_of(path),
        mtime: metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0),
        size: bytes.len() as i64,
        hash: &file_hash,
    };

    match retry_busy(store.busy_retries(), || write_file(store, &row, &chunks)).await {
        Ok(()) => {
            debug!(path, chunks = chunks.len(), "indexed");
            FileOutcome::Reindexed(chunks.len())
        }
        Err(err) => {
            warn!(path, "index transaction failed: {}", err);
            mark_error(store, path).await;
            FileOutcome::Failed
        }
    }
}

struct FileRow<'a> {
    path: &'a str,
    folder_path: String,
    mtime: i64,
    size: i64,
    hash: &'a str,
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => path.to_string(),
    }
}

async fn load_file(store: &WorkspaceStore, path: &str) -> StoreResult<Option<StoredFile>> {
    let row = sqlx::query("SELECT hash, status, deleted FROM files WHERE workspaceId = ? AND path = ?")
        .bind(store.workspace_id())
        .bind(path)
        .fetch_optional(store.pool())
        .await?;
    match row {
        Some(row) => Ok(Some(StoredFile {
            hash: row.try_get("hash")?,
            status: row.try_get("status")?,
            deleted: row.try_get::<i64, _>("deleted")? != 0,
        })),
        None => Ok(None),
    }
}

async fn write_file(store: &WorkspaceStore, row: &FileRow<'_>, chunks: &[Chunk]) -> StoreResult<()> {
    let mut conn = begin_immediate(store.pool()).await?;
    let outcome = replace_file(&mut conn, store.workspace_id(), row, chunks).await;
    finish(conn, outcome).await
}

async fn replace_file(
    conn: &mut SqliteConnection,
    ws: &str,
    row: &FileRow<'_>,
    chunks: &[Chunk],
) -> StoreResult<()> {
    sqlx::query("DELETE FROM embeddings WHERE workspaceId = ? AND filePath = ?")
        .bind(ws)
        .bind(row.path)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE workspaceId = ? AND filePath = ?")
        .bind(ws)
        .bind(row.path)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (workspaceId, filePath, chunkId, startLine, endLine, content, contentHash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ws)
        .bind(&chunk.file_path)
        .bind(&chunk.chunk_id)
        .bind(chunk.start_line as i64)
        .bind(chunk.end_line as i64)
        .bind(&chunk.content)
        .bind(&chunk.content_hash)
        .execute(&mut *conn)
        .await?;
    }

    let parent_path = parent_of(&row.folder_path);
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO folders (workspaceId, path, parentPath, status)
        VALUES (?, ?, ?, 'discovered')
        "#,
    )
    .bind(ws)
    .bind(&row.folder_path)
    .bind(if parent_path == row.folder_path { "" } else { parent_path.as_str() })
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO files (workspaceId, path, folderPath, mtime, size, languageId, hash, status, lastIndexedTime, deleted)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'indexed', ?, 0)
        ON CONFLICT(workspaceId, path) DO UPDATE SET
            folderPath = excluded.folderPath,
            mtime = excluded.mtime,
            size = excluded.size,
            languageId = excluded.languageId,
            hash = excluded.hash,
            status = 'indexed',
            lastIndexedTime = excluded.lastIndexedTime,
            deleted = 0
        "#,
    )
    .bind(ws)
    .bind(row.path)
    .bind(&row.folder_path)
    .bind(row.mtime)
    .bind(row.size)
    .bind(language_id(row.path))
    .bind(row.hash)
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Tombstone a file that vanished from disk. No-op for unknown paths.
pub async fn soft_delete(store: &WorkspaceStore, path: &str) -> StoreResult<()> {
    store.ensure_writable()?;
    retry_busy(store.busy_retries(), || async move {
        let mut conn = begin_immediate(store.pool()).await?;
        let outcome = tombstone_file(&mut conn, store.workspace_id(), path).await;
        finish(conn, outcome).await
    })
    .await
}

/// Best effort: a failure here is only logged.
async fn mark_error(store: &WorkspaceStore, path: &str) {
    let result = sqlx::query(
        r#"
        INSERT INTO files (workspaceId, path, folderPath, status)
        VALUES (?, ?, ?, 'error')
        ON CONFLICT(workspaceId, path) DO UPDATE SET status = 'error'
        "#,
    )
    .bind(store.workspace_id())
    .bind(path)
    .bind(parent_of(path))
    .execute(store.pool())
    .await;
    if let Err(err) = result {
        warn!(path, "could not mark file as error: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::describe_root;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: std::path::PathBuf,
        root_id: String,
        store: WorkspaceStore,
        roots: RootMap,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ws");
        fs::create_dir_all(&root).unwrap();
        let described = describe_root(&root).unwrap();
        let (store, _) = WorkspaceStore::open(&tmp.path().join("idx.sqlite"), "ws", &Config::default())
            .await
            .unwrap();
        Fixture {
            root: described.path.clone(),
            root_id: described.root_id.clone(),
            roots: RootMap::from_roots(&[described]),
            store,
            _tmp: tmp,
        }
    }

    fn write_lines(root: &Path, rel: &str, n: usize) {
        let text: Vec<String> = (1..=n).map(|i| format!("let v{} = {};", i, i)).collect();
        fs::write(root.join(rel), text.join("\n")).unwrap();
    }

    fn options() -> IndexOptions {
        IndexOptions::from_config(&Config::default())
    }

    async fn chunk_count(store: &WorkspaceStore, path: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE filePath = ?")
            .bind(path)
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_indexes_then_skips_unchanged() {
        let f = fixture().await;
        write_lines(&f.root, "a.rs", 250);
        let path = format!("{}/a.rs", f.root_id);
        let token = CancellationToken::new();

        let first = index_paths(&f.store, &f.roots, &[path.clone()], &options(), &token)
            .await
            .unwrap();
        assert_eq!(first.reindexed, 1);
        assert_eq!(first.written_chunks, 2);
        assert_eq!(chunk_count(&f.store, &path).await, 2);

        let (status, indexed_at): (String, Option<i64>) =
            sqlx::query_as("SELECT status, lastIndexedTime FROM files WHERE path = ?")
                .bind(&path)
                .fetch_one(f.store.pool())
                .await
                .unwrap();
        assert_eq!(status, "indexed");
        assert!(indexed_at.is_some());

        let second = index_paths(&f.store, &f.roots, &[path.clone()], &options(), &token)
            .await
            .unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.written_chunks, 0);
    }

    #[tokio::test]
    async fn test_changed_file_replaces_chunks_and_embeddings() {
        let f = fixture().await;
        write_lines(&f.root, "a.rs", 250);
        let path = format!("{}/a.rs", f.root_id);
        let token = CancellationToken::new();
        index_paths(&f.store, &f.roots, &[path.clone()], &options(), &token)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO embeddings VALUES ('ws', ?, ?, 'h', 'm', '1', x'00000000', 0)",
        )
        .bind(&path)
        .bind(format!("{}:1-200", path))
        .execute(f.store.pool())
        .await
        .unwrap();

        write_lines(&f.root, "a.rs", 10);
        let summary = index_paths(&f.store, &f.roots, &[path.clone()], &options(), &token)
            .await
            .unwrap();
        assert_eq!(summary.reindexed, 1);
        assert_eq!(chunk_count(&f.store, &path).await, 1);
        let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(f.store.pool())
            .await
            .unwrap();
        assert_eq!(embeddings, 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_soft_deleted() {
        let f = fixture().await;
        write_lines(&f.root, "gone.rs", 5);
        let path = format!("{}/gone.rs", f.root_id);
        let token = CancellationToken::new();
        index_paths(&f.store, &f.roots, &[path.clone()], &options(), &token)
            .await
            .unwrap();

        fs::remove_file(f.root.join("gone.rs")).unwrap();
        let summary = index_paths(&f.store, &f.roots, &[path.clone()], &options(), &token)
            .await
            .unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(chunk_count(&f.store, &path).await, 0);
        let deleted: i64 = sqlx::query_scalar("SELECT deleted FROM files WHERE path = ?")
            .bind(&path)
            .fetch_one(f.store.pool())
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_budget_defers_whole_files() {
        let f = fixture().await;
        write_lines(&f.root, "a.rs", 250);
        write_lines(&f.root, "b.rs", 250);
        write_lines(&f.root, "c.rs", 3);
        let paths: Vec<String> = ["a.rs", "b.rs", "c.rs"]
            .iter()
            .map(|p| format!("{}/{}", f.root_id, p))
            .collect();
        let opts = IndexOptions {
            chunk_budget: 3,
            ..options()
        };

        let summary = index_paths(&f.store, &f.roots, &paths, &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.reindexed, 1);
        assert_eq!(summary.written_chunks, 2);
        assert_eq!(summary.deferred, paths[1..].to_vec());
        assert_eq!(chunk_count(&f.store, &paths[1]).await, 0);
    }

    #[tokio::test]
    async fn test_file_larger_than_budget_marked_error() {
        let f = fixture().await;
        write_lines(&f.root, "huge.rs", 250);
        write_lines(&f.root, "small.rs", 3);
        let paths = vec![
            format!("{}/huge.rs", f.root_id),
            format!("{}/small.rs", f.root_id),
        ];
        let opts = IndexOptions {
            chunk_budget: 1,
            ..options()
        };

        let summary = index_paths(&f.store, &f.roots, &paths, &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.reindexed, 1);
        let status: String = sqlx::query_scalar("SELECT status FROM files WHERE path = ?")
            .bind(&paths[0])
            .fetch_one(f.store.pool())
            .await
            .unwrap();
        assert_eq!(status, "error");
    }

    #[tokio::test]
    async fn test_cancelled_call_defers_everything() {
        let f = fixture().await;
        write_lines(&f.root, "a.rs", 3);
        let paths = vec![format!("{}/a.rs", f.root_id)];
        let token = CancellationToken::new();
        token.cancel();
        let summary = index_paths(&f.store, &f.roots, &paths, &options(), &token)
            .await
            .unwrap();
        assert_eq!(summary.deferred, paths);
        assert_eq!(summary.reindexed, 0);
    }
}
