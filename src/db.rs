//! Per-workspace store handle.
//!
//! Each workspace owns one SQLite file opened through a small WAL-mode
//! pool. Writers serialize at the storage layer: every mutating unit of
//! work runs inside its own `BEGIN IMMEDIATE` transaction on a pooled
//! connection, and busy/locked failures are retried with backoff by
//! [`retry_busy`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::schema::{self, SchemaOutcome};

const BUSY_BACKOFF_BASE_MS: u64 = 50;

pub async fn connect(path: &Path, config: &Config) -> StoreResult<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(2));

    if let Some(extension) = &config.search.extension {
        options = options.extension(extension.clone());
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// An open, schema-checked store for one workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    workspace_id: String,
    path: PathBuf,
    pool: SqlitePool,
    writable: bool,
    busy_retries: u32,
}

impl WorkspaceStore {
    /// Open (creating if needed) the store at `path` and bring its schema
    /// to the current version.
    ///
    /// A store written by a newer schema opens read-only; every other
    /// schema failure closes the pool and is returned.
    pub async fn open(
        path: &Path,
        workspace_id: &str,
        config: &Config,
    ) -> StoreResult<(Self, SchemaOutcome)> {
        let pool = connect(path, config).await?;

        let outcome = match schema::ensure_schema(&pool, workspace_id).await {
            Ok(outcome) => outcome,
            Err(err) if err.kind == ErrorKind::FutureSchema => {
                warn!(workspace = workspace_id, "{}", err);
                SchemaOutcome::ReadOnly
            }
            Err(err) => {
                pool.close().await;
                return Err(err);
            }
        };

        let store = Self {
            workspace_id: workspace_id.to_string(),
            path: path.to_path_buf(),
            pool,
            writable: outcome != SchemaOutcome::ReadOnly,
            busy_retries: config.indexing.busy_retries,
        };
        Ok((store, outcome))
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn ensure_writable(&self) -> StoreResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::read_only())
        }
    }

    pub fn busy_retries(&self) -> u32 {
        self.busy_retries
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// A write transaction holding its own pooled connection.
pub type StoreTx = Transaction<'static, Sqlite>;

/// Start a `BEGIN IMMEDIATE` transaction. Dropping the returned handle
/// without [`finish`] rolls it back before the connection is reused.
pub async fn begin_immediate(pool: &SqlitePool) -> StoreResult<StoreTx> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

/// Commit on success, roll back on failure.
pub async fn finish<T>(tx: StoreTx, outcome: StoreResult<T>) -> StoreResult<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("rollback failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

/// Run `op` until it succeeds, fails with something other than
/// [`ErrorKind::BusyOrLocked`], or `attempts` are used up.
///
/// Backoff: 50ms, 100ms, 200ms, ... (capped at 2^6).
pub async fn retry_busy<T, F, Fut>(attempts: u32, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(err) if err.kind == ErrorKind::BusyOrLocked && attempt + 1 < attempts => {
                let delay = Duration::from_millis(BUSY_BACKOFF_BASE_MS << attempt.min(6));
                debug!(attempt, ?delay, "store busy, retrying: {}", err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Remove a store file together with its WAL and shared-memory siblings.
pub fn remove_store_files(path: &Path) -> std::io::Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        match std::fs::remove_file(PathBuf::from(target)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
