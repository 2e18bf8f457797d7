//! Lifecycle state, control flags and concurrency guards.
//!
//! `index_state` is the single source of truth for a workspace's lifecycle.
//! Every helper here reads or writes it directly; nothing is cached, so a
//! write-path operation always sees the latest `paused`/`rebuilding` flags.
//!
//! Allowed transitions:
//!
//! ```text
//! idle ──▶ building ──▶ ready | degraded | error
//! ready | degraded | error ──▶ building
//! degraded ──▶ ready            (embedding backlog drained)
//! ```
//!
//! Storage failures bypass the table: [`record_error`] moves the state to
//! whatever [`state_for_error`] says, from any state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::WorkspaceStore;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::models::{IndexState, LifecycleState};

pub const MAX_CONCURRENT_SCANS: usize = 1;

pub fn can_transition(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
        (from, to),
        (Idle, Building)
            | (Building, Ready)
            | (Building, Degraded)
            | (Building, Error)
            | (Ready, Building)
            | (Degraded, Building)
            | (Error, Building)
            | (Degraded, Ready)
    )
}

pub fn state_for_error(kind: ErrorKind) -> LifecycleState {
    match kind {
        ErrorKind::OpenFailure => LifecycleState::Idle,
        ErrorKind::BusyOrLocked | ErrorKind::FutureSchema => LifecycleState::Degraded,
        ErrorKind::Corrupt | ErrorKind::OldSchema | ErrorKind::Other => LifecycleState::Error,
    }
}

/// Write-path operations are no-ops while either flag is set.
pub fn write_blocked(state: &IndexState) -> bool {
    state.paused || state.rebuilding
}

pub async fn read_state(store: &WorkspaceStore) -> StoreResult<IndexState> {
    let row = sqlx::query(
        r#"
        SELECT state, lastFullScanTime, lastEmbeddingRunTime, lastErrorCode, lastErrorMessage,
               paused, pausedReason, degradedReason, rebuilding,
               vectorBackfillComplete, backfillingVectorIndex
        FROM index_state WHERE workspaceId = ?
        "#,
    )
    .bind(store.workspace_id())
    .fetch_optional(store.pool())
    .await?;

    let Some(row) = row else {
        return Ok(IndexState::default());
    };
    let state: String = row.try_get("state")?;
    Ok(IndexState {
        state: LifecycleState::parse(&state),
        last_full_scan_time: row.try_get("lastFullScanTime")?,
        last_embedding_run_time: row.try_get("lastEmbeddingRunTime")?,
        last_error_code: row.try_get("lastErrorCode")?,
        last_error_message: row.try_get("lastErrorMessage")?,
        paused: row.try_get::<i64, _>("paused")? != 0,
        paused_reason: row.try_get("pausedReason")?,
        degraded_reason: row.try_get("degradedReason")?,
        rebuilding: row.try_get::<i64, _>("rebuilding")? != 0,
        vector_backfill_complete: row.try_get::<i64, _>("vectorBackfillComplete")? != 0,
        backfilling_vector_index: row.try_get::<i64, _>("backfillingVectorIndex")? != 0,
    })
}

/// Move to `to` if the transition is allowed from the current state.
///
/// Entering `ready` or `building` clears the error fields and the degraded
/// reason; entering `degraded` records `reason`. Returns whether the state
/// changed.
pub async fn transition(
    store: &WorkspaceStore,
    to: LifecycleState,
    reason: Option<&str>,
) -> StoreResult<bool> {
    store.ensure_writable()?;
    let current = read_state(store).await?;
    if current.state == to {
        if to == LifecycleState::Degraded && reason.is_some() {
            set_degraded_reason(store, reason).await?;
        }
        return Ok(false);
    }
    if !can_transition(current.state, to) {
        warn!(
            workspace = store.workspace_id(),
            from = %current.state,
            to = %to,
            "refusing lifecycle transition"
        );
        return Ok(false);
    }

    let clears = matches!(to, LifecycleState::Ready | LifecycleState::Building);
    sqlx::query(
        r#"
        UPDATE index_state SET
            state = ?1,
            degradedReason = CASE WHEN ?1 = 'degraded' THEN ?2 ELSE NULL END,
            lastErrorCode = CASE WHEN ?3 THEN NULL ELSE lastErrorCode END,
            lastErrorMessage = CASE WHEN ?3 THEN NULL ELSE lastErrorMessage END
        WHERE workspaceId = ?4
        "#,
    )
    .bind(to.as_str())
    .bind(reason)
    .bind(clears)
    .bind(store.workspace_id())
    .execute(store.pool())
    .await?;

    info!(
        workspace = store.workspace_id(),
        from = %current.state,
        to = %to,
        reason = reason.unwrap_or(""),
        "lifecycle transition"
    );
    Ok(true)
}

async fn set_degraded_reason(store: &WorkspaceStore, reason: Option<&str>) -> StoreResult<()> {
    sqlx::query("UPDATE index_state SET degradedReason = ? WHERE workspaceId = ?")
        .bind(reason)
        .bind(store.workspace_id())
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Record a storage failure and move to the state it maps to.
pub async fn record_error(store: &WorkspaceStore, err: &StoreError) -> StoreResult<()> {
    let state = state_for_error(err.kind);
    warn!(
        workspace = store.workspace_id(),
        kind = %err.kind,
        state = %state,
        "storage error: {}",
        err.message
    );
    if !store.is_writable() {
        return Ok(());
    }
    let degraded_reason = (state == LifecycleState::Degraded).then(|| err.to_string());
    sqlx::query(
        r#"
        UPDATE index_state SET
            state = ?, lastErrorCode = ?, lastErrorMessage = ?, degradedReason = ?
        WHERE workspaceId = ?
        "#,
    )
    .bind(state.as_str())
    .bind(err.kind.as_code())
    .bind(&err.message)
    .bind(degraded_reason)
    .bind(store.workspace_id())
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn set_paused(store: &WorkspaceStore, paused: bool, reason: Option<&str>) -> StoreResult<()> {
    store.ensure_writable()?;
    sqlx::query("UPDATE index_state SET paused = ?, pausedReason = ? WHERE workspaceId = ?")
        .bind(paused)
        .bind(if paused { reason } else { None })
        .bind(store.workspace_id())
        .execute(store.pool())
        .await?;
    info!(workspace = store.workspace_id(), paused, reason = reason.unwrap_or(""), "pause flag");
    Ok(())
}

pub async fn set_rebuilding(store: &WorkspaceStore, rebuilding: bool) -> StoreResult<()> {
    store.ensure_writable()?;
    sqlx::query("UPDATE index_state SET rebuilding = ? WHERE workspaceId = ?")
        .bind(rebuilding)
        .bind(store.workspace_id())
        .execute(store.pool())
        .await?;
    Ok(())
}

pub async fn set_last_full_scan(store: &WorkspaceStore, at: i64) -> StoreResult<()> {
    sqlx::query("UPDATE index_state SET lastFullScanTime = ? WHERE workspaceId = ?")
        .bind(at)
        .bind(store.workspace_id())
        .execute(store.pool())
        .await?;
    sqlx::query("UPDATE workspaces SET lastIndexedTime = ? WHERE id = ?")
        .bind(at)
        .bind(store.workspace_id())
        .execute(store.pool())
        .await?;
    Ok(())
}

pub async fn set_backfill_flags(
    store: &WorkspaceStore,
    backfilling: bool,
    complete: Option<bool>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE index_state SET
            backfillingVectorIndex = ?,
            vectorBackfillComplete = COALESCE(?, vectorBackfillComplete)
        WHERE workspaceId = ?
        "#,
    )
    .bind(backfilling)
    .bind(complete)
    .bind(store.workspace_id())
    .execute(store.pool())
    .await?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-wide bookkeeping for in-flight work.
#[derive(Debug, Default)]
pub struct Registry {
    active_scans: AtomicUsize,
    active_queues: Mutex<HashSet<String>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the full-scan slot; `None` if a scan is already running.
    pub fn try_begin_scan(&self) -> Option<ScanGuard<'_>> {
        self.active_scans
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_CONCURRENT_SCANS).then_some(n + 1)
            })
            .ok()
            .map(|_| ScanGuard { registry: self })
    }

    pub fn active_scans(&self) -> usize {
        self.active_scans.load(Ordering::Acquire)
    }

    /// Claim the embedding queue of `workspace_id`; `None` if it is running.
    pub fn try_begin_queue(&self, workspace_id: &str) -> Option<QueueGuard<'_>> {
        let mut queues = lock(&self.active_queues);
        if !queues.insert(workspace_id.to_string()) {
            return None;
        }
        Some(QueueGuard {
            registry: self,
            workspace_id: workspace_id.to_string(),
        })
    }

    pub fn queue_active(&self, workspace_id: &str) -> bool {
        lock(&self.active_queues).contains(workspace_id)
    }

    /// Live cancellation token for `workspace_id`, replacing a cancelled one.
    pub fn token(&self, workspace_id: &str) -> CancellationToken {
        let mut tokens = lock(&self.tokens);
        let token = tokens
            .entry(workspace_id.to_string())
            .or_insert_with(CancellationToken::new);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    /// Cancel in-flight work for `workspace_id`. Later calls to
    /// [`Registry::token`] hand out a fresh token.
    pub fn cancel(&self, workspace_id: &str) {
        if let Some(token) = lock(&self.tokens).remove(workspace_id) {
            token.cancel();
        }
    }
}

#[derive(Debug)]
pub struct ScanGuard<'a> {
    registry: &'a Registry,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.registry.active_scans.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct QueueGuard<'a> {
    registry: &'a Registry,
    workspace_id: String,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        lock(&self.registry.active_queues).remove(&self.workspace_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> WorkspaceStore {
        WorkspaceStore::open(&tmp.path().join("idx.sqlite"), "ws", &Config::default())
            .await
            .unwrap()
            .0
    }

    #[test]
    fn test_transition_table() {
        use LifecycleState::*;
        assert!(can_transition(Idle, Building));
        assert!(can_transition(Building, Ready));
        assert!(can_transition(Degraded, Ready));
        assert!(can_transition(Error, Building));
        assert!(!can_transition(Idle, Ready));
        assert!(!can_transition(Ready, Degraded));
        assert!(!can_transition(Error, Ready));
    }

    #[test]
    fn test_error_state_mapping() {
        assert_eq!(state_for_error(ErrorKind::OpenFailure), LifecycleState::Idle);
        assert_eq!(state_for_error(ErrorKind::BusyOrLocked), LifecycleState::Degraded);
        assert_eq!(state_for_error(ErrorKind::FutureSchema), LifecycleState::Degraded);
        assert_eq!(state_for_error(ErrorKind::Corrupt), LifecycleState::Error);
        assert_eq!(state_for_error(ErrorKind::OldSchema), LifecycleState::Error);
        assert_eq!(state_for_error(ErrorKind::Other), LifecycleState::Error);
    }

    #[test]
    fn test_scan_guard_is_exclusive_and_released_on_drop() {
        let registry = Registry::new();
        let guard = registry.try_begin_scan().unwrap();
        assert!(registry.try_begin_scan().is_none());
        assert_eq!(registry.active_scans(), 1);
        drop(guard);
        assert_eq!(registry.active_scans(), 0);
        assert!(registry.try_begin_scan().is_some());
    }

    #[test]
    fn test_queue_guard_is_per_workspace() {
        let registry = Registry::new();
        let a = registry.try_begin_queue("a").unwrap();
        assert!(registry.try_begin_queue("a").is_none());
        assert!(registry.try_begin_queue("b").is_some());
        drop(a);
        assert!(!registry.queue_active("a"));
        assert!(registry.try_begin_queue("a").is_some());
    }

    #[test]
    fn test_cancel_replaces_token() {
        let registry = Registry::new();
        let first = registry.token("ws");
        registry.cancel("ws");
        assert!(first.is_cancelled());
        assert!(!registry.token("ws").is_cancelled());
    }

    #[tokio::test]
    async fn test_transitions_persist_and_clear_errors() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;

        assert!(!transition(&store, LifecycleState::Ready, None).await.unwrap());
        assert!(transition(&store, LifecycleState::Building, None).await.unwrap());
        assert!(transition(&store, LifecycleState::Degraded, Some("crawl file cap reached"))
            .await
            .unwrap());
        let state = read_state(&store).await.unwrap();
        assert_eq!(state.state, LifecycleState::Degraded);
        assert_eq!(state.degraded_reason.as_deref(), Some("crawl file cap reached"));

        record_error(&store, &StoreError::new(ErrorKind::Corrupt, "malformed"))
            .await
            .unwrap();
        let state = read_state(&store).await.unwrap();
        assert_eq!(state.state, LifecycleState::Error);
        assert_eq!(state.last_error_code.as_deref(), Some("corrupt"));

        transition(&store, LifecycleState::Building, None).await.unwrap();
        let state = read_state(&store).await.unwrap();
        assert!(state.last_error_code.is_none());
        assert!(state.degraded_reason.is_none());
    }

    #[tokio::test]
    async fn test_pause_flag_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        set_paused(&store, true, Some("battery")).await.unwrap();
        let state = read_state(&store).await.unwrap();
        assert!(state.paused && write_blocked(&state));
        assert_eq!(state.paused_reason.as_deref(), Some("battery"));

        set_paused(&store, false, None).await.unwrap();
        let state = read_state(&store).await.unwrap();
        assert!(!state.paused && state.paused_reason.is_none());
    }
}
