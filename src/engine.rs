//! Workspace engine: the public face of the index.
//!
//! [`Engine`] is a cheap-clone handle over per-workspace stores. It owns
//! the lifecycle around every operation: it opens stores lazily, reads
//! the control flags fresh before each write-path step, claims the
//! registry guards and classifies storage failures into `index_state`.
//! Callers get a [`Status`] snapshot back instead of a storage error.
//! Only failures that are not storage failures surface as `Err`.
//!
//! Watcher events go through [`Engine::notify_changed`] and
//! [`Engine::notify_deleted`]. They collect in a pending set that a
//! debounced flush drains once the workspace has finished its first full
//! scan and is neither paused nor rebuilding.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backfill::{run_backfill, BackfillOptions};
use crate::config::Config;
use crate::control::{
    read_state, record_error, set_last_full_scan, set_paused, set_rebuilding, state_for_error,
    transition, write_blocked, Registry,
};
use crate::crawl::{crawl, describe_root, reconcile, CrawlOptions, RootMap, Truncation};
use crate::db::{remove_store_files, WorkspaceStore};
use crate::embed_queue::{self, stale_count, QueueOptions};
use crate::embedding::RuntimeSelector;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::indexer::{self, soft_delete, IndexOptions};
use crate::models::{
    now_millis, FileStatus, IndexSummary, LifecycleState, QueueStop, QueueSummary, RankedHit,
    ResumeReport, Status,
};
use crate::ranking::rank_with_store;
use crate::scheduler::ScheduledTask;
use crate::vector_search::VectorSearch;

pub const INDEX_BUDGET_REASON: &str = "indexing budget exhausted";
pub const EMBEDDING_BUDGET_REASON: &str = "embedding budget exhausted";
pub const CANCELLED_REASON: &str = "cancelled";
const READ_ONLY_REASON: &str = "store was written by a newer schema; writes disabled";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Watcher events waiting for a flush. The last event for a path wins.
#[derive(Debug, Default)]
pub struct PendingEvents {
    changed: BTreeSet<String>,
    deleted: BTreeSet<String>,
}

impl PendingEvents {
    pub fn changed(&mut self, path: &str) {
        self.deleted.remove(path);
        self.changed.insert(path.to_string());
    }

    pub fn deleted(&mut self, path: &str) {
        self.changed.remove(path);
        self.deleted.insert(path.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed.len() + self.deleted.len()
    }

    fn take(&mut self) -> (Vec<String>, Vec<String>) {
        (
            std::mem::take(&mut self.changed).into_iter().collect(),
            std::mem::take(&mut self.deleted).into_iter().collect(),
        )
    }

    /// Put deferred paths back unless a newer event already replaced them.
    fn requeue(&mut self, paths: Vec<String>) {
        for path in paths {
            if !self.deleted.contains(&path) {
                self.changed.insert(path);
            }
        }
    }

    /// Put back a taken batch that failed to apply. Newer events win.
    fn restore(&mut self, changed: Vec<String>, deleted: Vec<String>) {
        for path in deleted {
            if !self.changed.contains(&path) {
                self.deleted.insert(path);
            }
        }
        self.requeue(changed);
    }
}

#[derive(Clone)]
struct Slot {
    store: WorkspaceStore,
    search: Arc<VectorSearch>,
}

struct WorkspaceHandle {
    id: String,
    slot: tokio::sync::Mutex<Option<Slot>>,
    pending: Mutex<PendingEvents>,
    flush_task: ScheduledTask,
    embed_task: ScheduledTask,
}

impl WorkspaceHandle {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            slot: tokio::sync::Mutex::new(None),
            pending: Mutex::new(PendingEvents::default()),
            flush_task: ScheduledTask::new("watcher-flush"),
            embed_task: ScheduledTask::new("embedding-flush"),
        }
    }
}

struct EngineInner {
    config: Config,
    registry: Registry,
    selector: RuntimeSelector,
    workspaces: Mutex<HashMap<String, Arc<WorkspaceHandle>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine with the embedding runtime named in `config`.
    pub fn new(config: Config) -> Result<Self> {
        let selector = RuntimeSelector::from_config(&config.embedding)?;
        Ok(Self::with_runtime(config, selector))
    }

    pub fn with_runtime(config: Config, selector: RuntimeSelector) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: Registry::new(),
                selector,
                workspaces: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    fn handle(&self, workspace_id: &str) -> Arc<WorkspaceHandle> {
        lock(&self.inner.workspaces)
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(WorkspaceHandle::new(workspace_id)))
            .clone()
    }

    async fn slot(&self, handle: &WorkspaceHandle) -> StoreResult<Slot> {
        let mut slot = handle.slot.lock().await;
        if let Some(open) = slot.as_ref() {
            return Ok(open.clone());
        }
        let path = self.inner.config.db.store_path(&handle.id);
        let (store, outcome) = WorkspaceStore::open(&path, &handle.id, &self.inner.config).await?;
        debug!(workspace = %handle.id, ?outcome, path = %path.display(), "opened store");
        let open = Slot {
            store,
            search: Arc::new(VectorSearch::from_config(&self.inner.config.search)),
        };
        *slot = Some(open.clone());
        Ok(open)
    }

    async fn close_slot(&self, handle: &WorkspaceHandle) {
        if let Some(open) = handle.slot.lock().await.take() {
            open.store.close().await;
        }
    }

    /// Record a storage failure in `index_state`; any other failure is
    /// recorded as `Other` and returned.
    async fn settle(&self, store: &WorkspaceStore, result: Result<()>) -> Result<()> {
        let Err(err) = result else {
            return Ok(());
        };
        if let Some(store_err) = err.downcast_ref::<StoreError>() {
            self.record(store, store_err).await;
            return Ok(());
        }
        self.record(store, &StoreError::new(ErrorKind::Other, format!("{:#}", err)))
            .await;
        Err(err)
    }

    async fn record(&self, store: &WorkspaceStore, err: &StoreError) {
        if let Err(record_err) = record_error(store, err).await {
            warn!(workspace = store.workspace_id(), "could not record error: {}", record_err);
        }
    }

    /// Whether write-path work may run right now. Reads `index_state`.
    async fn writes_allowed(&self, store: &WorkspaceStore) -> StoreResult<bool> {
        if !store.is_writable() {
            return Ok(false);
        }
        let state = read_state(store).await?;
        if write_blocked(&state) {
            debug!(
                workspace = store.workspace_id(),
                paused = state.paused,
                rebuilding = state.rebuilding,
                "write path blocked"
            );
            return Ok(false);
        }
        Ok(true)
    }

    // ---- status ----

    /// Best-effort status snapshot. Never fails: an unreadable store is
    /// reported through the state its error maps to.
    pub async fn get_status(&self, workspace_id: &str) -> Status {
        let handle = self.handle(workspace_id);
        let slot = match self.slot(&handle).await {
            Ok(slot) => slot,
            Err(err) => return unavailable(workspace_id, &err),
        };
        match self.status_of(&slot.store).await {
            Ok(status) => status,
            Err(err) => unavailable(workspace_id, &err),
        }
    }

    async fn status_of(&self, store: &WorkspaceStore) -> StoreResult<Status> {
        let state = read_state(store).await?;
        let mut status = Status::from_state(store.workspace_id(), &state);
        let ws = store.workspace_id();

        status.total_files =
            sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE workspaceId = ? AND deleted = 0")
                .bind(ws)
                .fetch_one(store.pool())
                .await?;
        status.indexed_files = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE workspaceId = ? AND deleted = 0 AND status = ?",
        )
        .bind(ws)
        .bind(FileStatus::Indexed.as_str())
        .fetch_one(store.pool())
        .await?;
        status.total_chunks = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE workspaceId = ?")
            .bind(ws)
            .fetch_one(store.pool())
            .await?;
        let stale = stale_count(store, &self.inner.selector.preferred_key()).await?;
        status.embedded_chunks = (status.total_chunks - stale).max(0);

        status.writable = store.is_writable();
        if !status.writable {
            status.state = LifecycleState::Degraded;
            status.degraded_reason = Some(READ_ONLY_REASON.to_string());
            status.last_error_code = Some(ErrorKind::FutureSchema.as_code().to_string());
        }
        Ok(status)
    }

    // ---- full scan ----

    /// Crawl `roots`, reconcile the store, index every crawled file and run
    /// one bounded embedding pass.
    ///
    /// No-op while paused, rebuilding, read-only, or when another full
    /// scan holds the process-wide slot. Ends in `ready`, or `degraded`
    /// with a reason when a budget or cancellation cut the work short.
    pub async fn build_full_index(&self, workspace_id: &str, roots: &[PathBuf]) -> Result<Status> {
        for root in roots {
            describe_root(root)?;
        }
        let handle = self.handle(workspace_id);
        let slot = match self.slot(&handle).await {
            Ok(slot) => slot,
            Err(err) => return Ok(unavailable(workspace_id, &err)),
        };
        let result = self.full_scan(&handle, &slot, roots).await;
        self.settle(&slot.store, result).await?;
        Ok(self.get_status(workspace_id).await)
    }

    async fn full_scan(&self, handle: &WorkspaceHandle, slot: &Slot, roots: &[PathBuf]) -> Result<()> {
        let store = &slot.store;
        if !self.writes_allowed(store).await? {
            return Ok(());
        }
        let Some(_scan) = self.inner.registry.try_begin_scan() else {
            info!(workspace = %handle.id, "full scan already running; skipping");
            return Ok(());
        };
        let config = &self.inner.config;
        let token = self.inner.registry.token(&handle.id);
        transition(store, LifecycleState::Building, None).await?;

        let crawl_roots = roots.to_vec();
        let options = CrawlOptions::from_config(&config.crawl);
        let crawl_token = token.clone();
        let outcome =
            tokio::task::spawn_blocking(move || crawl(&crawl_roots, &options, &crawl_token)).await??;
        reconcile(store, &outcome).await?;

        let root_map = RootMap::from_roots(&outcome.roots);
        let paths: Vec<String> = outcome.files.iter().map(|f| f.path.clone()).collect();
        let summary = indexer::index_paths(
            store,
            &root_map,
            &paths,
            &IndexOptions::from_config(config),
            &token,
        )
        .await?;
        let deferred = !summary.deferred.is_empty();
        if deferred {
            lock(&handle.pending).requeue(summary.deferred);
        }

        let embedding = self.embed_pass(store, &token).await?;

        let reason = if token.is_cancelled() {
            Some(CANCELLED_REASON)
        } else if let Some(truncation) = outcome.truncation.filter(|t| *t != Truncation::Cancelled) {
            Some(truncation.reason())
        } else if deferred {
            Some(INDEX_BUDGET_REASON)
        } else if matches!(embedding, Some(QueueStop::TimeBudget | QueueStop::CountBudget)) {
            Some(EMBEDDING_BUDGET_REASON)
        } else {
            None
        };
        match reason {
            Some(reason) => transition(store, LifecycleState::Degraded, Some(reason)).await?,
            None => transition(store, LifecycleState::Ready, None).await?,
        };
        if token.is_cancelled() {
            return Ok(());
        }
        set_last_full_scan(store, now_millis()).await?;

        info!(
            workspace = %handle.id,
            files = outcome.files.len(),
            reindexed = summary.reindexed,
            skipped = summary.skipped,
            chunks = summary.written_chunks,
            degraded = reason.unwrap_or(""),
            "full scan finished"
        );

        if !lock(&handle.pending).is_empty() {
            self.schedule_flush(handle);
        }
        if embedding != Some(QueueStop::Drained) {
            self.schedule_embedding(handle);
        }
        Ok(())
    }

    /// One embedding run under the queue guard; `None` if one is running.
    async fn embed_pass(
        &self,
        store: &WorkspaceStore,
        token: &CancellationToken,
    ) -> StoreResult<Option<QueueStop>> {
        let Some(_queue) = self.inner.registry.try_begin_queue(store.workspace_id()) else {
            return Ok(None);
        };
        let options = QueueOptions::from_config(&self.inner.config.embedding);
        let summary =
            embed_queue::run_embedding_queue(store, &self.inner.selector, &options, token).await?;
        Ok(Some(summary.stop))
    }

    // ---- incremental ----

    /// Index explicit paths (absolute disk paths or canonical identities).
    ///
    /// Paths outside the workspace's known roots are ignored. Paths the
    /// budgets leave unprocessed go to the pending set for the next flush.
    pub async fn index_paths(&self, workspace_id: &str, paths: &[String]) -> Result<Status> {
        let handle = self.handle(workspace_id);
        let slot = match self.slot(&handle).await {
            Ok(slot) => slot,
            Err(err) => return Ok(unavailable(workspace_id, &err)),
        };
        let result = self.index_now(&handle, &slot.store, paths).await.map(|_| ());
        self.settle(&slot.store, result).await?;
        Ok(self.get_status(workspace_id).await)
    }

    async fn index_now(
        &self,
        handle: &WorkspaceHandle,
        store: &WorkspaceStore,
        paths: &[String],
    ) -> Result<IndexSummary> {
        if !self.writes_allowed(store).await? {
            return Ok(IndexSummary::default());
        }
        let roots = RootMap::load(store).await?;
        let identities = normalize_all(&roots, paths);
        let token = self.inner.registry.token(&handle.id);
        let summary = indexer::index_paths(
            store,
            &roots,
            &identities,
            &IndexOptions::from_config(&self.inner.config),
            &token,
        )
        .await?;
        self.after_index(handle, &summary);
        Ok(summary)
    }

    fn after_index(&self, handle: &WorkspaceHandle, summary: &IndexSummary) {
        if !summary.deferred.is_empty() {
            lock(&handle.pending).requeue(summary.deferred.clone());
            self.schedule_flush(handle);
        }
        if summary.written_chunks > 0 {
            self.schedule_embedding(handle);
        }
    }

    /// Record changed paths from the watcher and arm the debounced flush.
    pub fn notify_changed(&self, workspace_id: &str, paths: &[String]) {
        let handle = self.handle(workspace_id);
        {
            let mut pending = lock(&handle.pending);
            for path in paths {
                pending.changed(path);
            }
        }
        self.schedule_flush(&handle);
    }

    /// Record deleted paths from the watcher and arm the debounced flush.
    pub fn notify_deleted(&self, workspace_id: &str, paths: &[String]) {
        let handle = self.handle(workspace_id);
        {
            let mut pending = lock(&handle.pending);
            for path in paths {
                pending.deleted(path);
            }
        }
        self.schedule_flush(&handle);
    }

    pub fn pending_events(&self, workspace_id: &str) -> usize {
        lock(&self.handle(workspace_id).pending).len()
    }

    /// Drain the pending set. Events stay queued while writes are blocked
    /// or before the first full scan has finished.
    pub async fn flush_pending(&self, workspace_id: &str) -> Result<IndexSummary> {
        let handle = self.handle(workspace_id);
        let slot = match self.slot(&handle).await {
            Ok(slot) => slot,
            Err(err) => {
                warn!(workspace = workspace_id, "flush skipped: {}", err);
                return Ok(IndexSummary::default());
            }
        };
        let mut summary = IndexSummary::default();
        let result = self.drain(&handle, &slot.store, &mut summary).await;
        self.settle(&slot.store, result).await?;
        Ok(summary)
    }

    async fn drain(
        &self,
        handle: &WorkspaceHandle,
        store: &WorkspaceStore,
        summary: &mut IndexSummary,
    ) -> Result<()> {
        if !self.writes_allowed(store).await? {
            return Ok(());
        }
        if read_state(store).await?.last_full_scan_time.is_none() {
            debug!(workspace = %handle.id, "no full scan yet; holding watcher events");
            return Ok(());
        }

        let (changed, deleted) = lock(&handle.pending).take();
        if changed.is_empty() && deleted.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.apply_events(handle, store, &changed, &deleted, summary).await {
            warn!(
                workspace = %handle.id,
                events = changed.len() + deleted.len(),
                "flush failed; events stay pending"
            );
            lock(&handle.pending).restore(changed, deleted);
            return Err(err);
        }

        info!(
            workspace = %handle.id,
            reindexed = summary.reindexed,
            deleted = summary.deleted,
            deferred = summary.deferred.len(),
            "flushed watcher events"
        );
        Ok(())
    }

    async fn apply_events(
        &self,
        handle: &WorkspaceHandle,
        store: &WorkspaceStore,
        changed: &[String],
        deleted: &[String],
        summary: &mut IndexSummary,
    ) -> Result<()> {
        let roots = RootMap::load(store).await?;
        for path in normalize_all(&roots, deleted) {
            soft_delete(store, &path).await?;
            summary.deleted += 1;
        }

        let identities = normalize_all(&roots, changed);
        let token = self.inner.registry.token(&handle.id);
        let indexed = indexer::index_paths(
            store,
            &roots,
            &identities,
            &IndexOptions::from_config(&self.inner.config),
            &token,
        )
        .await?;
        self.after_index(handle, &indexed);
        summary.merge(indexed);
        Ok(())
    }

    fn schedule_flush(&self, handle: &WorkspaceHandle) {
        let engine = self.clone();
        let workspace_id = handle.id.clone();
        let delay = Duration::from_millis(self.inner.config.watcher.debounce_ms);
        handle.flush_task.schedule(delay, async move {
            if let Err(err) = engine.flush_pending(&workspace_id).await {
                warn!(workspace = %workspace_id, "watcher flush failed: {:#}", err);
            }
        });
    }

    fn schedule_embedding(&self, handle: &WorkspaceHandle) {
        let engine = self.clone();
        let workspace_id = handle.id.clone();
        let delay = Duration::from_millis(self.inner.config.watcher.embed_debounce_ms);
        handle.embed_task.schedule(delay, async move {
            if let Err(err) = engine.run_embedding_queue(&workspace_id).await {
                warn!(workspace = %workspace_id, "embedding flush failed: {:#}", err);
            }
        });
    }

    // ---- embedding ----

    /// Embed stale chunks within the configured budgets.
    ///
    /// A drained backlog lifts a `degraded` state that an earlier embedding
    /// budget caused. A budget stop re-arms the embedding flush.
    pub async fn run_embedding_queue(&self, workspace_id: &str) -> Result<QueueSummary> {
        let skipped = QueueSummary {
            stop: QueueStop::Skipped,
            ..QueueSummary::default()
        };
        let handle = self.handle(workspace_id);
        let slot = match self.slot(&handle).await {
            Ok(slot) => slot,
            Err(err) => {
                warn!(workspace = workspace_id, "embedding skipped: {}", err);
                return Ok(skipped);
            }
        };
        let store = &slot.store;

        let run = async {
            if !self.writes_allowed(store).await? {
                return Ok(skipped.clone());
            }
            let Some(_queue) = self.inner.registry.try_begin_queue(workspace_id) else {
                debug!(workspace = workspace_id, "embedding queue already running");
                return Ok(skipped.clone());
            };
            let token = self.inner.registry.token(workspace_id);
            let options = QueueOptions::from_config(&self.inner.config.embedding);
            let summary =
                embed_queue::run_embedding_queue(store, &self.inner.selector, &options, &token).await?;

            match summary.stop {
                QueueStop::Drained => {
                    let state = read_state(store).await?;
                    if state.state == LifecycleState::Degraded
                        && state.degraded_reason.as_deref() == Some(EMBEDDING_BUDGET_REASON)
                    {
                        transition(store, LifecycleState::Ready, None).await?;
                    }
                }
                QueueStop::TimeBudget | QueueStop::CountBudget => self.schedule_embedding(&handle),
                QueueStop::Cancelled | QueueStop::Skipped => {}
            }
            Ok::<_, anyhow::Error>(summary)
        }
        .await;

        match run {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.settle(store, Err(err)).await?;
                Ok(skipped)
            }
        }
    }

    // ---- query ----

    /// Ranked top-`top_k` chunks for `text`.
    pub async fn query_similar(&self, workspace_id: &str, text: &str, top_k: usize) -> Result<Vec<RankedHit>> {
        let handle = self.handle(workspace_id);
        let slot = self.slot(&handle).await?;
        let store = &slot.store;

        let (key, vector) = self.inner.selector.embed_query(text).await;
        let allow_native = read_state(store).await?.vector_backfill_complete;
        let hits = match slot.search.query(store, &key, &vector, top_k, allow_native).await {
            Ok(hits) => hits,
            Err(err) => {
                self.record(store, &err).await;
                return Err(err.into());
            }
        };
        debug!(workspace = workspace_id, model = %key, hits = hits.len(), "vector query");
        Ok(rank_with_store(store, hits, now_millis()).await)
    }

    // ---- control ----

    /// Set the pause flag and stop in-flight work at its next boundary.
    /// Watcher events keep accumulating.
    pub async fn pause(&self, workspace_id: &str, reason: Option<&str>) -> Result<Status> {
        let handle = self.handle(workspace_id);
        let slot = match self.slot(&handle).await {
            Ok(slot) => slot,
            Err(err) => return Ok(unavailable(workspace_id, &err)),
        };
        if slot.store.is_writable() {
            let result = set_paused(&slot.store, true, reason).await.map_err(Into::into);
            self.settle(&slot.store, result).await?;
            self.inner.registry.cancel(workspace_id);
        }
        Ok(self.get_status(workspace_id).await)
    }

    /// Clear the pause flag and drain the events collected meanwhile.
    pub async fn resume(&self, workspace_id: &str) -> Result<ResumeReport> {
        let handle = self.handle(workspace_id);
        let slot = match self.slot(&handle).await {
            Ok(slot) => slot,
            Err(err) => {
                return Ok(ResumeReport {
                    status: unavailable(workspace_id, &err),
                    drained: IndexSummary::default(),
                })
            }
        };
        let mut drained = IndexSummary::default();
        if slot.store.is_writable() {
            let result = set_paused(&slot.store, false, None).await.map_err(Into::into);
            self.settle(&slot.store, result).await?;
            drained = self.flush_pending(workspace_id).await?;
        }
        Ok(ResumeReport {
            status: self.get_status(workspace_id).await,
            drained,
        })
    }

    /// Discard the store and start over from a fresh schema in `idle`.
    ///
    /// Pending watcher events survive; they flush after the next full scan.
    pub async fn rebuild(&self, workspace_id: &str, reason: Option<&str>) -> Result<Status> {
        let handle = self.handle(workspace_id);
        info!(workspace = workspace_id, reason = reason.unwrap_or(""), "rebuilding index");

        if let Some(open) = handle.slot.lock().await.as_ref() {
            if open.store.is_writable() {
                if let Err(err) = set_rebuilding(&open.store, true).await {
                    warn!(workspace = workspace_id, "could not set rebuilding flag: {}", err);
                }
            }
        }
        self.inner.registry.cancel(workspace_id);
        handle.flush_task.cancel();
        handle.embed_task.cancel();
        self.close_slot(&handle).await;

        remove_store_files(&self.inner.config.db.store_path(workspace_id))?;
        Ok(self.get_status(workspace_id).await)
    }

    /// Convert legacy JSON vectors in one bounded run.
    pub async fn trigger_vector_backfill(&self, workspace_id: &str) -> Result<Status> {
        let handle = self.handle(workspace_id);
        let slot = match self.slot(&handle).await {
            Ok(slot) => slot,
            Err(err) => return Ok(unavailable(workspace_id, &err)),
        };
        let store = &slot.store;
        let result = async {
            if !self.writes_allowed(store).await? {
                return Ok(());
            }
            let token = self.inner.registry.token(workspace_id);
            let options = BackfillOptions::from_config(&self.inner.config.backfill);
            run_backfill(store, &options, &token).await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        self.settle(store, result).await?;
        Ok(self.get_status(workspace_id).await)
    }

    /// Drop the workspace: cancel its work, forget its events and delete
    /// the store files.
    pub async fn delete_index(&self, workspace_id: &str) -> Result<()> {
        let handle = lock(&self.inner.workspaces).remove(workspace_id);
        self.inner.registry.cancel(workspace_id);
        if let Some(handle) = handle {
            handle.flush_task.cancel();
            handle.embed_task.cancel();
            self.close_slot(&handle).await;
        }
        remove_store_files(&self.inner.config.db.store_path(workspace_id))?;
        info!(workspace = workspace_id, "deleted index");
        Ok(())
    }
}

fn unavailable(workspace_id: &str, err: &StoreError) -> Status {
    let mut status = Status::unavailable(workspace_id, state_for_error(err.kind));
    status.last_error_code = Some(err.kind.as_code().to_string());
    status.last_error_message = Some(err.message.clone());
    status
}

fn normalize_all(roots: &RootMap, inputs: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(inputs.len());
    for input in inputs {
        match roots.normalize(input) {
            Some(path) => out.push(path),
            None => warn!(path = %input, "path is outside every known root; ignoring"),
        }
    }
    out.sort();
    out.dedup();
    out
}
