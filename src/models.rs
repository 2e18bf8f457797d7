//! Records shared across the indexing and retrieval pipeline.
//!
//! Everything that crosses a module boundary lives here: chunk rows,
//! search hits, run summaries and the [`Status`] snapshot handed to
//! callers of the engine.

use serde::Serialize;

/// Lifecycle of a file row. Crawls insert `discovered`; only the indexer
/// moves a file to `indexed` or `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Discovered,
    Indexed,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Discovered => "discovered",
            FileStatus::Indexed => "indexed",
            FileStatus::Error => "error",
        }
    }
}

/// `index_state.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Building,
    Ready,
    Degraded,
    Error,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Building => "building",
            LifecycleState::Ready => "ready",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Error => "error",
        }
    }

    /// Unknown values read back as `Error` so a damaged row is visible.
    pub fn parse(value: &str) -> Self {
        match value {
            "idle" => LifecycleState::Idle,
            "building" => LifecycleState::Building,
            "ready" => LifecycleState::Ready,
            "degraded" => LifecycleState::Degraded,
            _ => LifecycleState::Error,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `index_state` row, read fresh before every state-changing operation.
#[derive(Debug, Clone, Serialize)]
pub struct IndexState {
    pub state: LifecycleState,
    pub last_full_scan_time: Option<i64>,
    pub last_embedding_run_time: Option<i64>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub paused: bool,
    pub paused_reason: Option<String>,
    pub degraded_reason: Option<String>,
    pub rebuilding: bool,
    pub vector_backfill_complete: bool,
    pub backfilling_vector_index: bool,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            state: LifecycleState::Idle,
            last_full_scan_time: None,
            last_embedding_run_time: None,
            last_error_code: None,
            last_error_message: None,
            paused: false,
            paused_reason: None,
            degraded_reason: None,
            rebuilding: false,
            vector_backfill_complete: false,
            backfilling_vector_index: false,
        }
    }
}

/// A contiguous line range of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_path: String,
    pub chunk_id: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub content: String,
    pub content_hash: String,
}

/// Raw similarity hit from the vector backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub file_path: String,
    pub chunk_id: String,
    /// Clamped to `[0, 1]`.
    pub similarity: f32,
}

/// A hit after composite ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedHit {
    pub file_path: String,
    pub chunk_id: String,
    pub similarity: f32,
    pub score: f64,
}

/// Outcome of one `index_paths` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub reindexed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: usize,
    pub written_chunks: usize,
    /// Paths left for a later call (budget, time or cancellation).
    pub deferred: Vec<String>,
}

impl IndexSummary {
    pub fn merge(&mut self, other: IndexSummary) {
        self.reindexed += other.reindexed;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.written_chunks += other.written_chunks;
        self.deferred.extend(other.deferred);
    }
}

/// Why an embedding run ended before its backlog was empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStop {
    Drained,
    TimeBudget,
    CountBudget,
    Cancelled,
    /// Not started: paused, rebuilding, read-only, or already running.
    Skipped,
}

/// Outcome of one embedding-queue run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub embedded: usize,
    pub batches: usize,
    /// Batches produced by the fallback runtime instead of the preferred one.
    pub fallback_batches: usize,
    /// Vectors discarded because their chunk changed mid-run.
    pub dropped: usize,
    pub stop: QueueStop,
}

impl Default for QueueSummary {
    fn default() -> Self {
        Self {
            embedded: 0,
            batches: 0,
            fallback_batches: 0,
            dropped: 0,
            stop: QueueStop::Drained,
        }
    }
}

/// Snapshot returned by every engine operation.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub workspace_id: String,
    pub state: LifecycleState,
    pub paused: bool,
    pub paused_reason: Option<String>,
    pub rebuilding: bool,
    pub degraded_reason: Option<String>,
    pub last_full_scan_time: Option<i64>,
    pub last_embedding_run_time: Option<i64>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub vector_backfill_complete: bool,
    pub backfilling_vector_index: bool,
    pub total_files: i64,
    pub indexed_files: i64,
    pub total_chunks: i64,
    pub embedded_chunks: i64,
    /// False when the store was written by a newer schema.
    pub writable: bool,
}

impl Status {
    /// Status for a workspace whose store cannot be read.
    pub fn unavailable(workspace_id: &str, state: LifecycleState) -> Self {
        Self::from_state(workspace_id, &IndexState { state, ..IndexState::default() })
    }

    pub fn from_state(workspace_id: &str, index_state: &IndexState) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            state: index_state.state,
            paused: index_state.paused,
            paused_reason: index_state.paused_reason.clone(),
            rebuilding: index_state.rebuilding,
            degraded_reason: index_state.degraded_reason.clone(),
            last_full_scan_time: index_state.last_full_scan_time,
            last_embedding_run_time: index_state.last_embedding_run_time,
            last_error_code: index_state.last_error_code.clone(),
            last_error_message: index_state.last_error_message.clone(),
            vector_backfill_complete: index_state.vector_backfill_complete,
            backfilling_vector_index: index_state.backfilling_vector_index,
            total_files: 0,
            indexed_files: 0,
            total_chunks: 0,
            embedded_chunks: 0,
            writable: false,
        }
    }
}

/// Result of `resume`: the status afterwards and what the drain did.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeReport {
    pub status: Status,
    pub drained: IndexSummary,
}

/// Current time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
