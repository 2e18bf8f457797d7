//! Background embedding queue.
//!
//! Selects chunks whose vector for the preferred model is missing or stale
//! (stored `contentHash` differs from the chunk's), embeds them in batches
//! and writes each batch in its own immediate transaction. A run stops on
//! an empty batch, cancellation, its time budget or its count budget;
//! committed batches stay committed.
//!
//! Selection walks `(filePath, chunkId)` in key order and never goes back,
//! so a batch that fell back to the hash runtime (and is therefore still
//! stale for the preferred model) is not picked up again in the same run.
//!
//! A run has two passes. The first covers chunks that have no current
//! vector at all, neither preferred nor fallback. The second upgrades
//! chunks that only hold a fallback vector, and is skipped or cut short as
//! soon as the preferred runtime falls back again. An unavailable runtime
//! therefore never keeps the queue re-embedding the head of the backlog.

use std::time::{Duration, Instant};

use futures::TryStreamExt;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::db::{begin_immediate, finish, retry_busy, WorkspaceStore};
use crate::embedding::{vec_to_blob, Embedded, ModelKey, RuntimeSelector};
use crate::error::StoreResult;
use crate::models::{now_millis, QueueStop, QueueSummary};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub batch_size: usize,
    pub max_per_run: usize,
    pub time_budget: Duration,
}

impl QueueOptions {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_per_run: config.max_per_run,
            time_budget: config.time_budget(),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingChunk {
    file_path: String,
    chunk_id: String,
    content: String,
    content_hash: String,
}

const STALE_SELECT: &str = r#"
    SELECT c.filePath, c.chunkId, c.content, c.contentHash
    FROM chunks c
    LEFT JOIN embeddings e
      ON e.workspaceId = c.workspaceId
     AND e.filePath = c.filePath
     AND e.chunkId = c.chunkId
     AND e.embeddingModel = ?
     AND e.embeddingVersion = ?
    WHERE c.workspaceId = ?
      AND (e.chunkId IS NULL OR e.contentHash != c.contentHash)
      AND (? = 0 OR NOT EXISTS (
            SELECT 1 FROM embeddings f
            WHERE f.workspaceId = c.workspaceId
              AND f.filePath = c.filePath
              AND f.chunkId = c.chunkId
              AND f.embeddingModel = ?
              AND f.embeddingVersion = ?
              AND f.contentHash = c.contentHash))
      AND (c.filePath > ? OR (c.filePath = ? AND c.chunkId > ?))
    ORDER BY c.filePath, c.chunkId
    LIMIT ?
"#;

/// Chunks after `after` that are stale for `key`. With `covered`, chunks
/// holding a current vector for that key are left out as well.
async fn select_stale(
    store: &WorkspaceStore,
    key: &ModelKey,
    covered: Option<&ModelKey>,
    after: &(String, String),
    limit: usize,
) -> StoreResult<Vec<PendingChunk>> {
    let (skip_covered, covered_model, covered_version) = match covered {
        Some(covered) => (1i64, covered.model.as_str(), covered.version.as_str()),
        None => (0i64, "", ""),
    };
    let mut rows = sqlx::query(STALE_SELECT)
        .bind(&key.model)
        .bind(&key.version)
        .bind(store.workspace_id())
        .bind(skip_covered)
        .bind(covered_model)
        .bind(covered_version)
        .bind(&after.0)
        .bind(&after.0)
        .bind(&after.1)
        .bind(limit as i64)
        .fetch(store.pool());

    let mut batch = Vec::with_capacity(limit);
    while let Some(row) = rows.try_next().await? {
        batch.push(PendingChunk {
            file_path: row.try_get("filePath")?,
            chunk_id: row.try_get("chunkId")?,
            content: row.try_get("content")?,
            content_hash: row.try_get("contentHash")?,
        });
    }
    Ok(batch)
}

/// Number of chunks without a current vector for `key`.
pub async fn stale_count(store: &WorkspaceStore, key: &ModelKey) -> StoreResult<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM chunks c
        LEFT JOIN embeddings e
          ON e.workspaceId = c.workspaceId
         AND e.filePath = c.filePath
         AND e.chunkId = c.chunkId
         AND e.embeddingModel = ?
         AND e.embeddingVersion = ?
        WHERE c.workspaceId = ?
          AND (e.chunkId IS NULL OR e.contentHash != c.contentHash)
        "#,
    )
    .bind(&key.model)
    .bind(&key.version)
    .bind(store.workspace_id())
    .fetch_one(store.pool())
    .await?;
    Ok(count)
}

/// Write one embedded batch. Returns `(written, dropped)`.
async fn write_batch(
    store: &WorkspaceStore,
    batch: &[PendingChunk],
    embedded: &Embedded,
) -> StoreResult<(usize, usize)> {
    let ws = store.workspace_id();
    let created_at = now_millis();
    let mut conn = begin_immediate(store.pool()).await?;

    let outcome: StoreResult<(usize, usize)> = async {
        let mut written = 0usize;
        let mut dropped = 0usize;
        for (chunk, vector) in batch.iter().zip(embedded.vectors.iter()) {
            let current: Option<String> = sqlx::query_scalar(
                "SELECT contentHash FROM chunks WHERE workspaceId = ? AND filePath = ? AND chunkId = ?",
            )
            .bind(ws)
            .bind(&chunk.file_path)
            .bind(&chunk.chunk_id)
            .fetch_optional(&mut *conn)
            .await?;
            if current.as_deref() != Some(chunk.content_hash.as_str()) {
                dropped += 1;
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO embeddings
                    (workspaceId, filePath, chunkId, contentHash, embeddingModel, embeddingVersion, vector, createdAt)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(workspaceId, filePath, chunkId, embeddingModel, embeddingVersion) DO UPDATE SET
                    contentHash = excluded.contentHash,
                    vector = excluded.vector,
                    createdAt = excluded.createdAt
                "#,
            )
            .bind(ws)
            .bind(&chunk.file_path)
            .bind(&chunk.chunk_id)
            .bind(&chunk.content_hash)
            .bind(&embedded.key.model)
            .bind(&embedded.key.version)
            .bind(vec_to_blob(vector))
            .bind(created_at)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }
        Ok((written, dropped))
    }
    .await;

    finish(conn, outcome).await
}

async fn record_run_time(store: &WorkspaceStore) -> StoreResult<()> {
    sqlx::query("UPDATE index_state SET lastEmbeddingRunTime = ? WHERE workspaceId = ?")
        .bind(now_millis())
        .bind(store.workspace_id())
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Embed stale chunks until the backlog is empty or a budget runs out.
pub async fn run_embedding_queue(
    store: &WorkspaceStore,
    selector: &RuntimeSelector,
    options: &QueueOptions,
    token: &CancellationToken,
) -> StoreResult<QueueSummary> {
    store.ensure_writable()?;
    let started = Instant::now();
    let key = selector.preferred_key();
    let fallback_key = selector.fallback_key();
    let mut summary = QueueSummary::default();
    let mut cursor = (String::new(), String::new());
    let mut upgrading = false;
    let mut preferred_failing = false;

    loop {
        if token.is_cancelled() {
            summary.stop = QueueStop::Cancelled;
            break;
        }
        if started.elapsed() > options.time_budget {
            summary.stop = QueueStop::TimeBudget;
            break;
        }
        let remaining = options.max_per_run.saturating_sub(summary.embedded);
        if remaining == 0 {
            summary.stop = QueueStop::CountBudget;
            break;
        }

        let covered = (!upgrading).then_some(&fallback_key);
        let batch = select_stale(store, &key, covered, &cursor, options.batch_size.min(remaining)).await?;
        let Some(last) = batch.last() else {
            if upgrading || preferred_failing || key == fallback_key {
                summary.stop = QueueStop::Drained;
                break;
            }
            upgrading = true;
            cursor = (String::new(), String::new());
            continue;
        };
        let next_cursor = (last.file_path.clone(), last.chunk_id.clone());

        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let embedded = selector.embed_batch(&texts).await;
        let (written, dropped) =
            retry_busy(store.busy_retries(), || write_batch(store, &batch, &embedded)).await?;
        cursor = next_cursor;

        summary.batches += 1;
        summary.embedded += written;
        summary.dropped += dropped;
        if embedded.fallback {
            summary.fallback_batches += 1;
            preferred_failing = true;
        }
        debug!(
            workspace = store.workspace_id(),
            model = %embedded.key,
            written,
            dropped,
            upgrading,
            "embedded batch"
        );
        if upgrading && embedded.fallback {
            summary.stop = QueueStop::Drained;
            break;
        }
    }

    if let Err(err) = retry_busy(store.busy_retries(), || record_run_time(store)).await {
        warn!(workspace = store.workspace_id(), "could not record embedding run time: {}", err);
    }

    info!(
        workspace = store.workspace_id(),
        embedded = summary.embedded,
        batches = summary.batches,
        fallback_batches = summary.fallback_batches,
        stop = ?summary.stop,
        "embedding run finished in {:?}",
        started.elapsed()
    );
    Ok(summary)
}
