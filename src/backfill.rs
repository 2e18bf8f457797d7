//! Vector backfill: legacy JSON vectors to canonical BLOBs.
//!
//! Runs in bounded batches, each converted in its own immediate
//! transaction. `backfillingVectorIndex` is set while a run is active and
//! `vectorBackfillComplete` once no legacy row remains; after that every
//! call is a no-op. Every non-BLOB row counts as legacy; rows that do not
//! hold a parsable JSON vector (bad text, stray numbers, NULL) are removed
//! so the embedding queue re-embeds their chunks.

use std::time::{Duration, Instant};

use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BackfillConfig;
use crate::control::{read_state, set_backfill_flags};
use crate::db::{begin_immediate, finish, retry_busy, WorkspaceStore};
use crate::embedding::{parse_legacy_vector, vec_to_blob};
use crate::error::StoreResult;

/// Rows the backfill still has to convert or drop.
const LEGACY_ROW: &str = "workspaceId = ? AND typeof(vector) != 'blob'";

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub batch_size: usize,
    pub time_budget: Duration,
}

impl BackfillOptions {
    pub fn from_config(config: &BackfillConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            time_budget: Duration::from_millis(config.time_budget_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub converted: usize,
    pub dropped: usize,
    pub remaining: i64,
    pub complete: bool,
}

pub async fn run_backfill(
    store: &WorkspaceStore,
    options: &BackfillOptions,
    token: &CancellationToken,
) -> StoreResult<BackfillReport> {
    store.ensure_writable()?;
    if read_state(store).await?.vector_backfill_complete {
        return Ok(BackfillReport {
            complete: true,
            ..BackfillReport::default()
        });
    }

    set_backfill_flags(store, true, None).await?;
    let outcome = convert_batches(store, options, token).await;
    let report = match outcome {
        Ok(mut report) => {
            report.remaining = legacy_count(store).await?;
            report.complete = report.remaining == 0;
            report
        }
        Err(err) => {
            if let Err(flag_err) = set_backfill_flags(store, false, None).await {
                warn!("could not clear backfill flag: {}", flag_err);
            }
            return Err(err);
        }
    };
    set_backfill_flags(store, false, report.complete.then_some(true)).await?;

    info!(
        workspace = store.workspace_id(),
        converted = report.converted,
        dropped = report.dropped,
        remaining = report.remaining,
        complete = report.complete,
        "vector backfill"
    );
    Ok(report)
}

async fn convert_batches(
    store: &WorkspaceStore,
    options: &BackfillOptions,
    token: &CancellationToken,
) -> StoreResult<BackfillReport> {
    let started = Instant::now();
    let mut report = BackfillReport::default();
    loop {
        if token.is_cancelled() || started.elapsed() > options.time_budget {
            break;
        }
        let sql = format!(
            "SELECT rowid, CAST(vector AS TEXT) AS text FROM embeddings WHERE {} LIMIT ?",
            LEGACY_ROW
        );
        let rows = sqlx::query(&sql)
            .bind(store.workspace_id())
            .bind(options.batch_size as i64)
            .fetch_all(store.pool())
            .await?;
        if rows.is_empty() {
            break;
        }

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let rowid: i64 = row.try_get("rowid")?;
            let text: Option<String> = row.try_get("text")?;
            let blob = text
                .as_deref()
                .and_then(parse_legacy_vector)
                .map(|v| vec_to_blob(&v));
            batch.push((rowid, blob));
        }

        let (converted, dropped) =
            retry_busy(store.busy_retries(), || convert_batch(store, &batch)).await?;
        report.converted += converted;
        report.dropped += dropped;
    }
    Ok(report)
}

async fn convert_batch(
    store: &WorkspaceStore,
    batch: &[(i64, Option<Vec<u8>>)],
) -> StoreResult<(usize, usize)> {
    let mut conn = begin_immediate(store.pool()).await?;
    let outcome: StoreResult<(usize, usize)> = async {
        let (mut converted, mut dropped) = (0, 0);
        for (rowid, blob) in batch {
            match blob {
                Some(blob) => {
                    sqlx::query("UPDATE embeddings SET vector = ? WHERE rowid = ?")
                        .bind(blob)
                        .bind(rowid)
                        .execute(&mut *conn)
                        .await?;
                    converted += 1;
                }
                None => {
                    sqlx::query("DELETE FROM embeddings WHERE rowid = ?")
                        .bind(rowid)
                        .execute(&mut *conn)
                        .await?;
                    dropped += 1;
                }
            }
        }
        Ok((converted, dropped))
    }
    .await;
    finish(conn, outcome).await
}

async fn legacy_count(store: &WorkspaceStore) -> StoreResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM embeddings WHERE {}", LEGACY_ROW);
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(store.workspace_id())
        .fetch_one(store.pool())
        .await?;
    Ok(count)
}
