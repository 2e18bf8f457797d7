//! Top-K vector similarity search.
//!
//! Two backends answer the same question:
//!
//! - **Native**: a [`NativeDistance`] implementation computes distances
//!   inside SQLite (e.g. `vec_distance_cosine` from a loadable extension)
//!   and returns the `k` nearest rows. Availability is probed once with a
//!   trivial call under a short timeout and cached; any error or timeout
//!   means "unavailable".
//! - **Linear scan**: pages through the stored vectors in key order and
//!   keeps a bounded heap of the best `k` by raw cosine similarity, the
//!   same quantity the native distance orders by. Reads both
//!   canonical BLOBs and legacy JSON vectors. Bounded by a vector count
//!   and a wall-clock budget; hitting either returns the partial top-K.
//!
//! Both produce similarities clamped to `[0, 1]` and order hits by
//! similarity descending, then `filePath`, then `chunkId`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::{Row, SqlitePool};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::db::WorkspaceStore;
use crate::embedding::{blob_to_vec, cosine_similarity, parse_legacy_vector, vec_to_blob, ModelKey};
use crate::error::StoreResult;
use crate::models::VectorHit;

/// How a native distance maps back to cosine similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    /// `d = 1 - cos`.
    Cosine,
    /// Euclidean distance between unit vectors: `d² = 2 - 2cos`.
    L2,
}

impl DistanceMetric {
    pub fn parse(value: &str) -> Self {
        match value {
            "l2" => DistanceMetric::L2,
            _ => DistanceMetric::Cosine,
        }
    }

    pub fn to_similarity(&self, distance: f64) -> f32 {
        if !distance.is_finite() {
            return 0.0;
        }
        let similarity = match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::L2 => 1.0 - distance * distance / 2.0,
        };
        similarity.clamp(0.0, 1.0) as f32
    }
}

/// A nearest-neighbour row: `(filePath, chunkId, distance)`.
pub type NativeRow = (String, String, f64);

/// Accelerated distance backend.
#[async_trait]
pub trait NativeDistance: Send + Sync {
    fn metric(&self) -> DistanceMetric;

    /// One trivial functional call; `Err` means unavailable.
    async fn probe(&self, pool: &SqlitePool) -> Result<()>;

    /// Up to `k` rows ordered by distance, then `filePath`, then `chunkId`.
    async fn nearest(
        &self,
        store: &WorkspaceStore,
        key: &ModelKey,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<NativeRow>>;
}

/// Calls a scalar SQL distance function over BLOB vectors.
#[derive(Debug, Clone)]
pub struct SqlFunctionDistance {
    function: String,
    metric: DistanceMetric,
}

impl SqlFunctionDistance {
    pub fn new(function: &str, metric: DistanceMetric) -> Result<Self> {
        if function.is_empty() || !function.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("Invalid distance function name: '{}'", function);
        }
        Ok(Self {
            function: function.to_string(),
            metric,
        })
    }
}

#[async_trait]
impl NativeDistance for SqlFunctionDistance {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn probe(&self, pool: &SqlitePool) -> Result<()> {
        let sql = format!("SELECT {}(?, ?)", self.function);
        let distance: f64 = sqlx::query_scalar(&sql)
            .bind(vec_to_blob(&[1.0, 0.0]))
            .bind(vec_to_blob(&[0.0, 1.0]))
            .fetch_one(pool)
            .await?;
        if !distance.is_finite() {
            bail!("{} returned a non-finite distance", self.function);
        }
        Ok(())
    }

    async fn nearest(
        &self,
        store: &WorkspaceStore,
        key: &ModelKey,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<NativeRow>> {
        let sql = format!(
            r#"
            SELECT filePath, chunkId, {}(vector, ?) AS distance
            FROM embeddings
            WHERE workspaceId = ? AND embeddingModel = ? AND embeddingVersion = ?
            ORDER BY distance ASC, filePath ASC, chunkId ASC
            LIMIT ?
            "#,
            self.function
        );
        let rows = sqlx::query(&sql)
            .bind(vec_to_blob(query))
            .bind(store.workspace_id())
            .bind(&key.model)
            .bind(&key.version)
            .bind(k as i64)
            .fetch_all(store.pool())
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((
                row.try_get("filePath")?,
                row.try_get("chunkId")?,
                row.try_get::<Option<f64>, _>("distance")?.unwrap_or(f64::INFINITY),
            ));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub probe_timeout: Duration,
    pub max_scan: usize,
    pub time_budget: Duration,
    pub page_size: usize,
}

impl SearchOptions {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            max_scan: config.max_scan,
            time_budget: Duration::from_millis(config.time_budget_ms),
            page_size: config.page_size.max(1),
        }
    }
}

/// Search backend for one store. The native probe result lives as long as
/// this value, so create one per opened store.
pub struct VectorSearch {
    native: Option<Arc<dyn NativeDistance>>,
    available: OnceCell<bool>,
    options: SearchOptions,
}

impl VectorSearch {
    pub fn new(native: Option<Arc<dyn NativeDistance>>, options: SearchOptions) -> Self {
        Self {
            native,
            available: OnceCell::new(),
            options,
        }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        let native = match SqlFunctionDistance::new(
            &config.distance_function,
            DistanceMetric::parse(&config.metric),
        ) {
            Ok(native) => Some(Arc::new(native) as Arc<dyn NativeDistance>),
            Err(err) => {
                warn!("native vector search disabled: {}", err);
                None
            }
        };
        Self::new(native, SearchOptions::from_config(config))
    }

    /// Probe once; later calls return the cached answer.
    pub async fn native_available(&self, pool: &SqlitePool) -> bool {
        let Some(native) = &self.native else {
            return false;
        };
        *self
            .available
            .get_or_init(|| async {
                let available = matches!(
                    tokio::time::timeout(self.options.probe_timeout, native.probe(pool)).await,
                    Ok(Ok(()))
                );
                info!(available, "native vector distance probe");
                available
            })
            .await
    }

    /// Top-`k` hits for `query` among vectors of `key`.
    ///
    /// `allow_native` is false until every stored vector is canonical, so
    /// that both backends see the same rows.
    pub async fn query(
        &self,
        store: &WorkspaceStore,
        key: &ModelKey,
        query: &[f32],
        k: usize,
        allow_native: bool,
    ) -> StoreResult<Vec<VectorHit>> {
        if k == 0 || !usable_query(query) {
            return Ok(Vec::new());
        }

        if allow_native && self.native_available(store.pool()).await {
            if let Some(native) = &self.native {
                match native.nearest(store, key, query, k).await {
                    Ok(rows) => return Ok(native_hits(rows, native.metric())),
                    Err(err) => warn!("native vector query failed, scanning: {:#}", err),
                }
            }
        }

        self.linear_scan(store, key, query, k).await
    }

    async fn linear_scan(
        &self,
        store: &WorkspaceStore,
        key: &ModelKey,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<VectorHit>> {
        let started = Instant::now();
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        let mut cursor = (String::new(), String::new());
        let mut scanned = 0usize;

        'pages: loop {
            let (after_path, after_chunk) = cursor.clone();
            let mut rows = sqlx::query(
                r#"
                SELECT filePath, chunkId, typeof(vector) AS kind, CAST(vector AS BLOB) AS bytes
                FROM embeddings
                WHERE workspaceId = ? AND embeddingModel = ? AND embeddingVersion = ?
                  AND (filePath > ? OR (filePath = ? AND chunkId > ?))
                ORDER BY filePath, chunkId
                LIMIT ?
                "#,
            )
            .bind(store.workspace_id())
            .bind(&key.model)
            .bind(&key.version)
            .bind(after_path.clone())
            .bind(after_path)
            .bind(after_chunk)
            .bind(self.options.page_size as i64)
            .fetch(store.pool());

            let mut page_rows = 0usize;
            while let Some(row) = rows.try_next().await? {
                if scanned >= self.options.max_scan || started.elapsed() > self.options.time_budget {
                    debug!(scanned, "linear scan budget reached");
                    break 'pages;
                }
                page_rows += 1;
                scanned += 1;

                let file_path: String = row.try_get("filePath")?;
                let chunk_id: String = row.try_get("chunkId")?;
                let kind: String = row.try_get("kind")?;
                let bytes: Vec<u8> = row.try_get("bytes")?;
                cursor = (file_path.clone(), chunk_id.clone());

                let Some(vector) = decode_stored(&kind, &bytes) else {
                    continue;
                };
                if vector.len() != query.len() {
                    continue;
                }
                let cosine = cosine_similarity(query, &vector);
                let candidate = Candidate {
                    cosine: if cosine.is_finite() { cosine } else { f32::NEG_INFINITY },
                    file_path,
                    chunk_id,
                };
                offer(&mut heap, candidate, k);
            }

            if page_rows < self.options.page_size {
                break;
            }
        }

        // Clamping only after selection keeps the top-K set identical to the
        // native path when several candidates have negative cosine.
        let mut hits: Vec<VectorHit> = heap
            .into_vec()
            .into_iter()
            .map(|c| VectorHit {
                file_path: c.file_path,
                chunk_id: c.chunk_id,
                similarity: c.cosine.clamp(0.0, 1.0),
            })
            .collect();
        hits.sort_by(compare_hits);
        Ok(hits)
    }
}

fn usable_query(query: &[f32]) -> bool {
    !query.is_empty()
        && query.iter().all(|x| x.is_finite())
        && query.iter().any(|x| *x != 0.0)
}

/// A stored vector in either layout.
pub fn decode_stored(kind: &str, bytes: &[u8]) -> Option<Vec<f32>> {
    match kind {
        "blob" => Some(blob_to_vec(bytes)),
        "text" => std::str::from_utf8(bytes).ok().and_then(parse_legacy_vector),
        _ => None,
    }
}

fn native_hits(rows: Vec<NativeRow>, metric: DistanceMetric) -> Vec<VectorHit> {
    let mut hits: Vec<VectorHit> = rows
        .into_iter()
        .map(|(file_path, chunk_id, distance)| VectorHit {
            file_path,
            chunk_id,
            similarity: metric.to_similarity(distance),
        })
        .collect();
    hits.sort_by(compare_hits);
    hits
}

/// Similarity descending, then `filePath`, then `chunkId`.
pub fn compare_hits(a: &VectorHit, b: &VectorHit) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.file_path.cmp(&b.file_path))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Heap entry. Orders so that the worst candidate is the greatest and
/// therefore sits at the top of the max-heap.
#[derive(Debug, Clone)]
struct Candidate {
    cosine: f32,
    file_path: String,
    chunk_id: String,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cosine
            .total_cmp(&self.cosine)
            .then_with(|| self.file_path.cmp(&other.file_path))
            .then_with(|| self.chunk_id.cmp(&other.chunk_id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

fn offer(heap: &mut BinaryHeap<Candidate>, candidate: Candidate, k: usize) {
    if heap.len() < k {
        heap.push(candidate);
    } else if heap.peek().is_some_and(|worst| candidate < *worst) {
        heap.pop();
        heap.push(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn key() -> ModelKey {
        ModelKey::new("m", "1")
    }

    fn unit(v: &[f32]) -> Vec<f32> {
        let n = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / n).collect()
    }

    async fn open_store(tmp: &TempDir) -> WorkspaceStore {
        WorkspaceStore::open(&tmp.path().join("idx.sqlite"), "ws", &Config::default())
            .await
            .unwrap()
            .0
    }

    async fn put_blob(store: &WorkspaceStore, file: &str, chunk: &str, v: &[f32]) {
        sqlx::query("INSERT INTO embeddings VALUES ('ws', ?, ?, 'h', 'm', '1', ?, 0)")
            .bind(file)
            .bind(chunk)
            .bind(vec_to_blob(v))
            .execute(store.pool())
            .await
            .unwrap();
    }

    async fn put_json(store: &WorkspaceStore, file: &str, chunk: &str, v: &[f32]) {
        sqlx::query("INSERT INTO embeddings VALUES ('ws', ?, ?, 'h', 'm', '1', ?, 0)")
            .bind(file)
            .bind(chunk)
            .bind(serde_json::to_string(v).unwrap())
            .execute(store.pool())
            .await
            .unwrap();
    }

    fn options() -> SearchOptions {
        SearchOptions {
            probe_timeout: Duration::from_millis(250),
            max_scan: 10_000,
            time_budget: Duration::from_secs(5),
            page_size: 2,
        }
    }

    /// In-process stand-in for an extension: cosine distance over the
    /// canonical rows, ordered the way the SQL path orders them.
    struct InProcessDistance;

    #[async_trait]
    impl NativeDistance for InProcessDistance {
        fn metric(&self) -> DistanceMetric {
            DistanceMetric::Cosine
        }

        async fn probe(&self, _pool: &SqlitePool) -> Result<()> {
            Ok(())
        }

        async fn nearest(
            &self,
            store: &WorkspaceStore,
            key: &ModelKey,
            query: &[f32],
            k: usize,
        ) -> Result<Vec<NativeRow>> {
            let rows: Vec<(String, String, Vec<u8>)> = sqlx::query_as(
                "SELECT filePath, chunkId, vector FROM embeddings WHERE embeddingModel = ? AND embeddingVersion = ?",
            )
            .bind(&key.model)
            .bind(&key.version)
            .fetch_all(store.pool())
            .await?;
            let mut out: Vec<NativeRow> = rows
                .into_iter()
                .map(|(f, c, v)| (f, c, 1.0 - cosine_similarity(query, &blob_to_vec(&v)) as f64))
                .collect();
            out.sort_by(|a, b| {
                a.2.total_cmp(&b.2)
                    .then_with(|| a.0.cmp(&b.0))
                    .then_with(|| a.1.cmp(&b.1))
            });
            out.truncate(k);
            Ok(out)
        }
    }

    struct NeverAnswers;

    #[async_trait]
    impl NativeDistance for NeverAnswers {
        fn metric(&self) -> DistanceMetric {
            DistanceMetric::Cosine
        }
        async fn probe(&self, _pool: &SqlitePool) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn nearest(
            &self,
            _store: &WorkspaceStore,
            _key: &ModelKey,
            _query: &[f32],
            _k: usize,
        ) -> Result<Vec<NativeRow>> {
            bail!("should not be called")
        }
    }

    async fn seeded(tmp: &TempDir) -> WorkspaceStore {
        let store = open_store(tmp).await;
        let vectors = [
            ("r/a.rs", "r/a.rs:1-10", unit(&[1.0, 0.1, 0.0])),
            ("r/b.rs", "r/b.rs:1-10", unit(&[0.9, 0.4, 0.1])),
            ("r/c.rs", "r/c.rs:1-10", unit(&[0.0, 1.0, 0.0])),
            ("r/d.rs", "r/d.rs:1-10", unit(&[0.5, 0.5, 0.7])),
            ("r/e.rs", "r/e.rs:1-10", unit(&[-1.0, 0.0, 0.0])),
        ];
        for (f, c, v) in &vectors {
            put_blob(&store, f, c, v).await;
        }
        store
    }

    #[test]
    fn test_metric_conversion_is_clamped() {
        assert_eq!(DistanceMetric::Cosine.to_similarity(0.0), 1.0);
        assert_eq!(DistanceMetric::Cosine.to_similarity(1.5), 0.0);
        assert_eq!(DistanceMetric::L2.to_similarity(0.0), 1.0);
        assert!((DistanceMetric::L2.to_similarity(2f64.sqrt()) - 0.0).abs() < 1e-6);
        assert_eq!(DistanceMetric::Cosine.to_similarity(f64::NAN), 0.0);
    }

    #[test]
    fn test_distance_function_name_is_validated() {
        assert!(SqlFunctionDistance::new("vec_distance_cosine", DistanceMetric::Cosine).is_ok());
        assert!(SqlFunctionDistance::new("x); DROP TABLE files; --", DistanceMetric::Cosine).is_err());
    }

    #[tokio::test]
    async fn test_degenerate_queries_return_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let search = VectorSearch::new(None, options());
        assert!(search.query(&store, &key(), &[], 3, true).await.unwrap().is_empty());
        assert!(search.query(&store, &key(), &[0.0, 0.0, 0.0], 3, true).await.unwrap().is_empty());
        assert!(search.query(&store, &key(), &[f32::NAN, 1.0, 0.0], 3, true).await.unwrap().is_empty());
        assert!(search.query(&store, &key(), &[1.0, 0.0, 0.0], 0, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_linear_scan_orders_and_clamps() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let search = VectorSearch::new(None, options());
        let hits = search.query(&store, &key(), &[1.0, 0.0, 0.0], 5, true).await.unwrap();
        let files: Vec<&str> = hits.iter().map(|h| h.file_path.as_str()).collect();
        assert_eq!(files, vec!["r/a.rs", "r/b.rs", "r/d.rs", "r/c.rs", "r/e.rs"]);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.similarity)));
        assert_eq!(hits[4].similarity, 0.0);
    }

    #[tokio::test]
    async fn test_backends_agree() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let native = VectorSearch::new(Some(Arc::new(InProcessDistance)), options());
        let linear = VectorSearch::new(None, options());
        let query = unit(&[0.8, 0.3, 0.2]);

        for k in 1..=5 {
            let a = native.query(&store, &key(), &query, k, true).await.unwrap();
            let b = linear.query(&store, &key(), &query, k, true).await.unwrap();
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b.iter()) {
                assert_eq!((&x.file_path, &x.chunk_id), (&y.file_path, &y.chunk_id));
                assert!((x.similarity - y.similarity).abs() < 1e-5);
            }
        }
    }

    #[tokio::test]
    async fn test_backends_agree_below_zero_cosine() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        put_blob(&store, "r/a.rs", "r/a.rs:1-5", &[1.0, 0.0]).await;
        put_blob(&store, "r/b.rs", "r/b.rs:1-5", &[-1.0, 0.0]).await;
        put_blob(&store, "r/c.rs", "r/c.rs:1-5", &unit(&[-0.5, 1.0])).await;
        put_blob(&store, "r/z.rs", "r/z.rs:1-5", &unit(&[-0.1, 1.0])).await;
        let native = VectorSearch::new(Some(Arc::new(InProcessDistance)), options());
        let linear = VectorSearch::new(None, options());

        for k in 1..=4 {
            let a = native.query(&store, &key(), &[1.0, 0.0], k, true).await.unwrap();
            let b = linear.query(&store, &key(), &[1.0, 0.0], k, true).await.unwrap();
            let a: Vec<&str> = a.iter().map(|h| h.file_path.as_str()).collect();
            let b: Vec<&str> = b.iter().map(|h| h.file_path.as_str()).collect();
            assert_eq!(a, b, "k = {}", k);
        }
        let top2 = linear.query(&store, &key(), &[1.0, 0.0], 2, true).await.unwrap();
        assert_eq!(top2[1].file_path, "r/z.rs");
        assert_eq!(top2[1].similarity, 0.0);
    }

    #[tokio::test]
    async fn test_ties_break_by_path_then_chunk() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let v = unit(&[1.0, 1.0]);
        put_blob(&store, "r/z.rs", "r/z.rs:1-5", &v).await;
        put_blob(&store, "r/a.rs", "r/a.rs:9-12", &v).await;
        put_blob(&store, "r/a.rs", "r/a.rs:1-5", &v).await;

        let search = VectorSearch::new(None, options());
        let hits = search.query(&store, &key(), &v, 2, true).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["r/a.rs:1-5", "r/a.rs:9-12"]);
    }

    #[tokio::test]
    async fn test_scan_reads_legacy_json_vectors() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        put_json(&store, "r/old.rs", "r/old.rs:1-3", &[0.0, 1.0]).await;
        put_blob(&store, "r/new.rs", "r/new.rs:1-3", &[1.0, 0.0]).await;

        let search = VectorSearch::new(None, options());
        let hits = search.query(&store, &key(), &[0.0, 1.0], 1, false).await.unwrap();
        assert_eq!(hits[0].file_path, "r/old.rs");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_scan_budget_returns_partial_top_k() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let search = VectorSearch::new(
            None,
            SearchOptions {
                max_scan: 3,
                ..options()
            },
        );
        let hits = search.query(&store, &key(), &[0.0, 0.0, 1.0], 5, true).await.unwrap();
        // Only a, b and c were visited; d (the best match) was not.
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.file_path != "r/d.rs"));
    }

    #[tokio::test]
    async fn test_probe_timeout_means_unavailable() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let search = VectorSearch::new(
            Some(Arc::new(NeverAnswers)),
            SearchOptions {
                probe_timeout: Duration::from_millis(20),
                ..options()
            },
        );
        let hits = search.query(&store, &key(), &[1.0, 0.0, 0.0], 1, true).await.unwrap();
        assert_eq!(hits[0].file_path, "r/a.rs");
        assert!(!search.native_available(store.pool()).await);
    }

    #[tokio::test]
    async fn test_missing_sql_function_falls_back() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let search = VectorSearch::from_config(&SearchConfig {
            distance_function: "no_such_distance_fn".to_string(),
            ..SearchConfig::default()
        });
        assert!(!search.native_available(store.pool()).await);
        let hits = search.query(&store, &key(), &[1.0, 0.0, 0.0], 2, true).await.unwrap();
        assert_eq!(hits.len(), 2);
    }
}
