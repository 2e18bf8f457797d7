//! Embedding runtimes and vector encoding.
//!
//! An [`EmbeddingRuntime`] turns chunk text into fixed-width vectors and is
//! versioned by a [`ModelKey`] so vectors from different runtimes never mix.
//! Two implementations exist:
//! - **[`HashRuntime`]**: deterministic SHA-256 feature hashing. Always
//!   available and the fallback for every batch.
//! - **`LocalRuntime`**: a fastembed model, behind the
//!   `local-embeddings-fastembed` feature.
//!
//! [`RuntimeSelector`] picks the preferred runtime once at startup and falls
//! back to the hash runtime per call, so a transient failure degrades one
//! batch and not the pipeline.
//!
//! Vectors are stored as little-endian `f32` BLOBs ([`vec_to_blob`]).
//! Older stores kept them as JSON arrays; [`parse_legacy_vector`] reads
//! those until the vector backfill has converted them.

#[cfg(feature = "local-embeddings-fastembed")]
mod local;

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalRuntime;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::EmbeddingConfig;

pub const HASH_MODEL_ID: &str = "hash-sha256";
pub const HASH_VERSION: &str = "1";
pub const HASH_DEFAULT_DIMS: usize = 256;

/// The `(embeddingModel, embeddingVersion)` pair a vector belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model: String,
    pub version: String,
}

impl ModelKey {
    pub fn new(model: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.model, self.version)
    }
}

#[async_trait]
pub trait EmbeddingRuntime: Send + Sync {
    fn model_id(&self) -> &str;
    fn version(&self) -> &str;
    fn dims(&self) -> usize;

    /// One vector per input text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn key(&self) -> ModelKey {
        ModelKey::new(self.model_id(), self.version())
    }
}

/// Feature-hashing runtime.
///
/// Each token (a run of alphanumerics or `_`, lowercased) is hashed with
/// SHA-256; the first four bytes pick a bucket and the fifth a sign. The
/// summed vector is L2-normalised, so texts sharing tokens have a higher
/// cosine similarity. Text without tokens maps to the zero vector.
#[derive(Debug, Clone)]
pub struct HashRuntime {
    dims: usize,
}

impl Default for HashRuntime {
    fn default() -> Self {
        Self::new(HASH_DEFAULT_DIMS)
    }
}

impl HashRuntime {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dims;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingRuntime for HashRuntime {
    fn model_id(&self) -> &str {
        HASH_MODEL_ID
    }

    fn version(&self) -> &str {
        HASH_VERSION
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Vectors plus the runtime that actually produced them.
#[derive(Debug, Clone)]
pub struct Embedded {
    pub key: ModelKey,
    pub vectors: Vec<Vec<f32>>,
    pub fallback: bool,
}

/// Preferred runtime with a per-call hash fallback.
#[derive(Clone)]
pub struct RuntimeSelector {
    preferred: Arc<dyn EmbeddingRuntime>,
    fallback: HashRuntime,
}

impl std::fmt::Debug for RuntimeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSelector")
            .field("preferred", &self.preferred.key())
            .field("fallback", &self.fallback.key())
            .finish()
    }
}

impl RuntimeSelector {
    pub fn new(preferred: Arc<dyn EmbeddingRuntime>) -> Self {
        Self {
            preferred,
            fallback: HashRuntime::default(),
        }
    }

    /// Build the selector named by `embedding.provider`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        match config.provider.as_str() {
            "hash" => {
                let dims = config.dims.unwrap_or(HASH_DEFAULT_DIMS);
                Ok(Self {
                    preferred: Arc::new(HashRuntime::new(dims)),
                    fallback: HashRuntime::new(dims),
                })
            }
            #[cfg(feature = "local-embeddings-fastembed")]
            "local" => Ok(Self::new(Arc::new(LocalRuntime::new(config)?))),
            #[cfg(not(feature = "local-embeddings-fastembed"))]
            "local" => {
                warn!(
                    "embedding.provider = \"local\" requires --features local-embeddings-fastembed; \
                     using the hash runtime"
                );
                Ok(Self::new(Arc::new(HashRuntime::default())))
            }
            other => anyhow::bail!("Unknown embedding provider: {}", other),
        }
    }

    pub fn preferred_key(&self) -> ModelKey {
        self.preferred.key()
    }

    pub fn fallback_key(&self) -> ModelKey {
        self.fallback.key()
    }

    /// Embed with the preferred runtime, or the hash runtime if it fails
    /// or returns vectors of the wrong shape.
    pub async fn embed_batch(&self, texts: &[String]) -> Embedded {
        let preferred = self.preferred.key();
        if preferred == self.fallback.key() && self.preferred.dims() == self.fallback.dims() {
            return self.embed_fallback(texts, false);
        }

        match self.preferred.embed(texts).await {
            Ok(vectors) if well_formed(&vectors, texts.len(), self.preferred.dims()) => Embedded {
                key: preferred,
                vectors,
                fallback: false,
            },
            Ok(vectors) => {
                warn!(
                    runtime = %preferred,
                    expected = texts.len(),
                    got = vectors.len(),
                    "embedding runtime returned malformed vectors; using hash fallback"
                );
                self.embed_fallback(texts, true)
            }
            Err(err) => {
                warn!(runtime = %preferred, "embedding runtime failed, using hash fallback: {:#}", err);
                self.embed_fallback(texts, true)
            }
        }
    }

    pub async fn embed_query(&self, text: &str) -> (ModelKey, Vec<f32>) {
        let embedded = self.embed_batch(&[text.to_string()]).await;
        let vector = embedded.vectors.into_iter().next().unwrap_or_default();
        (embedded.key, vector)
    }

    fn embed_fallback(&self, texts: &[String], fallback: bool) -> Embedded {
        Embedded {
            key: self.fallback.key(),
            vectors: texts.iter().map(|t| self.fallback.embed_one(t)).collect(),
            fallback,
        }
    }
}

fn well_formed(vectors: &[Vec<f32>], count: usize, dims: usize) -> bool {
    vectors.len() == count
        && vectors
            .iter()
            .all(|v| v.len() == dims && v.iter().all(|x| x.is_finite()))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`]. Trailing partial floats are dropped.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Parse a legacy JSON-array vector.
pub fn parse_legacy_vector(text: &str) -> Option<Vec<f32>> {
    serde_json::from_str::<Vec<f32>>(text.trim()).ok()
}

/// Cosine similarity in `[-1, 1]`; 0 for empty, mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
