//! TOML configuration.
//!
//! Every section is optional and falls back to its [`Default`], so
//! `Config::default()` is a valid configuration for library use and an
//! empty file is a valid configuration for the CLI.
//!
//! ```toml
//! [db]
//! dir = "./.recall"
//!
//! [chunking]
//! max_lines = 200
//! overlap = 20
//!
//! [embedding]
//! provider = "hash"   # or "local" with the fastembed feature
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    pub crawl: CrawlConfig,
    pub indexing: IndexingConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub watcher: WatcherConfig,
    pub backfill: BackfillConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DbConfig {
    /// Directory holding one `<workspace>.sqlite` file per workspace.
    pub dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.recall"),
        }
    }
}

impl DbConfig {
    /// Store file of a workspace. Distinct ids always get distinct files.
    pub fn store_path(&self, workspace_id: &str) -> PathBuf {
        self.dir.join(format!("{}.sqlite", file_stem(workspace_id)))
    }
}

fn is_stem_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

/// Ids made only of portable characters are used verbatim. Anything else
/// is sanitized and tagged with `~` plus a digest of the raw id; `~` never
/// appears in a verbatim stem, so the two forms cannot collide.
fn file_stem(workspace_id: &str) -> String {
    if !workspace_id.is_empty() && workspace_id.chars().all(is_stem_char) {
        return workspace_id.to_string();
    }
    let sanitized: String = workspace_id
        .chars()
        .map(|c| if is_stem_char(c) { c } else { '_' })
        .collect();
    let digest = Sha256::digest(workspace_id.as_bytes());
    format!("{}~{}", sanitized, &hex::encode(digest)[..16])
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_lines: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_lines: 200,
            overlap: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlConfig {
    /// Hard cap on files visited per crawl.
    pub max_files: usize,
    pub time_budget_secs: u64,
    /// Per-directory ignore files, gitignore syntax.
    pub ignore_files: Vec<String>,
    /// Root-most ignore rules applied to every root, gitignore syntax.
    pub exclude: Vec<String>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_files: 50_000,
            time_budget_secs: 120,
            ignore_files: vec![".gitignore".to_string(), ".recallignore".to_string()],
            exclude: vec![
                ".git/".to_string(),
                "node_modules/".to_string(),
                "target/".to_string(),
            ],
        }
    }
}

impl CrawlConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexingConfig {
    /// Maximum chunk rows written by one `index_paths` call.
    pub chunk_budget: usize,
    pub time_budget_secs: u64,
    /// Attempts for a transaction that hits SQLITE_BUSY/LOCKED.
    pub busy_retries: u32,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_budget: 20_000,
            time_budget_secs: 60,
            busy_retries: 5,
        }
    }
}

impl IndexingConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"hash"` (deterministic, always available) or `"local"` (fastembed).
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    pub batch_size: usize,
    pub max_per_run: usize,
    pub time_budget_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_per_run: 5_000,
            time_budget_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// SQLite extension providing the native distance function, if any.
    #[serde(default)]
    pub extension: Option<String>,
    pub distance_function: String,
    /// `"cosine"` or `"l2"`: how the native distance maps to similarity.
    pub metric: String,
    pub probe_timeout_ms: u64,
    /// Upper bound on vectors visited by the linear scan.
    pub max_scan: usize,
    pub time_budget_ms: u64,
    pub page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            extension: None,
            distance_function: "vec_distance_cosine".to_string(),
            metric: "cosine".to_string(),
            probe_timeout_ms: 250,
            max_scan: 250_000,
            time_budget_ms: 2_000,
            page_size: 512,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
    pub embed_debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            embed_debounce_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackfillConfig {
    pub batch_size: usize,
    pub time_budget_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            time_budget_ms: 2_000,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_lines == 0 {
        bail!("chunking.max_lines must be > 0");
    }
    if config.chunking.overlap >= config.chunking.max_lines {
        bail!("chunking.overlap must be smaller than chunking.max_lines");
    }
    if config.indexing.chunk_budget == 0 {
        bail!("indexing.chunk_budget must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.search.page_size == 0 {
        bail!("search.page_size must be > 0");
    }
    if config.backfill.batch_size == 0 {
        bail!("backfill.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash or local.",
            other
        ),
    }

    match config.search.metric.as_str() {
        "cosine" | "l2" => {}
        other => bail!("Unknown search.metric: '{}'. Must be cosine or l2.", other),
    }

    Ok(())
}
