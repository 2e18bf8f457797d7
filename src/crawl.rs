//! Workspace crawler and crawl reconciliation.
//!
//! [`crawl`] walks each root depth-first and produces canonical identities
//! for every folder and file it keeps. Identities have the form
//! `rootId/relative/posix/path`, where `rootId` is derived from the root's
//! canonical `file://` URI, so they do not depend on the OS separator.
//!
//! # Ignore rules
//!
//! Every directory may carry ignore files (`.gitignore`, `.recallignore`
//! by default). Each one becomes an [`ignore::gitignore::Gitignore`]
//! rooted at its directory and layered on top of the inherited stack. The
//! deepest layer with a match decides, so a nested `!pattern` re-includes
//! what an ancestor ignored. Ignored directories are pruned, not descended.
//!
//! # Reconciliation
//!
//! [`reconcile`] writes a crawl into the store. A rediscovered file only
//! gets its disk metadata refreshed; content hash, status and index time
//! belong to the indexer. Stale rows are tombstoned only after a complete
//! crawl, so a truncated pass never deletes subtrees it did not reach. A
//! tombstone forgets the content hash, so a revived file is indexed again.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::CrawlConfig;
use crate::db::{begin_immediate, finish, retry_busy, WorkspaceStore};
use crate::error::StoreResult;

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub max_files: usize,
    pub time_budget: Duration,
    pub ignore_files: Vec<String>,
    pub exclude: Vec<String>,
}

impl CrawlOptions {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            max_files: config.max_files,
            time_budget: config.time_budget(),
            ignore_files: config.ignore_files.clone(),
            exclude: config.exclude.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledRoot {
    pub root_id: String,
    pub uri: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledFolder {
    pub path: String,
    pub parent_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledFile {
    pub path: String,
    pub folder_path: String,
    pub mtime: i64,
    pub size: i64,
    pub language_id: &'static str,
}

/// Why a crawl stopped before visiting everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    FileCap,
    TimeBudget,
    Cancelled,
}

impl Truncation {
    pub fn reason(&self) -> &'static str {
        match self {
            Truncation::FileCap => "crawl file cap reached",
            Truncation::TimeBudget => "crawl time budget exceeded",
            Truncation::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    pub roots: Vec<CrawledRoot>,
    pub folders: Vec<CrawledFolder>,
    pub files: Vec<CrawledFile>,
    pub visited_files: usize,
    pub truncation: Option<Truncation>,
}

impl CrawlOutcome {
    pub fn is_complete(&self) -> bool {
        self.truncation.is_none()
    }
}

/// First 16 hex digits of the SHA-256 of a root URI.
pub fn root_id(uri: &str) -> String {
    let digest = Sha256::digest(uri.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Canonicalize `path` and build its `file://` URI.
pub fn root_uri(path: &Path) -> Result<(PathBuf, String)> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Workspace root does not exist: {}", path.display()))?;
    let mut posix = canonical.to_string_lossy().replace('\\', "/");
    if !posix.starts_with('/') {
        posix.insert(0, '/');
    }
    Ok((canonical, format!("file://{}", posix)))
}

pub fn describe_root(path: &Path) -> Result<CrawledRoot> {
    let (canonical, uri) = root_uri(path)?;
    if !canonical.is_dir() {
        bail!("Workspace root is not a directory: {}", canonical.display());
    }
    Ok(CrawledRoot {
        root_id: root_id(&uri),
        uri,
        path: canonical,
    })
}

fn posix_relative(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}

/// Maps canonical identities to disk paths and back for a set of roots.
#[derive(Debug, Clone, Default)]
pub struct RootMap {
    roots: Vec<(String, PathBuf)>,
}

impl RootMap {
    pub fn from_roots(roots: &[CrawledRoot]) -> Self {
        Self {
            roots: roots
                .iter()
                .map(|r| (r.root_id.clone(), r.path.clone()))
                .collect(),
        }
    }

    pub async fn load(store: &WorkspaceStore) -> StoreResult<Self> {
        let rows = sqlx::query("SELECT rootId, uri FROM roots WHERE workspaceId = ? ORDER BY rootId")
            .bind(store.workspace_id())
            .fetch_all(store.pool())
            .await?;
        let mut roots = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("rootId")?;
            let uri: String = row.try_get("uri")?;
            let path = uri.strip_prefix("file://").unwrap_or(&uri);
            roots.push((id, PathBuf::from(path)));
        }
        Ok(Self { roots })
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Disk location of a canonical identity, if its root is known.
    pub fn resolve(&self, canonical: &str) -> Option<PathBuf> {
        let (root, rel) = match canonical.split_once('/') {
            Some((root, rel)) => (root, rel),
            None => (canonical, ""),
        };
        let (_, base) = self.roots.iter().find(|(id, _)| id == root)?;
        let mut path = base.clone();
        for part in rel.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        Some(path)
    }

    /// Canonical identity of a disk path under one of the roots.
    pub fn identify(&self, path: &Path) -> Option<String> {
        let absolute = canonical_or_parent(path);
        for (id, base) in &self.roots {
            if let Some(rel) = posix_relative(&absolute, base) {
                if rel.is_empty() {
                    return Some(id.clone());
                }
                return Some(format!("{}/{}", id, rel));
            }
        }
        None
    }

    /// Accept either an absolute disk path or a canonical identity.
    pub fn normalize(&self, input: &str) -> Option<String> {
        let as_path = Path::new(input);
        if as_path.is_absolute() {
            return self.identify(as_path);
        }
        let root = input.split('/').next().unwrap_or_default();
        if self.roots.iter().any(|(id, _)| id == root) {
            Some(input.trim_end_matches('/').to_string())
        } else {
            None
        }
    }
}

/// Deleted files cannot be canonicalized; fall back to their parent.
fn canonical_or_parent(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => parent.join(name),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

pub fn language_id(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "sh" | "bash" => "shellscript",
        "md" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "html" => "html",
        "css" => "css",
        "sql" => "sql",
        _ => "plaintext",
    }
}

/// Gitignore rules contributed by one directory: its ignore files, or
/// the configured excludes for a root.
#[derive(Debug, Clone)]
pub struct IgnoreLayer {
    gitignore: Gitignore,
}

impl IgnoreLayer {
    fn build(builder: &GitignoreBuilder, dir: &Path) -> Self {
        let gitignore = match builder.build() {
            Ok(gitignore) => gitignore,
            Err(err) => {
                warn!(dir = %dir.display(), "ignoring unusable ignore rules: {}", err);
                Gitignore::empty()
            }
        };
        Self { gitignore }
    }

    /// Rules given as gitignore lines, scoped to `dir`. Malformed lines are
    /// skipped.
    pub fn from_lines<S: AsRef<str>>(dir: &Path, lines: &[S]) -> Self {
        let mut builder = GitignoreBuilder::new(dir);
        for line in lines {
            if let Err(err) = builder.add_line(None, line.as_ref()) {
                warn!(pattern = line.as_ref(), "skipping ignore pattern: {}", err);
            }
        }
        Self::build(&builder, dir)
    }

    /// Rules from the ignore files named `names` found in `dir`.
    pub fn load(dir: &Path, names: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(dir);
        for name in names {
            let file = dir.join(name);
            if !file.is_file() {
                continue;
            }
            if let Some(err) = builder.add(&file) {
                warn!(file = %file.display(), "partially read ignore file: {}", err);
            }
        }
        Self::build(&builder, dir)
    }

    pub fn is_empty(&self) -> bool {
        self.gitignore.is_empty()
    }

    /// `Some(true)` if the last matching rule ignores `path`,
    /// `Some(false)` if it re-includes it, `None` if nothing matched.
    pub fn decide(&self, path: &Path, is_dir: bool) -> Option<bool> {
        match self.gitignore.matched(path, is_dir) {
            Match::None => None,
            Match::Ignore(_) => Some(true),
            Match::Whitelist(_) => Some(false),
        }
    }
}

/// Inherited layers, root-most first, tagged with the walk depth of the
/// directory that contributed them.
#[derive(Debug, Default)]
struct IgnoreStack {
    layers: Vec<(usize, IgnoreLayer)>,
}

impl IgnoreStack {
    fn push(&mut self, depth: usize, layer: IgnoreLayer) {
        if !layer.is_empty() {
            self.layers.push((depth, layer));
        }
    }

    /// Drop layers contributed by directories that are not ancestors of an
    /// entry at `depth`.
    fn enter(&mut self, depth: usize) {
        while matches!(self.layers.last(), Some((d, _)) if *d >= depth) {
            self.layers.pop();
        }
    }

    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let mut ignored = false;
        for (_, layer) in &self.layers {
            if let Some(decision) = layer.decide(path, is_dir) {
                ignored = decision;
            }
        }
        ignored
    }
}

fn mtime_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn join_identity(root_id: &str, rel: &str) -> String {
    if rel.is_empty() {
        root_id.to_string()
    } else {
        format!("{}/{}", root_id, rel)
    }
}

fn parent_identity(root_id: &str, rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((parent, _)) => join_identity(root_id, parent),
        None => root_id.to_string(),
    }
}

/// Walk `roots` and collect every folder and file not ignored.
///
/// Blocking; run it on a blocking thread from async code. Stops early on
/// the file cap, the time budget or cancellation and records why in
/// [`CrawlOutcome::truncation`].
pub fn crawl(
    roots: &[PathBuf],
    options: &CrawlOptions,
    token: &CancellationToken,
) -> Result<CrawlOutcome> {
    let started = Instant::now();
    let mut outcome = CrawlOutcome::default();
    'roots: for root_path in roots {
        let root = describe_root(root_path)?;
        outcome.roots.push(root.clone());
        outcome.folders.push(CrawledFolder {
            path: root.root_id.clone(),
            parent_path: String::new(),
        });

        let mut stack = IgnoreStack::default();
        stack.push(0, IgnoreLayer::from_lines(&root.path, options.exclude.as_slice()));
        stack.push(0, IgnoreLayer::load(&root.path, &options.ignore_files));

        let mut walker = WalkDir::new(&root.path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            if token.is_cancelled() {
                outcome.truncation = Some(Truncation::Cancelled);
            } else if started.elapsed() > options.time_budget {
                outcome.truncation = Some(Truncation::TimeBudget);
            }
            if outcome.truncation.is_some() {
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("crawl: skipping unreadable entry: {}", err);
                    continue;
                }
            };
            let depth = entry.depth();
            if depth == 0 {
                continue;
            }
            let Some(rel) = posix_relative(entry.path(), &root.path) else {
                continue;
            };

            let file_type = entry.file_type();
            let is_dir = file_type.is_dir();
            stack.enter(depth);
            if stack.is_ignored(entry.path(), is_dir) {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            if is_dir {
                outcome.folders.push(CrawledFolder {
                    path: join_identity(&root.root_id, &rel),
                    parent_path: parent_identity(&root.root_id, &rel),
                });
                stack.push(depth, IgnoreLayer::load(entry.path(), &options.ignore_files));
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            if outcome.visited_files >= options.max_files {
                outcome.truncation = Some(Truncation::FileCap);
                break 'roots;
            }
            outcome.visited_files += 1;

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %entry.path().display(), "crawl: no metadata: {}", err);
                    continue;
                }
            };
            outcome.files.push(CrawledFile {
                path: join_identity(&root.root_id, &rel),
                folder_path: parent_identity(&root.root_id, &rel),
                mtime: mtime_millis(&metadata),
                size: metadata.len() as i64,
                language_id: language_id(&rel),
            });
        }

        if outcome.truncation.is_some() {
            break;
        }
    }

    debug!(
        files = outcome.files.len(),
        folders = outcome.folders.len(),
        truncation = ?outcome.truncation,
        "crawl finished in {:?}",
        started.elapsed()
    );
    Ok(outcome)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub new_files: usize,
    pub updated_files: usize,
    pub deleted_files: usize,
    pub deleted_folders: usize,
}

/// Soft-delete a file row and drop its chunks and embeddings.
///
/// The row loses its content hash and indexed status, so a file that
/// reappears later is always re-chunked.
pub(crate) async fn tombstone_file(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    path: &str,
) -> StoreResult<()> {
    sqlx::query("DELETE FROM embeddings WHERE workspaceId = ? AND filePath = ?")
        .bind(workspace_id)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE workspaceId = ? AND filePath = ?")
        .bind(workspace_id)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
        UPDATE files SET deleted = 1, status = 'discovered', hash = NULL, lastIndexedTime = NULL
        WHERE workspaceId = ? AND path = ?
        "#,
    )
        .bind(workspace_id)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn under_roots(path: &str, root_ids: &HashSet<&str>) -> bool {
    let root = path.split('/').next().unwrap_or_default();
    root_ids.contains(root)
}

/// Write a crawl into the store in one immediate transaction.
pub async fn reconcile(store: &WorkspaceStore, outcome: &CrawlOutcome) -> StoreResult<ReconcileSummary> {
    store.ensure_writable()?;
    let summary = retry_busy(store.busy_retries(), || reconcile_once(store, outcome)).await?;
    info!(
        workspace = store.workspace_id(),
        new = summary.new_files,
        updated = summary.updated_files,
        deleted = summary.deleted_files,
        complete = outcome.is_complete(),
        "reconciled crawl"
    );
    Ok(summary)
}

async fn reconcile_once(store: &WorkspaceStore, outcome: &CrawlOutcome) -> StoreResult<ReconcileSummary> {
    let ws = store.workspace_id();
    let mut conn = begin_immediate(store.pool()).await?;

    let result: StoreResult<ReconcileSummary> = async {
        let mut summary = ReconcileSummary::default();

        for root in &outcome.roots {
            sqlx::query("INSERT OR IGNORE INTO roots (workspaceId, rootId, uri) VALUES (?, ?, ?)")
                .bind(ws)
                .bind(&root.root_id)
                .bind(&root.uri)
                .execute(&mut *conn)
                .await?;
        }

        for folder in &outcome.folders {
            sqlx::query(
                r#"
                INSERT INTO folders (workspaceId, path, parentPath, status)
                VALUES (?, ?, ?, 'discovered')
                ON CONFLICT(workspaceId, path) DO UPDATE SET parentPath = excluded.parentPath
                "#,
            )
            .bind(ws)
            .bind(&folder.path)
            .bind(&folder.parent_path)
            .execute(&mut *conn)
            .await?;
        }

        let rows = sqlx::query("SELECT path, deleted FROM files WHERE workspaceId = ?")
            .bind(ws)
            .fetch_all(&mut *conn)
            .await?;
        let mut existing: HashMap<String, bool> = HashMap::with_capacity(rows.len());
        for row in rows {
            existing.insert(row.try_get("path")?, row.try_get::<i64, _>("deleted")? != 0);
        }

        for file in &outcome.files {
            if existing.contains_key(&file.path) {
                summary.updated_files += 1;
            } else {
                summary.new_files += 1;
            }
            sqlx::query(
                r#"
                INSERT INTO files (workspaceId, path, folderPath, mtime, size, languageId, status, deleted)
                VALUES (?, ?, ?, ?, ?, ?, 'discovered', 0)
                ON CONFLICT(workspaceId, path) DO UPDATE SET
                    folderPath = excluded.folderPath,
                    mtime = excluded.mtime,
                    size = excluded.size,
                    languageId = excluded.languageId,
                    deleted = 0
                "#,
            )
            .bind(ws)
            .bind(&file.path)
            .bind(&file.folder_path)
            .bind(file.mtime)
            .bind(file.size)
            .bind(file.language_id)
            .execute(&mut *conn)
            .await?;
        }

        if outcome.is_complete() {
            let root_ids: HashSet<&str> = outcome.roots.iter().map(|r| r.root_id.as_str()).collect();
            let seen: HashSet<&str> = outcome.files.iter().map(|f| f.path.as_str()).collect();
            for (path, deleted) in &existing {
                if !deleted && under_roots(path, &root_ids) && !seen.contains(path.as_str()) {
                    tombstone_file(&mut conn, ws, path).await?;
                    summary.deleted_files += 1;
                }
            }

            let seen_folders: HashSet<&str> =
                outcome.folders.iter().map(|f| f.path.as_str()).collect();
            let folder_rows: Vec<String> =
                sqlx::query_scalar("SELECT path FROM folders WHERE workspaceId = ?")
                    .bind(ws)
                    .fetch_all(&mut *conn)
                    .await?;
            for path in folder_rows {
                if under_roots(&path, &root_ids) && !seen_folders.contains(path.as_str()) {
                    sqlx::query("DELETE FROM folders WHERE workspaceId = ? AND path = ?")
                        .bind(ws)
                        .bind(&path)
                        .execute(&mut *conn)
                        .await?;
                    summary.deleted_folders += 1;
                }
            }
        }

        Ok(summary)
    }
    .await;

    finish(conn, result).await
}
