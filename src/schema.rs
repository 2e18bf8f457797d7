//! Schema creation and version migration.
//!
//! The version marker is the `workspaces` row of the workspace. Version 2
//! is the first workspace-scoped layout; anything older cannot be migrated
//! and has to be rebuilt. Each later version only adds columns or indexes,
//! so a migration is a list of "add if missing" deltas applied in one
//! immediate transaction together with the marker update.

use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::db::{begin_immediate, finish};
use crate::error::{ErrorKind, StoreError, StoreResult};

pub const CURRENT_SCHEMA_VERSION: i64 = 4;
pub const MIN_SUPPORTED_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    Created,
    Migrated { from: i64 },
    Current,
    /// Newer schema on disk; the store may only be read.
    ReadOnly,
}

const CURRENT_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        lastIndexedTime INTEGER,
        schemaVersion INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_state (
        workspaceId TEXT PRIMARY KEY,
        state TEXT NOT NULL DEFAULT 'idle',
        lastFullScanTime INTEGER,
        lastEmbeddingRunTime INTEGER,
        lastErrorCode TEXT,
        lastErrorMessage TEXT,
        vectorBackfillComplete INTEGER NOT NULL DEFAULT 0,
        paused INTEGER NOT NULL DEFAULT 0,
        pausedReason TEXT,
        degradedReason TEXT,
        rebuilding INTEGER NOT NULL DEFAULT 0,
        backfillingVectorIndex INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS roots (
        workspaceId TEXT NOT NULL,
        rootId TEXT NOT NULL,
        uri TEXT NOT NULL,
        PRIMARY KEY (workspaceId, rootId)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS folders (
        workspaceId TEXT NOT NULL,
        path TEXT NOT NULL,
        parentPath TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'discovered',
        PRIMARY KEY (workspaceId, path)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        workspaceId TEXT NOT NULL,
        path TEXT NOT NULL,
        folderPath TEXT NOT NULL,
        mtime INTEGER NOT NULL DEFAULT 0,
        size INTEGER NOT NULL DEFAULT 0,
        languageId TEXT NOT NULL DEFAULT 'plaintext',
        hash TEXT,
        status TEXT NOT NULL DEFAULT 'discovered',
        lastIndexedTime INTEGER,
        deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (workspaceId, path)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        workspaceId TEXT NOT NULL,
        filePath TEXT NOT NULL,
        chunkId TEXT NOT NULL,
        startLine INTEGER NOT NULL,
        endLine INTEGER NOT NULL,
        content TEXT NOT NULL,
        contentHash TEXT NOT NULL,
        PRIMARY KEY (workspaceId, filePath, chunkId)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        workspaceId TEXT NOT NULL,
        filePath TEXT NOT NULL,
        chunkId TEXT NOT NULL,
        contentHash TEXT NOT NULL,
        embeddingModel TEXT NOT NULL,
        embeddingVersion TEXT NOT NULL,
        vector BLOB NOT NULL,
        createdAt INTEGER NOT NULL,
        PRIMARY KEY (workspaceId, filePath, chunkId, embeddingModel, embeddingVersion)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_files_folder ON files(workspaceId, folderPath)",
    "CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(workspaceId, embeddingModel, embeddingVersion)",
];

/// Columns introduced at a version: `(table, column, definition)`.
type ColumnDelta = (&'static str, &'static str, &'static str);

const V3_COLUMNS: &[ColumnDelta] = &[
    ("index_state", "paused", "INTEGER NOT NULL DEFAULT 0"),
    ("index_state", "pausedReason", "TEXT"),
    ("index_state", "degradedReason", "TEXT"),
    ("index_state", "rebuilding", "INTEGER NOT NULL DEFAULT 0"),
    ("files", "deleted", "INTEGER NOT NULL DEFAULT 0"),
];

const V4_COLUMNS: &[ColumnDelta] = &[
    ("index_state", "vectorBackfillComplete", "INTEGER NOT NULL DEFAULT 0"),
    ("index_state", "backfillingVectorIndex", "INTEGER NOT NULL DEFAULT 0"),
];

const V4_STATEMENTS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(workspaceId, embeddingModel, embeddingVersion)",
];

/// Tables that existed before stores were scoped by workspace.
const LEGACY_TABLES: &[&str] = &["files", "chunks", "embeddings"];

#[derive(Debug, PartialEq, Eq)]
enum StoredVersion {
    Empty,
    Legacy,
    Version(i64),
}

/// Create or migrate the store so it matches [`CURRENT_SCHEMA_VERSION`].
///
/// Idempotent and cheap when the store is already current. Nothing is
/// written when the result is `FutureSchema` or `OldSchema`.
pub async fn ensure_schema(pool: &SqlitePool, workspace_id: &str) -> StoreResult<SchemaOutcome> {
    match read_version(pool, workspace_id).await? {
        StoredVersion::Empty => {
            create_current(pool, workspace_id).await?;
            info!(workspace = workspace_id, "created store schema v{}", CURRENT_SCHEMA_VERSION);
            Ok(SchemaOutcome::Created)
        }
        StoredVersion::Legacy => Err(StoreError::new(
            ErrorKind::OldSchema,
            "store predates workspace-scoped schema; rebuild required",
        )),
        StoredVersion::Version(v) if v > CURRENT_SCHEMA_VERSION => Err(StoreError::new(
            ErrorKind::FutureSchema,
            format!(
                "store schema v{} is newer than supported v{}",
                v, CURRENT_SCHEMA_VERSION
            ),
        )),
        StoredVersion::Version(v) if v < MIN_SUPPORTED_SCHEMA_VERSION => Err(StoreError::new(
            ErrorKind::OldSchema,
            format!("store schema v{} cannot be migrated; rebuild required", v),
        )),
        StoredVersion::Version(v) if v == CURRENT_SCHEMA_VERSION => {
            ensure_workspace_rows(pool, workspace_id).await?;
            Ok(SchemaOutcome::Current)
        }
        StoredVersion::Version(v) => {
            migrate(pool, workspace_id, v).await?;
            info!(
                workspace = workspace_id,
                "migrated store schema v{} -> v{}", v, CURRENT_SCHEMA_VERSION
            );
            Ok(SchemaOutcome::Migrated { from: v })
        }
    }
}

async fn read_version(pool: &SqlitePool, workspace_id: &str) -> StoreResult<StoredVersion> {
    if !table_exists(pool, "workspaces").await? {
        for table in LEGACY_TABLES {
            if table_exists(pool, table).await? {
                return Ok(StoredVersion::Legacy);
            }
        }
        return Ok(StoredVersion::Empty);
    }

    let own: Option<i64> = sqlx::query_scalar("SELECT schemaVersion FROM workspaces WHERE id = ?")
        .bind(workspace_id)
        .fetch_optional(pool)
        .await?;
    if let Some(version) = own {
        return Ok(StoredVersion::Version(version));
    }

    let any: Option<i64> = sqlx::query_scalar("SELECT MAX(schemaVersion) FROM workspaces")
        .fetch_one(pool)
        .await?;
    Ok(match any {
        Some(version) => StoredVersion::Version(version),
        None => StoredVersion::Empty,
    })
}

async fn table_exists(pool: &SqlitePool, name: &str) -> StoreResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

async fn create_current(pool: &SqlitePool, workspace_id: &str) -> StoreResult<()> {
    let mut conn = begin_immediate(pool).await?;
    let outcome: StoreResult<()> = async {
        for statement in CURRENT_SCHEMA {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        insert_workspace_rows(&mut conn, workspace_id).await?;
        // A store created by this writer only ever holds canonical vectors.
        sqlx::query("UPDATE index_state SET vectorBackfillComplete = 1 WHERE workspaceId = ?")
            .bind(workspace_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
    .await;
    finish(conn, outcome).await
}

async fn ensure_workspace_rows(pool: &SqlitePool, workspace_id: &str) -> StoreResult<()> {
    let present: bool = sqlx::query_scalar(
        r#"
        SELECT (SELECT COUNT(*) FROM workspaces WHERE id = ?1) > 0
           AND (SELECT COUNT(*) FROM index_state WHERE workspaceId = ?1) > 0
        "#,
    )
    .bind(workspace_id)
    .fetch_one(pool)
    .await?;
    if present {
        return Ok(());
    }

    let mut conn = begin_immediate(pool).await?;
    let outcome = insert_workspace_rows(&mut conn, workspace_id).await;
    finish(conn, outcome).await
}

async fn insert_workspace_rows(conn: &mut SqliteConnection, workspace_id: &str) -> StoreResult<()> {
    sqlx::query("INSERT OR IGNORE INTO workspaces (id, schemaVersion) VALUES (?, ?)")
        .bind(workspace_id)
        .bind(CURRENT_SCHEMA_VERSION)
        .execute(&mut *conn)
        .await?;
    sqlx::query("INSERT OR IGNORE INTO index_state (workspaceId, state) VALUES (?, 'idle')")
        .bind(workspace_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Bring a v2+ store to the current layout. Every delta since the first
/// supported version is re-applied, not just those after `from`: a marker
/// can claim a version whose columns were only partly added.
async fn migrate(pool: &SqlitePool, workspace_id: &str, from: i64) -> StoreResult<()> {
    debug!(workspace = workspace_id, from, "applying schema deltas");
    let mut conn = begin_immediate(pool).await?;
    let outcome: StoreResult<()> = async {
        for target in (MIN_SUPPORTED_SCHEMA_VERSION + 1)..=CURRENT_SCHEMA_VERSION {
            let (columns, statements) = deltas_for(target);
            for (table, column, definition) in columns {
                add_column_if_missing(&mut conn, table, column, definition).await?;
            }
            for statement in statements {
                sqlx::query(statement).execute(&mut *conn).await?;
            }
        }
        sqlx::query("INSERT OR IGNORE INTO workspaces (id, schemaVersion) VALUES (?, ?)")
            .bind(workspace_id)
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(&mut *conn)
            .await?;
        sqlx::query("UPDATE workspaces SET schemaVersion = ?")
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(&mut *conn)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO index_state (workspaceId, state) VALUES (?, 'idle')")
            .bind(workspace_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
    .await;
    finish(conn, outcome).await
}

fn deltas_for(version: i64) -> (&'static [ColumnDelta], &'static [&'static str]) {
    match version {
        3 => (V3_COLUMNS, &[]),
        4 => (V4_COLUMNS, V4_STATEMENTS),
        _ => (&[], &[]),
    }
}

async fn add_column_if_missing(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    definition: &str,
) -> StoreResult<()> {
    let columns = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(&mut *conn)
        .await?;
    for row in &columns {
        let name: String = row.try_get("name")?;
        if name == column {
            return Ok(());
        }
    }
    sqlx::query(&format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table, column, definition
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}
