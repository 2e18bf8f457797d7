//! Storage error taxonomy.
//!
//! Every storage operation returns [`StoreResult`]. Raw driver errors are
//! turned into an [`ErrorKind`] by [`classify`], the one place that knows
//! about SQLite result codes and message text.

use std::fmt;

use thiserror::Error;

/// Classification of a storage failure, independent of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The store file cannot be opened. Treated as an idle, empty index.
    OpenFailure,
    /// SQLITE_BUSY / SQLITE_LOCKED. Retried, then surfaced as degraded.
    BusyOrLocked,
    /// Malformed database image. Requires a rebuild.
    Corrupt,
    /// Store written by a newer schema. Writes are refused.
    FutureSchema,
    /// Pre-workspace schema that cannot be migrated. Requires a rebuild.
    OldSchema,
    Other,
}

impl ErrorKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            ErrorKind::OpenFailure => "open_failure",
            ErrorKind::BusyOrLocked => "busy_or_locked",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::FutureSchema => "future_schema",
            ErrorKind::OldSchema => "old_schema",
            ErrorKind::Other => "other",
        }
    }

    /// Whether the store must be discarded before it can be written again.
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, ErrorKind::Corrupt | ErrorKind::OldSchema)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn read_only() -> Self {
        Self::new(
            ErrorKind::FutureSchema,
            "store was written by a newer schema; writes are disabled",
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self {
            kind: classify(&err),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::OpenFailure, err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_CANTOPEN: i32 = 14;
const SQLITE_NOTADB: i32 = 26;

/// Map a driver error onto an [`ErrorKind`].
pub fn classify(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            match primary {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => ErrorKind::BusyOrLocked,
                Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB) => ErrorKind::Corrupt,
                Some(SQLITE_CANTOPEN) => ErrorKind::OpenFailure,
                _ => classify_message(db.message()),
            }
        }
        sqlx::Error::PoolTimedOut => ErrorKind::BusyOrLocked,
        sqlx::Error::Io(_) | sqlx::Error::Configuration(_) => ErrorKind::OpenFailure,
        other => classify_message(&other.to_string()),
    }
}

fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("database is locked") || lower.contains("database table is locked") {
        ErrorKind::BusyOrLocked
    } else if lower.contains("malformed") || lower.contains("file is not a database") {
        ErrorKind::Corrupt
    } else if lower.contains("unable to open database") {
        ErrorKind::OpenFailure
    } else {
        ErrorKind::Other
    }
}
