//! Error types for the records crate.

use thiserror::Error;

/// Storage error type covering every persistence failure mode.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Path error.
    #[error("invalid database path: {0}")]
    InvalidPath(String),

    /// A uniqueness constraint was violated.
    #[error("record already exists: {0}")]
    Conflict(String),

    /// Connection mutex poisoned by a panicking holder.
    #[error("database connection lock poisoned")]
    LockPoisoned,
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Map a SQLite constraint violation onto [`StoreError::Conflict`].
    pub(crate) fn from_insert(err: rusqlite::Error, what: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(what.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}
