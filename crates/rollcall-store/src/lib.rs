//! Persistence layer for rollcalld
//!
//! Provides:
//! - Sessions, unique per (meet code, day)
//! - Participant records, unique per (session, user), advanced only by guarded writes
//! - Submission tokens, consumed at most once
//! - Audit log (append-only)

mod audit;
mod models;
mod sqlite;
mod traits;

pub use audit::*;
pub use models::*;
pub use sqlite::*;
pub use traits::*;

use rollcall_util::RollcallError;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A unique index rejected the write; someone else got there first
    #[error("Constraint conflict: {0}")]
    Conflict(String),

    /// Database busy, locked, or could not be opened
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::ConstraintViolation => StoreError::Conflict(e.to_string()),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                    StoreError::Unavailable(e.to_string())
                }
                _ => StoreError::Database(e.to_string()),
            },
            rusqlite::Error::FromSqlConversionFailure(..) => {
                StoreError::Serialization(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for RollcallError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => RollcallError::StorageConflict(msg),
            StoreError::Unavailable(msg) => RollcallError::StorageUnavailable(msg),
            StoreError::NotFound(msg) => RollcallError::SessionNotFound(msg),
            other => RollcallError::Store(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_maps_to_retryable() {
        let err: RollcallError = StoreError::Unavailable("database is locked".into()).into();
        assert!(err.is_retryable());

        let err: RollcallError = StoreError::Database("syntax error".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn busy_sqlite_failure_is_unavailable() {
        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StoreError::from(e), StoreError::Unavailable(_)));

        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(matches!(StoreError::from(e), StoreError::Conflict(_)));
    }
}
