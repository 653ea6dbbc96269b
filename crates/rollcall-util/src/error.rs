//! Error types for rollcall

use thiserror::Error;

use crate::{SessionId, SubjectId};

/// Core error type for reconciliation operations
#[derive(Debug, Error)]
pub enum RollcallError {
    /// Submission is missing required fields; rejected before any persistence
    #[error("Validation error: {0}")]
    Validation(String),

    /// A scraped name could not be matched to a roster member
    #[error("Identity unresolved: {0}")]
    IdentityUnresolved(String),

    /// Duplicate-key race on a unique index. Resolved by re-reading, never surfaced to callers.
    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    /// Storage could not be reached; the caller may retry
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Instructor not detected for session {0}")]
    InstructorNotDetected(SessionId),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Subject not found: {0}")]
    SubjectNotFound(SubjectId),

    #[error("Token not found")]
    TokenNotFound,

    #[error("Token already consumed")]
    TokenAlreadyConsumed,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token not yet valid")]
    TokenNotYetValid,

    #[error("Token does not match submission: {0}")]
    TokenMismatch(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RollcallError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Only storage outages are worth retrying; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, RollcallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(RollcallError::unavailable("db locked").is_retryable());
        assert!(!RollcallError::validation("missing meetCode").is_retryable());
        assert!(!RollcallError::StorageConflict("dup".into()).is_retryable());
        assert!(!RollcallError::TokenAlreadyConsumed.is_retryable());
    }
}
