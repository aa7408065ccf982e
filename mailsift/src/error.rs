//! Unified error types for the sync engine
//!
//! Each variant corresponds to one way a sync cycle can fail, so the
//! pipeline can decide between retrying a chunk, replaying a commit,
//! rebuilding the index, or aborting the cycle.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum MailsiftError {
    /// Connection loss or I/O failure talking to a collaborator; the chunk is retried.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// An invariant between metadata and index was violated during commit.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// The persisted index could not be loaded; recovered by rebuilding.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("State directory is locked: {0}")]
    Locked(String),

    #[error("Sync cancelled")]
    Cancelled,
}

impl MailsiftError {
    /// Errors that justify retrying the same chunk after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MailsiftError::TransientIo(_) | MailsiftError::Timeout(_))
    }

    /// Errors that must abort the whole cycle instead of failing a single chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MailsiftError::Auth(_)
                | MailsiftError::Config(_)
                | MailsiftError::Locked(_)
                | MailsiftError::Cancelled
        )
    }
}

// Implement From for common error types

impl From<std::io::Error> for MailsiftError {
    fn from(err: std::io::Error) -> Self {
        MailsiftError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for MailsiftError {
    fn from(err: rusqlite::Error) -> Self {
        // A busy or locked database past busy_timeout is a commit timeout
        if let rusqlite::Error::SqliteFailure(ref code, _) = err {
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return MailsiftError::Timeout(format!("database busy: {}", err));
            }
        }
        MailsiftError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for MailsiftError {
    fn from(err: r2d2::Error) -> Self {
        MailsiftError::Database(err.to_string())
    }
}

impl From<toml::de::Error> for MailsiftError {
    fn from(err: toml::de::Error) -> Self {
        MailsiftError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MailsiftError {
    fn from(err: serde_json::Error) -> Self {
        MailsiftError::Parse(err.to_string())
    }
}

impl From<regex::Error> for MailsiftError {
    fn from(err: regex::Error) -> Self {
        MailsiftError::InvalidInput(format!("invalid regex: {}", err))
    }
}

impl From<reqwest::Error> for MailsiftError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MailsiftError::Timeout(err.to_string())
        } else {
            MailsiftError::Embedding(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for MailsiftError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        MailsiftError::Timeout(err.to_string())
    }
}

/// Result type alias using MailsiftError
pub type Result<T> = std::result::Result<T, MailsiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MailsiftError::TransientIo("reset".into()).is_retryable());
        assert!(MailsiftError::Timeout("fetch".into()).is_retryable());
        assert!(!MailsiftError::Embedding("model".into()).is_retryable());
        assert!(!MailsiftError::Auth("bad password".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MailsiftError::Auth("denied".into()).is_fatal());
        assert!(MailsiftError::Cancelled.is_fatal());
        assert!(!MailsiftError::Consistency("slot".into()).is_fatal());
        assert!(!MailsiftError::CorruptIndex("checksum".into()).is_fatal());
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let json = serde_json::to_string(&MailsiftError::Auth("nope".into())).unwrap();
        assert_eq!(json, r#"{"type":"Auth","message":"nope"}"#);
    }

    #[test]
    fn test_busy_database_maps_to_timeout() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(MailsiftError::from(err), MailsiftError::Timeout(_)));
    }
}
