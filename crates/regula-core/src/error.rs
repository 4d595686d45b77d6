//! Error types for regula.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using regula's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for regula operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Compliance check record not found
    #[error("Check not found: {0}")]
    CheckNotFound(Uuid),

    /// Embedding job not found
    #[error("Embedding job not found: {0}")]
    JobNotFound(Uuid),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Compliance scan failed
    #[error("Scan error: {0}")]
    Scan(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Organization has used its monthly allowance
    #[error("Quota exceeded for organization {organization_id}: monthly limit {limit}")]
    QuotaExceeded { organization_id: Uuid, limit: i64 },

    /// Record is not in a state that allows the requested transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Change-notification subscription or stream transport failed
    #[error("Stream error: {0}")]
    Stream(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_check_not_found() {
        let id = Uuid::nil();
        let err = Error::CheckNotFound(id);
        assert_eq!(err.to_string(), format!("Check not found: {}", id));
    }

    #[test]
    fn test_error_display_job_not_found() {
        let id = Uuid::new_v4();
        let err = Error::JobNotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_error_display_quota_exceeded() {
        let org = Uuid::nil();
        let err = Error::QuotaExceeded {
            organization_id: org,
            limit: 100,
        };
        assert_eq!(
            err.to_string(),
            format!("Quota exceeded for organization {}: monthly limit 100", org)
        );
    }

    #[test]
    fn test_error_display_scan() {
        let err = Error::Scan("provider timeout".to_string());
        assert_eq!(err.to_string(), "Scan error: provider timeout");
    }

    #[test]
    fn test_error_display_stream() {
        let err = Error::Stream("subscription closed".to_string());
        assert_eq!(err.to_string(), "Stream error: subscription closed");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
