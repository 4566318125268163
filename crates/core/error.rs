//! Error types for the backlog job engine.

use thiserror::Error;

use crate::job::JobState;

/// The main error type for the backlog engine.
#[derive(Error, Debug)]
pub enum BacklogError {
    /// Optimistic-concurrency violation: the stored record no longer matches
    /// what the caller expected. Re-fetch and retry, or treat the work as
    /// already done by someone else.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The state machine rejected an event for the current state.
    #[error("Invalid transition from {from:?} on {event}")]
    InvalidTransition {
        /// State the job was in.
        from: JobState,
        /// Name of the rejected event.
        event: String,
    },

    /// A job body failed.
    #[error("Payload execution error: {0}")]
    PayloadExecution(String),

    /// The storage backend could not be reached. Safe to retry.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A job with the same id already exists.
    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    /// No handler registered under the invocation's name.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// Invalid schedule expression or timezone.
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Worker pool error.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Backend-specific error that retrying will not fix.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl BacklogError {
    /// Whether the whole operation may be retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, BacklogError::StorageUnavailable(_))
    }

    /// Whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BacklogError::Conflict(_))
    }
}

/// Result type alias using BacklogError.
pub type Result<T> = std::result::Result<T, BacklogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_serialization() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err = BacklogError::Serialization(json_err);
        let display = format!("{}", err);
        assert!(display.starts_with("Serialization error:"));
    }

    #[test]
    fn test_error_display_conflict() {
        let err = BacklogError::Conflict("job abc is Succeeded".to_string());
        assert_eq!(format!("{}", err), "Conflict: job abc is Succeeded");
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = BacklogError::InvalidTransition {
            from: JobState::Enqueued,
            event: "Succeed".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Invalid transition from Enqueued on Succeed"
        );
    }

    #[test]
    fn test_error_display_storage_unavailable() {
        let err = BacklogError::StorageUnavailable("connection refused".to_string());
        assert_eq!(format!("{}", err), "Storage unavailable: connection refused");
    }

    #[test]
    fn test_error_display_job_not_found() {
        let err = BacklogError::JobNotFound("abc-123".to_string());
        assert_eq!(format!("{}", err), "Job not found: abc-123");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: BacklogError = json_err.into();
        assert!(matches!(err, BacklogError::Serialization(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(BacklogError::StorageUnavailable("x".into()).is_transient());
        assert!(!BacklogError::Backend("x".into()).is_transient());
        assert!(BacklogError::Conflict("x".into()).is_conflict());
        assert!(!BacklogError::Config("x".into()).is_conflict());
    }
}
