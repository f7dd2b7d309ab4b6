//! Error taxonomy for coordinator operations
//!
//! Every failure on the upload, launch and result paths is converted into one
//! of these kinds at its point of origin. Callers report the upload outcome
//! and the launch outcome separately, so a launch error never implies that
//! the upload failed.

use thiserror::Error;

/// Errors returned by coordinator operations
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Malformed session/party/epoch/filename input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Artifact write, rename or result file read failed
    #[error("I/O failure: {0}")]
    IoFailure(String),

    /// Another request holds the session lock and owns the launch
    #[error("lock for session '{session_id}' is held by another request")]
    LockContention { session_id: String },

    /// No party list has been registered for the session
    #[error("session '{session_id}' has not been initiated")]
    SessionNotInitiated { session_id: String },

    /// The configured image tag does not exist in the runtime
    #[error("image not found: {image}")]
    ImageNotFound { image: String },

    /// Any other container runtime failure
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Lookup with no matching record
    #[error("not found: {0}")]
    NotFound(String),

    /// Session store unreachable, protocol error, or corrupt record
    #[error("session store error: {0}")]
    Store(String),
}

impl CoordinatorError {
    /// Stable identifier used in JSON responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::IoFailure(_) => "io_failure",
            Self::LockContention { .. } => "lock_contention",
            Self::SessionNotInitiated { .. } => "session_not_initiated",
            Self::ImageNotFound { .. } => "image_not_found",
            Self::Runtime(_) => "runtime_error",
            Self::NotFound(_) => "not_found",
            Self::Store(_) => "store_error",
        }
    }

    /// Expected, non-fatal outcomes (nobody needs to page anyone)
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::LockContention { .. } | Self::SessionNotInitiated { .. } | Self::NotFound(_)
        )
    }

    /// JSON error body: `{"error": ..., "error_kind": ...}`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "error_kind": self.kind(),
        })
    }

    pub(crate) fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::IoFailure(format!("{}: {}", context, err))
    }
}

/// Result alias for coordinator operations
pub type CoordResult<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_distinct() {
        let errors = vec![
            CoordinatorError::InvalidArgument("x".into()),
            CoordinatorError::IoFailure("x".into()),
            CoordinatorError::LockContention { session_id: "s".into() },
            CoordinatorError::SessionNotInitiated { session_id: "s".into() },
            CoordinatorError::ImageNotFound { image: "i".into() },
            CoordinatorError::Runtime("x".into()),
            CoordinatorError::NotFound("x".into()),
            CoordinatorError::Store("x".into()),
        ];

        let mut kinds: Vec<&str> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_lock_contention_is_expected() {
        let err = CoordinatorError::LockContention { session_id: "S1".into() };
        assert!(err.is_expected());
        assert!(err.to_string().contains("S1"));

        let err = CoordinatorError::Runtime("daemon down".into());
        assert!(!err.is_expected());
    }

    #[test]
    fn test_json_body() {
        let body = CoordinatorError::ImageNotFound { image: "test-docker".into() }.to_json();
        assert_eq!(body["error_kind"], "image_not_found");
        assert_eq!(body["error"], "image not found: test-docker");
    }

    #[test]
    fn test_io_helper_includes_context() {
        let err = CoordinatorError::io(
            "write uploads/S1/A/model1.tar",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), "io_failure");
        assert!(err.to_string().contains("uploads/S1/A/model1.tar"));
        assert!(err.to_string().contains("denied"));
    }
}
