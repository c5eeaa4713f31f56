//! Error types for the pimgov reconciler.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use std::time::Duration;

use thiserror::Error;

/// Top-level application error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Desired state error: {0}")]
    DesiredState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Token acquisition errors.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("AZURE_CLIENT_SECRET is not set")]
    MissingClientSecret,

    #[error("Token request rejected: {0}")]
    Rejected(String),

    #[error("Token request failed: {0}")]
    RequestFailed(String),
}

/// Errors returned by a directory backend.
///
/// The variants form the taxonomy the reconcilers act on: only `Unauthorized`
/// aborts a run, `Throttled` and `Transient` are retried, `Conflict` is folded
/// into success by creators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DirectoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Throttled (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Unknown(String),
}

impl DirectoryError {
    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Transient(_))
    }

    /// Returns true if this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<AuthError> for DirectoryError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::RequestFailed(msg) => Self::Transient(format!("token request: {}", msg)),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level failures are worth another attempt; a body that fails
        // to decode is not.
        if err.is_decode() {
            Self::Unknown(format!("invalid response: {}", err))
        } else {
            Self::Transient(err.to_string())
        }
    }
}

impl AppError {
    /// Process exit code for errors that stop the binary before a report exists.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Auth(_) => 2,
            Self::Directory(e) if e.is_fatal() => 2,
            _ => 1,
        }
    }
}
