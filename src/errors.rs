//! Application error model with job-system exit status mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling.
//! Only connection-class and persistence errors surface as a failed sync
//! invocation; per-attachment failures live in [`crate::attachments`] and never
//! reach this type.

use thiserror::Error;

/// Application error type
///
/// Each variant maps to a process exit status in [`AppError::exit_code`] so the
/// external job runner can tell retryable failures from operator mistakes.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (malformed identifier, bad configuration value)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (account, mailbox)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Transport or protocol failure talking to the mail server
    #[error("connection error: {0}")]
    Connection(String),
    /// Datastore failure (constraint violation, storage error)
    #[error("persistence error: {0}")]
    Persistence(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `Persistence`
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Whether the error belongs to the connection class
    ///
    /// Connection-class errors abort an invocation before anything is
    /// persisted, so the whole run is safe to retry.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed(_) | Self::Timeout(_) | Self::Connection(_)
        )
    }

    /// Process exit status for the job runner
    ///
    /// # Mappings
    ///
    /// - connection class, `Persistence` → 75 (`EX_TEMPFAIL`, retryable)
    /// - `InvalidInput` → 64 (`EX_USAGE`)
    /// - `NotFound` → 66 (`EX_NOINPUT`)
    /// - `Internal` → 70 (`EX_SOFTWARE`)
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::AuthFailed(_) | Self::Timeout(_) | Self::Connection(_) | Self::Persistence(_) => {
                75
            }
            Self::InvalidInput(_) => 64,
            Self::NotFound(_) => 66,
            Self::Internal(_) => 70,
        }
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
