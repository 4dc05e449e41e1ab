//! Error types for the handler layer.

use keepsake_data::SessionId;
use keepsake_store::StoreError;

/// Errors a [`SessionHandler`](crate::SessionHandler) can report.
///
/// Only [`SessionError::Configuration`] is fatal. Everything else is a
/// per-request failure: the caller logs it and carries on with an empty,
/// read-only session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The handler cannot work with the given settings (bad save path,
    /// unusable cookie name, IP matching without a client IP).
    #[error("session configuration error: {0}")]
    Configuration(String),

    /// The backend could not be reached or an I/O call failed.
    #[error("session storage unavailable: {0}")]
    IoUnavailable(String),

    /// Another request held the session lock for the whole retry budget.
    #[error("timed out acquiring lock for session {session_id} after {attempts} attempts")]
    LockTimeout { session_id: SessionId, attempts: u32 },

    /// An operation that needs the session lock ran without it.
    #[error("session lock is not held")]
    LockNotHeld,

    /// Only part of the payload reached storage.
    #[error("wrote {written} of {expected} bytes for session {session_id}")]
    WriteFailed {
        session_id: SessionId,
        written: usize,
        expected: usize,
    },
}

impl SessionError {
    /// Whether the error should stop the application instead of degrading
    /// the request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Config(msg) => Self::Configuration(msg),
            other => Self::IoUnavailable(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::IoUnavailable(err.to_string())
    }
}
