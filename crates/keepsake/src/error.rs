//! Unified error type for Keepsake.

use keepsake_data::DataError;
use keepsake_handler::SessionError;
use keepsake_store::StoreError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attributes let `?` convert errors from any layer.
#[derive(Debug, thiserror::Error)]
pub enum KeepsakeError {
    /// A handler-level error (configuration, lock, I/O).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A store-level error (connection strings, wire protocol).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A data-level error (encode, decode, reserved key).
    #[error(transparent)]
    Data(#[from] DataError),
}

impl KeepsakeError {
    /// Whether the error points at a misconfiguration rather than a
    /// transient failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Session(e) => e.is_fatal(),
            Self::Store(e) => matches!(e, StoreError::Config(_)),
            Self::Data(_) => false,
        }
    }
}
