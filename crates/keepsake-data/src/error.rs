//! Error types for the data layer.
//!
//! Each crate in Keepsake defines its own error enum. A `DataError` always
//! means the problem is in the in-memory session map or its serialized
//! form, never in storage or locking.

/// Errors that can occur while manipulating or (de)serializing session data.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Serializing a value (or the whole session) failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// The stored payload could not be parsed back into a session map.
    ///
    /// Usually a truncated write or a payload written by something else
    /// that shares the same key or file.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The key is used internally to persist flash/temp marks or the
    /// regeneration timestamp and cannot be written directly.
    #[error("key {0:?} is reserved for session bookkeeping")]
    ReservedKey(String),
}
