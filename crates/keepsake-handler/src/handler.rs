use std::time::Duration;

use async_trait::async_trait;
use keepsake_data::{Fingerprint, SessionId};

use crate::SessionError;

/// Storage for session payloads, with one lock per session id.
///
/// A handler is owned by a single request. The expected call order is
///
/// ```text
/// open ──→ read ──→ (write | discard | destroy)* ──→ close
/// ```
///
/// `read` takes the session lock and `close` releases it, so concurrent
/// requests for the same id are serialized between those two calls.
/// `collect` may be called on a freshly opened handler at any time and
/// never takes a lock.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Registry name of the backend (`files`, `redis`, ...).
    fn name(&self) -> &'static str;

    /// Prepares backend resources.
    ///
    /// `save_path` is a directory or connection string; `name` is the
    /// sanitized cookie name. Bad settings fail with
    /// [`SessionError::Configuration`], unreachable backends with
    /// [`SessionError::IoUnavailable`].
    async fn open(&mut self, save_path: &str, name: &str) -> Result<(), SessionError>;

    /// Locks the session and returns its payload.
    ///
    /// An id with nothing stored yet yields an empty payload.
    async fn read(&mut self, id: &SessionId) -> Result<Vec<u8>, SessionError>;

    /// Persists `payload` for `id`.
    ///
    /// If `id` differs from the id last read, the old lock is released and
    /// a lock on `id` is taken first. Unchanged payloads only refresh the
    /// entry's lifetime.
    async fn write(&mut self, id: &SessionId, payload: &[u8]) -> Result<(), SessionError>;

    /// Releases the lock and backend connection. Safe to call repeatedly.
    async fn close(&mut self) -> Result<(), SessionError>;

    /// Deletes the payload for `id` and expires the client cookie.
    async fn destroy(&mut self, id: &SessionId) -> Result<(), SessionError>;

    /// Deletes the payload for `id`, leaving the client cookie alone.
    ///
    /// Used when the id is rotated: the client is about to receive a new
    /// cookie under the same name.
    async fn discard(&mut self, id: &SessionId) -> Result<(), SessionError>;

    /// Removes sessions idle for longer than `max_lifetime`.
    ///
    /// Returns how many were removed.
    async fn collect(&mut self, max_lifetime: Duration) -> Result<usize, SessionError>;

    /// Hash of the payload last read or written.
    fn fingerprint(&self) -> &Fingerprint;
}
