//! One request's view of a session.

use std::sync::Arc;

use keepsake_data::{Codec, SessionData, SessionId};
use keepsake_handler::SessionHandler;

use crate::{Clock, KeepsakeError};

/// A loaded session, owned by the request that started it.
///
/// The session holds its backend lock from [`SessionManager::start`]
/// until it is consumed by [`commit`](Self::commit),
/// [`abandon`](Self::abandon) or [`destroy`](Self::destroy).
///
/// ## Degraded sessions
///
/// If the backend could not be opened or read, the session is *degraded*:
/// it starts empty, works normally in memory, and is never written back.
/// Without the lock, writing could overwrite another request's data.
///
/// [`SessionManager::start`]: crate::SessionManager::start
pub struct Session {
    id: SessionId,
    data: SessionData,
    handler: Box<dyn SessionHandler>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    id_length: usize,
    degraded: bool,
    id_changed: bool,
    finished: bool,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        handler: Box<dyn SessionHandler>,
        codec: Arc<dyn Codec>,
        clock: Arc<dyn Clock>,
        id_length: usize,
    ) -> Self {
        Self {
            id,
            data: SessionData::new(),
            handler,
            codec,
            clock,
            id_length,
            degraded: false,
            id_changed: false,
            finished: false,
        }
    }

    pub(crate) fn load(&mut self, data: SessionData) {
        self.data = data;
    }

    pub(crate) fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub(crate) fn mark_id_changed(&mut self) {
        self.id_changed = true;
    }

    pub(crate) fn handler_mut(&mut self) -> &mut dyn SessionHandler {
        self.handler.as_mut()
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut SessionData {
        &mut self.data
    }

    /// The current unix time according to the manager's clock.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Whether loading failed and the session will not be persisted.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Whether the client needs a new cookie: the id was generated for
    /// this request or regenerated during it.
    pub fn id_changed(&self) -> bool {
        self.id_changed
    }

    /// Name of the backend holding this session.
    pub fn handler_name(&self) -> &'static str {
        self.handler.name()
    }

    /// Switches to a fresh id, keeping the data.
    ///
    /// With `destroy_old`, the payload stored under the old id is deleted.
    /// The client cookie is left alone; send the new id when
    /// [`id_changed`](Self::id_changed) is set.
    /// The new id is locked when the session is committed.
    pub async fn regenerate(&mut self, destroy_old: bool) -> Result<(), KeepsakeError> {
        let old = std::mem::replace(&mut self.id, SessionId::generate(self.id_length));

        if destroy_old && !self.degraded {
            if let Err(e) = self.handler.discard(&old).await {
                tracing::warn!(session_id = %old, error = %e, "failed to destroy old session during regeneration");
            }
        }

        self.data.set_last_regenerate(self.clock.now());
        self.id_changed = true;
        tracing::debug!(old = %old, new = %self.id, destroy_old, "session id regenerated");
        Ok(())
    }

    /// Deletes the stored session and ends the request's use of it.
    pub async fn destroy(mut self) -> Result<(), KeepsakeError> {
        self.data.clear();
        let destroyed = if self.degraded {
            Ok(())
        } else {
            self.handler.destroy(&self.id).await
        };
        let closed = self.finish().await;

        destroyed?;
        closed
    }

    /// Writes the data back (unless degraded) and releases the lock.
    pub async fn commit(mut self) -> Result<(), KeepsakeError> {
        let written = self.write_back().await;
        let closed = self.finish().await;

        written?;
        closed
    }

    /// Releases the lock without writing anything.
    pub async fn abandon(mut self) -> Result<(), KeepsakeError> {
        self.finish().await
    }

    async fn write_back(&mut self) -> Result<(), KeepsakeError> {
        if self.degraded {
            tracing::debug!(session_id = %self.id, "skipping write for degraded session");
            return Ok(());
        }
        let payload = self.codec.encode(&self.data)?;
        self.handler
            .write(&self.id, &payload)
            .await
            .inspect_err(|e| {
                tracing::error!(session_id = %self.id, error = %e, "failed to write session data");
            })?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), KeepsakeError> {
        self.finished = true;
        self.handler.close().await.map_err(KeepsakeError::from)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                session_id = %self.id,
                "session dropped without commit or abandon, lock held until backend expiry"
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("handler", &self.handler.name())
            .field("degraded", &self.degraded)
            .field("id_changed", &self.id_changed)
            .field("keys", &self.data.len())
            .finish()
    }
}
