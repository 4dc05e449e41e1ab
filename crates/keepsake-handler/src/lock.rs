//! Per-session locks.
//!
//! Two flavors, matching the two kinds of backend:
//!
//! - [`FileLock`]: an exclusive advisory `flock` on the session file.
//!   Acquisition blocks (on tokio's blocking pool) until the holder lets go.
//! - [`RemoteLock`]: a sentinel key created with an atomic "add" and a TTL.
//!   Acquisition polls at a fixed interval and gives up after a budget.
//!
//! ```text
//!              acquire (add ok)
//!  Released ─────────────────────→ Held { key, session_id, acquired_at }
//!     ▲                                 │   │
//!     │           release (delete)      │   │ acquire same key
//!     └─────────────────────────────────┘   └──→ touch (renew TTL)
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use keepsake_data::SessionId;
use keepsake_store::CacheStore;
use tokio::time::Instant;

use crate::{HandlerConfig, SessionError};

/// How a [`RemoteLock`] polls for the lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub retry_interval: Duration,
    pub max_attempts: u32,
    /// Lifetime of the lock key, so a crashed holder cannot block forever.
    pub ttl_secs: u64,
}

impl LockPolicy {
    pub const TTL_SECS: u64 = 300;

    /// 300 attempts, 100 ms apart.
    pub fn redis() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
            max_attempts: 300,
            ttl_secs: Self::TTL_SECS,
        }
    }

    /// 30 attempts, one second apart.
    pub fn memcached() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            max_attempts: 30,
            ttl_secs: Self::TTL_SECS,
        }
    }

    /// Applies the retry settings of `config`, where present.
    pub fn with_overrides(mut self, config: &HandlerConfig) -> Self {
        if let Some(ms) = config.lock_retry_interval_ms {
            self.retry_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = config.lock_max_attempts {
            self.max_attempts = attempts;
        }
        self
    }
}

/// Whether a [`RemoteLock`] currently owns its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Released,
    Held {
        key: String,
        session_id: SessionId,
        acquired_at: Instant,
    },
}

/// A lock emulated with a TTL'd key in a [`CacheStore`].
#[derive(Debug)]
pub struct RemoteLock {
    policy: LockPolicy,
    state: LockState,
}

impl RemoteLock {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            policy,
            state: LockState::Released,
        }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    pub fn state(&self) -> &LockState {
        &self.state
    }

    pub fn is_held(&self) -> bool {
        matches!(self.state, LockState::Held { .. })
    }

    /// Takes `key` for session `id`, or renews it if already held.
    ///
    /// Holding a different key releases it first. If a renewal finds the
    /// key gone, the lock is acquired from scratch.
    ///
    /// # Errors
    /// [`SessionError::LockTimeout`] once the attempt budget is spent;
    /// store failures as [`SessionError::IoUnavailable`].
    pub async fn acquire<S: CacheStore + ?Sized>(
        &mut self,
        store: &S,
        key: String,
        id: &SessionId,
    ) -> Result<(), SessionError> {
        let renew = matches!(&self.state, LockState::Held { key: held, .. } if *held == key);
        if renew {
            if store.touch(&key, self.policy.ttl_secs).await? {
                return Ok(());
            }
            tracing::warn!(session_id = %id, %key, "session lock expired while held, reacquiring");
            self.state = LockState::Released;
        } else {
            self.release(store).await?;
        }

        let stamp = unix_now().to_string();
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            if store.add(&key, stamp.as_bytes(), self.policy.ttl_secs).await? {
                tracing::debug!(session_id = %id, attempt, "session lock acquired");
                self.state = LockState::Held {
                    key,
                    session_id: id.clone(),
                    acquired_at: Instant::now(),
                };
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.retry_interval).await;
            }
        }

        tracing::error!(session_id = %id, attempts, "unable to obtain session lock");
        Err(SessionError::LockTimeout {
            session_id: id.clone(),
            attempts,
        })
    }

    /// Deletes the lock key if held. A key that already expired is fine.
    pub async fn release<S: CacheStore + ?Sized>(&mut self, store: &S) -> Result<(), SessionError> {
        let LockState::Held {
            key, session_id, ..
        } = std::mem::replace(&mut self.state, LockState::Released)
        else {
            return Ok(());
        };

        match store.delete(&key).await {
            Ok(existed) => {
                if !existed {
                    tracing::debug!(%session_id, "session lock already gone on release");
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(%session_id, error = %e, "failed to free session lock");
                Err(e.into())
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// File lock
// ---------------------------------------------------------------------------

/// An exclusive advisory lock on an open session file.
///
/// The lock lives as long as the descriptor; dropping a `FileLock` without
/// [`release`](FileLock::release) still frees it when the file closes.
#[derive(Debug)]
pub struct FileLock {
    file: Arc<File>,
    path: PathBuf,
}

impl FileLock {
    /// Waits until `file` can be locked exclusively.
    pub async fn acquire(file: File, path: PathBuf) -> Result<Self, SessionError> {
        let file = Arc::new(file);
        let handle = Arc::clone(&file);
        let locked = tokio::task::spawn_blocking(move || FileExt::lock_exclusive(&*handle))
            .await
            .map_err(|e| SessionError::IoUnavailable(format!("lock task failed: {e}")))?;

        if let Err(e) = locked {
            tracing::error!(path = %path.display(), error = %e, "unable to lock session file");
            return Err(e.into());
        }
        Ok(Self { file, path })
    }

    /// The locked descriptor, for blocking I/O on the same handle.
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlocks and closes the file.
    pub async fn release(self) -> Result<(), SessionError> {
        let Self { file, path } = self;
        let unlocked = tokio::task::spawn_blocking(move || FileExt::unlock(&*file))
            .await
            .map_err(|e| SessionError::IoUnavailable(format!("unlock task failed: {e}")))?;

        unlocked.map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "unable to unlock session file");
            SessionError::from(e)
        })
    }
}
