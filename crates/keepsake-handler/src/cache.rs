//! Sessions in a remote key/value cache.
//!
//! One implementation serves every [`CacheStore`]:
//!
//! ```text
//! data key:  {prefix}{cookie_name}:{ip:}{id}
//! lock key:  {data key}:lock
//! ```
//!
//! The lock is a key created with an atomic add; see [`RemoteLock`].
//! Payloads are rewritten only when their fingerprint changes; otherwise
//! the key's TTL is refreshed.

use std::time::Duration;

use async_trait::async_trait;
use keepsake_data::{Fingerprint, SessionId};
use keepsake_store::{CacheStore, StoreError};

use crate::lock::{LockPolicy, LockState, RemoteLock};

/// Longest textual form of an IP address (IPv4-mapped IPv6).
const MAX_IP_TEXT_LENGTH: usize = 45;

const LOCK_SUFFIX: &str = ":lock";
use crate::{CookieAttributes, HandlerContext, SessionError, SessionHandler};

/// Session handler over any [`CacheStore`].
pub struct CacheHandler<S: CacheStore> {
    ctx: HandlerContext,
    store: S,
    lock: RemoteLock,
    /// Replaces `key_prefix` from the config (Redis `?prefix=`).
    prefix_override: Option<String>,
    key_prefix: String,
    cookie_name: String,
    cookie: CookieAttributes,
    session_id: Option<SessionId>,
    /// The data key is known to exist in the store.
    key_exists: bool,
    connected: bool,
    fingerprint: Fingerprint,
}

#[cfg(feature = "redis")]
/// Sessions in Redis.
pub type RedisHandler = CacheHandler<keepsake_store::RedisStore>;

#[cfg(feature = "memcached")]
/// Sessions in a Memcached pool.
pub type MemcachedHandler = CacheHandler<keepsake_store::MemcachedStore>;

impl<S: CacheStore> CacheHandler<S> {
    /// Wraps `store`. `policy` is adjusted by the lock settings of the
    /// context's config.
    pub fn new(ctx: HandlerContext, store: S, policy: LockPolicy) -> Self {
        let policy = policy.with_overrides(&ctx.config);
        Self {
            ctx,
            store,
            lock: RemoteLock::new(policy),
            prefix_override: None,
            key_prefix: String::new(),
            cookie_name: String::new(),
            cookie: CookieAttributes::default(),
            session_id: None,
            key_exists: false,
            connected: false,
            fingerprint: Fingerprint::empty(),
        }
    }

    /// Uses `prefix` instead of the configured key prefix.
    pub fn with_key_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix_override = prefix;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lock_state(&self) -> &LockState {
        self.lock.state()
    }

    /// Key holding the payload of `id`. Valid after `open`.
    pub fn data_key(&self, id: &SessionId) -> String {
        format!("{}{id}", self.key_prefix)
    }

    fn lock_key(&self, id: &SessionId) -> String {
        format!("{}{id}{LOCK_SUFFIX}", self.key_prefix)
    }

    fn base_prefix(&self) -> String {
        self.prefix_override
            .clone()
            .unwrap_or_else(|| self.ctx.config.key_prefix.clone())
    }

    /// Rejects settings whose longest key would exceed the store's limit.
    fn check_key_length(&self, name: &str) -> Result<(), SessionError> {
        let Some(limit) = self.store.max_key_length() else {
            return Ok(());
        };
        let ip = if self.ctx.config.match_ip {
            MAX_IP_TEXT_LENGTH + 1
        } else {
            0
        };
        let longest = self.base_prefix().len()
            + name.len()
            + 1
            + ip
            + self.ctx.config.id_length
            + LOCK_SUFFIX.len();
        if longest > limit {
            return Err(SessionError::Configuration(format!(
                "{} keys can be {longest} bytes long with these settings, the limit is {limit}",
                self.store.name()
            )));
        }
        Ok(())
    }

    fn failed(&self, op: &'static str, id: &SessionId, err: StoreError) -> SessionError {
        tracing::error!(backend = self.store.name(), session_id = %id, op, error = %err, "session store command failed");
        err.into()
    }

    async fn lock(&mut self, id: &SessionId) -> Result<(), SessionError> {
        let key = self.lock_key(id);
        self.lock.acquire(&self.store, key, id).await
    }

    async fn store_payload(&mut self, id: &SessionId, payload: &[u8]) -> Result<(), SessionError> {
        let key = self.data_key(id);
        let ttl = self.ctx.config.data_ttl_secs();
        self.store
            .set(&key, payload, ttl)
            .await
            .map_err(|e| self.failed("set", id, e))?;
        self.key_exists = true;
        self.fingerprint = Fingerprint::of(payload);
        Ok(())
    }
}

#[cfg(feature = "redis")]
impl CacheHandler<keepsake_store::RedisStore> {
    /// Builds a Redis handler from the context's save path.
    ///
    /// A `prefix` in the connection string replaces the configured key
    /// prefix.
    pub fn redis(ctx: HandlerContext) -> Result<Self, SessionError> {
        let target = keepsake_store::RedisTarget::parse(&ctx.config.save_path)?;
        let prefix = target.prefix.clone();
        let store = keepsake_store::RedisStore::new(target)?;
        Ok(Self::new(ctx, store, LockPolicy::redis()).with_key_prefix(prefix))
    }
}

#[cfg(feature = "memcached")]
impl CacheHandler<keepsake_store::MemcachedStore> {
    /// Builds a Memcached handler from the context's server list.
    pub fn memcached(ctx: HandlerContext) -> Result<Self, SessionError> {
        let store = keepsake_store::MemcachedStore::from_save_path(&ctx.config.save_path)?;
        let cookie_name = ctx.config.cookie_name.clone();
        let handler = Self::new(ctx, store, LockPolicy::memcached());
        handler.check_key_length(&cookie_name)?;
        Ok(handler)
    }
}

#[async_trait]
impl<S: CacheStore> SessionHandler for CacheHandler<S> {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    async fn open(&mut self, save_path: &str, name: &str) -> Result<(), SessionError> {
        if save_path.trim().is_empty() {
            return Err(SessionError::Configuration("save path is empty".into()));
        }

        self.check_key_length(name)?;

        let mut prefix = format!("{}{name}:", self.base_prefix());
        if let Some(ip) = self.ctx.matched_ip()? {
            prefix.push_str(&format!("{ip}:"));
        }

        if let Err(e) = self.store.connect().await {
            tracing::error!(backend = self.store.name(), error = %e, "unable to connect to session store");
            return Err(e.into());
        }
        self.connected = true;

        self.key_prefix = prefix;
        self.cookie_name = name.to_string();
        self.cookie = self.ctx.cookies.attributes();
        Ok(())
    }

    async fn read(&mut self, id: &SessionId) -> Result<Vec<u8>, SessionError> {
        self.lock(id).await?;
        self.session_id = Some(id.clone());

        let key = self.data_key(id);
        let stored = self
            .store
            .get(&key)
            .await
            .map_err(|e| self.failed("get", id, e))?;

        self.key_exists = stored.is_some();
        let payload = stored.unwrap_or_default();
        self.fingerprint = Fingerprint::of(&payload);
        Ok(payload)
    }

    async fn write(&mut self, id: &SessionId, payload: &[u8]) -> Result<(), SessionError> {
        if self.session_id.as_ref() != Some(id) {
            self.lock.release(&self.store).await?;
            self.session_id = Some(id.clone());
            self.key_exists = false;
            self.fingerprint = Fingerprint::of(b"");
        } else if !self.lock.is_held() {
            return Err(SessionError::LockNotHeld);
        }
        // Takes the lock for a new id, renews it otherwise.
        self.lock(id).await?;

        if !self.key_exists || !self.fingerprint.matches(payload) {
            return self.store_payload(id, payload).await;
        }

        let key = self.data_key(id);
        let ttl = self.ctx.config.data_ttl_secs();
        let touched = self
            .store
            .touch(&key, ttl)
            .await
            .map_err(|e| self.failed("touch", id, e))?;
        if !touched {
            tracing::debug!(session_id = %id, "session key vanished before refresh, rewriting");
            return self.store_payload(id, payload).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let released = self.lock.release(&self.store).await;

        if self.connected {
            self.connected = false;
            if let Err(e) = self.store.disconnect().await {
                tracing::debug!(backend = self.store.name(), error = %e, "session store disconnect failed");
            }
        }
        released
    }

    async fn discard(&mut self, id: &SessionId) -> Result<(), SessionError> {
        if !self.lock.is_held() {
            return Err(SessionError::LockNotHeld);
        }

        let key = self.data_key(id);
        let existed = self
            .store
            .delete(&key)
            .await
            .map_err(|e| self.failed("delete", id, e))?;
        if !existed {
            tracing::debug!(session_id = %id, "destroyed session had no stored payload");
        }

        self.key_exists = false;
        self.fingerprint = Fingerprint::empty();
        Ok(())
    }

    async fn destroy(&mut self, id: &SessionId) -> Result<(), SessionError> {
        self.discard(id).await?;
        self.ctx.cookies.expire(&self.cookie_name, &self.cookie);
        Ok(())
    }

    /// Cache entries expire on their own.
    async fn collect(&mut self, _max_lifetime: Duration) -> Result<usize, SessionError> {
        Ok(0)
    }

    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keepsake_store::MemoryStore;

    use super::*;
    use crate::HandlerConfig;

    fn id(c: char) -> SessionId {
        SessionId::parse(&c.to_string().repeat(32), 32).unwrap()
    }

    async fn opened(store: MemoryStore, config: HandlerConfig) -> CacheHandler<MemoryStore> {
        let ctx = HandlerContext::new(Arc::new(config))
            .with_client_ip("10.0.0.7".parse::<std::net::IpAddr>().ok());
        let mut handler = CacheHandler::new(ctx, store, LockPolicy::redis());
        handler.open("memory", "sess").await.unwrap();
        handler
    }

    #[tokio::test]
    async fn test_keys_use_prefix_cookie_and_ip() {
        let config = HandlerConfig {
            key_prefix: "app:".into(),
            match_ip: true,
            ..Default::default()
        };
        let handler = opened(MemoryStore::new(), config).await;

        assert_eq!(
            handler.data_key(&id('a')),
            format!("app:sess:10.0.0.7:{}", id('a'))
        );
        assert_eq!(
            handler.lock_key(&id('a')),
            format!("app:sess:10.0.0.7:{}:lock", id('a'))
        );
    }

    #[tokio::test]
    async fn test_prefix_override_replaces_configured_prefix() {
        let ctx = HandlerContext::new(Arc::new(HandlerConfig {
            key_prefix: "configured:".into(),
            ..Default::default()
        }));
        let mut handler = CacheHandler::new(ctx, MemoryStore::new(), LockPolicy::redis())
            .with_key_prefix(Some("override:".into()));
        handler.open("memory", "sess").await.unwrap();

        assert!(handler.data_key(&id('a')).starts_with("override:sess:"));
    }

    #[tokio::test]
    async fn test_read_takes_lock_and_close_releases_it() {
        let store = MemoryStore::new();
        let mut handler = opened(store.clone(), HandlerConfig::default()).await;

        handler.read(&id('a')).await.unwrap();
        assert!(matches!(handler.lock_state(), LockState::Held { session_id, .. } if *session_id == id('a')));
        assert!(store.contains(&handler.lock_key(&id('a'))).await);

        handler.close().await.unwrap();
        assert_eq!(handler.lock_state(), &LockState::Released);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_write_after_close_requires_lock() {
        let mut handler = opened(MemoryStore::new(), HandlerConfig::default()).await;
        handler.read(&id('a')).await.unwrap();
        handler.close().await.unwrap();

        let result = handler.write(&id('a'), b"late").await;
        assert!(matches!(result, Err(SessionError::LockNotHeld)));
    }

    #[tokio::test]
    async fn test_destroy_without_lock_fails() {
        let mut handler = opened(MemoryStore::new(), HandlerConfig::default()).await;

        let result = handler.destroy(&id('a')).await;
        assert!(matches!(result, Err(SessionError::LockNotHeld)));
    }

    #[tokio::test]
    async fn test_collect_is_noop() {
        let mut handler = opened(MemoryStore::new(), HandlerConfig::default()).await;
        assert_eq!(handler.collect(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_with_empty_save_path_is_configuration_error() {
        let ctx = HandlerContext::new(Arc::new(HandlerConfig::default()));
        let mut handler = CacheHandler::new(ctx, MemoryStore::new(), LockPolicy::redis());

        let result = handler.open("  ", "sess").await;
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }

    #[cfg(feature = "memcached")]
    fn memcached_ctx(id_length: usize, match_ip: bool) -> HandlerContext {
        HandlerContext::new(Arc::new(HandlerConfig {
            save_path: "127.0.0.1:11211".into(),
            id_length,
            match_ip,
            ..Default::default()
        }))
    }

    #[cfg(feature = "memcached")]
    #[test]
    fn test_memcached_rejects_ids_too_long_for_keys() {
        let result = CacheHandler::memcached(memcached_ctx(256, false));
        assert!(
            matches!(result, Err(SessionError::Configuration(ref msg)) if msg.contains("250")),
            "expected Configuration error naming the key limit"
        );
    }

    #[cfg(feature = "memcached")]
    #[test]
    fn test_memcached_accepts_default_id_length_with_ip_matching() {
        assert!(CacheHandler::memcached(memcached_ctx(32, true)).is_ok());
    }

    #[cfg(feature = "memcached")]
    #[tokio::test]
    async fn test_open_checks_key_length_before_connecting() {
        // Nothing listens on port 1; a connect attempt would be IoUnavailable.
        let store = keepsake_store::MemcachedStore::from_save_path("127.0.0.1:1").unwrap();
        let mut handler = CacheHandler::new(memcached_ctx(200, false), store, LockPolicy::memcached());

        let result = handler.open("127.0.0.1:1", &"s".repeat(60)).await;
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unbounded_store_accepts_long_ids() {
        let config = HandlerConfig {
            id_length: 256,
            ..Default::default()
        };
        let mut handler = opened(MemoryStore::new(), config).await;
        let id = SessionId::generate(256);

        handler.read(&id).await.unwrap();
        handler.write(&id, b"long").await.unwrap();
        handler.close().await.unwrap();
    }
}
