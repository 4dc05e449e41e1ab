//! `SessionManager` builder and per-request session startup.
//!
//! The manager ties the layers together: it validates configuration once,
//! then for every request builds a handler through the registry, loads
//! and sweeps the data, and hands back a [`Session`].
//!
//! ```text
//! start(cookie, ip)
//!   ├─ validate id ────────── invalid/missing → generate
//!   ├─ registry.create ────── Configuration error → Err
//!   ├─ handler.open ───────── Configuration error → Err, other → degraded
//!   ├─ handler.read ───────── error → degraded
//!   ├─ codec.decode ───────── error → empty data
//!   ├─ data.sweep(now)
//!   └─ regenerate if last_regenerate + time_to_update < now
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use keepsake_data::{Codec, JsonCodec, SessionData, SessionId};
use keepsake_handler::{
    CookieManager, HandlerConfig, HandlerContext, NullCookies, SessionError, SessionHandler,
};

use crate::{Clock, HandlerRegistry, KeepsakeError, Session, SessionConfig, SystemClock};

struct Shared {
    config: SessionConfig,
    handler_config: Arc<HandlerConfig>,
    registry: HandlerRegistry,
    cookies: Arc<dyn CookieManager>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
}

/// Builder for a [`SessionManager`].
///
/// # Example
///
/// ```rust,no_run
/// use keepsake::prelude::*;
///
/// # async fn run() -> Result<(), KeepsakeError> {
/// let manager = SessionManager::builder()
///     .driver("files")
///     .save_path("/var/lib/myapp/sessions")
///     .build()?;
///
/// let mut session = manager.start(None, None).await?;
/// session.data_mut().set("user_id", 42)?;
/// session.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionManagerBuilder {
    config: SessionConfig,
    registry: HandlerRegistry,
    cookies: Arc<dyn CookieManager>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
}

impl SessionManagerBuilder {
    /// Creates a builder with default settings and the built-in handlers.
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            registry: HandlerRegistry::with_defaults(),
            cookies: Arc::new(NullCookies),
            codec: Arc::new(JsonCodec),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Selects the handler by registry name.
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.config.driver = driver.into();
        self
    }

    /// Sets the directory or connection string for the handler.
    pub fn save_path(mut self, save_path: impl Into<String>) -> Self {
        self.config.handler.save_path = save_path.into();
        self
    }

    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.config.handler.cookie_name = name.into();
        self
    }

    /// Replaces the handler registry.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registers one more handler factory.
    pub fn handler<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&HandlerContext) -> Result<Box<dyn SessionHandler>, SessionError>
            + Send
            + Sync
            + 'static,
    {
        self.registry.register(name, factory);
        self
    }

    pub fn cookies(mut self, cookies: Arc<dyn CookieManager>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the configuration and builds the manager.
    ///
    /// One handler is built up front so that an unknown driver or a bad
    /// connection string fails here rather than on the first request.
    ///
    /// # Errors
    /// Returns a [`KeepsakeError::Session`] wrapping
    /// [`SessionError::Configuration`].
    pub fn build(self) -> Result<SessionManager, KeepsakeError> {
        let mut config = self.config;
        config.handler = config.handler.validated()?;
        let handler_config = Arc::new(config.handler.clone());

        let startup_ctx = HandlerContext::background(Arc::clone(&handler_config));
        let handler = self.registry.create(&config.driver, &startup_ctx)?;
        tracing::info!(
            driver = %config.driver,
            handler = handler.name(),
            cookie = %handler_config.cookie_name,
            "session manager ready"
        );

        Ok(SessionManager {
            shared: Arc::new(Shared {
                config,
                handler_config,
                registry: self.registry,
                cookies: self.cookies,
                codec: self.codec,
                clock: self.clock,
            }),
        })
    }
}

impl Default for SessionManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out per-request [`Session`]s. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Creates a new builder.
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder::new()
    }

    /// The validated configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Loads the session for one request.
    ///
    /// `cookie_value` is the raw cookie the client sent, if any; anything
    /// that is not a well-formed id is replaced by a fresh one. Backend
    /// failures produce a degraded session instead of an error.
    ///
    /// # Errors
    /// Only configuration problems are returned.
    pub async fn start(
        &self,
        cookie_value: Option<&str>,
        client_ip: Option<IpAddr>,
    ) -> Result<Session, KeepsakeError> {
        let shared = &self.shared;
        let config = &shared.handler_config;

        let parsed = cookie_value.and_then(|raw| SessionId::parse(raw, config.id_length));
        if parsed.is_none() && cookie_value.is_some() {
            tracing::debug!("ignoring malformed session cookie");
        }
        let fresh = parsed.is_none();
        let id = parsed.unwrap_or_else(|| SessionId::generate(config.id_length));

        let ctx = HandlerContext::new(Arc::clone(config))
            .with_client_ip(client_ip)
            .with_cookies(Arc::clone(&shared.cookies));
        let handler = shared.registry.create(&shared.config.driver, &ctx)?;

        let mut session = Session::new(
            id.clone(),
            handler,
            Arc::clone(&shared.codec),
            Arc::clone(&shared.clock),
            config.id_length,
        );
        if fresh {
            session.mark_id_changed();
        }

        let opened = session
            .handler_mut()
            .open(&config.save_path, &config.cookie_name)
            .await;
        if let Err(e) = opened {
            if e.is_fatal() {
                tracing::error!(error = %e, "session handler misconfigured");
                session.abandon().await.ok();
                return Err(e.into());
            }
            tracing::warn!(session_id = %id, error = %e, "session storage unavailable, continuing without persistence");
            session.mark_degraded();
            return Ok(session);
        }

        let read = session.handler_mut().read(&id).await;
        let payload = match read {
            Ok(payload) => payload,
            Err(e) if e.is_fatal() => {
                session.abandon().await.ok();
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "unable to load session, continuing without persistence");
                if let Err(close_err) = session.handler_mut().close().await {
                    tracing::debug!(error = %close_err, "close after failed read also failed");
                }
                session.mark_degraded();
                return Ok(session);
            }
        };

        let mut data = shared.codec.decode(&payload).unwrap_or_else(|e| {
            tracing::warn!(session_id = %id, error = %e, "discarding undecodable session payload");
            SessionData::new()
        });

        let now = shared.clock.now();
        let swept = data.sweep(now);
        if !swept.is_empty() {
            tracing::debug!(session_id = %id, removed = swept.len(), "swept flash and temp data");
        }
        session.load(data);

        let ttu = shared.config.time_to_update_secs;
        if ttu > 0 {
            match session.data().last_regenerate() {
                None => session.data_mut().set_last_regenerate(now),
                Some(at) if at.saturating_add(ttu) < now => {
                    session.regenerate(shared.config.regenerate_destroy).await?;
                }
                Some(_) => {}
            }
        }

        Ok(session)
    }

    /// Removes sessions idle for longer than `max_lifetime`.
    ///
    /// Runs outside any request, through a fresh handler.
    pub async fn collect(&self, max_lifetime: Duration) -> Result<usize, KeepsakeError> {
        let shared = &self.shared;
        let config = &shared.handler_config;
        let ctx = HandlerContext::background(Arc::clone(config))
            .with_cookies(Arc::clone(&shared.cookies));
        let mut handler = shared.registry.create(&shared.config.driver, &ctx)?;

        handler.open(&config.save_path, &config.cookie_name).await?;
        let collected = handler.collect(max_lifetime).await;
        let closed = handler.close().await;

        let removed = collected?;
        closed?;
        Ok(removed)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.shared.config)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}
