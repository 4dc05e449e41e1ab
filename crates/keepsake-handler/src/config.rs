//! Handler configuration and the per-request context handed to factories.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use keepsake_data::{Fingerprint, SessionId};
use serde::{Deserialize, Serialize};

use crate::SessionError;

/// Lifetime given to remote payloads of session-only cookies
/// (`expiration_secs == 0`), in seconds.
pub const SESSION_ONLY_TTL_SECS: u64 = 1440;

/// Settings shared by every handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Cookie name; also namespaces files and cache keys.
    pub cookie_name: String,
    /// Bind sessions to the client IP address.
    pub match_ip: bool,
    /// Directory (files) or connection string (redis, memcached).
    pub save_path: String,
    /// Seconds a session lives without activity. `0` means "until the
    /// browser closes".
    pub expiration_secs: u64,
    /// Prepended to every cache key.
    pub key_prefix: String,
    /// Delay between lock attempts. `None` uses the backend default.
    pub lock_retry_interval_ms: Option<u64>,
    /// Lock attempt budget. `None` uses the backend default.
    pub lock_max_attempts: Option<u32>,
    /// Number of hex characters in a session id.
    pub id_length: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            cookie_name: "keepsake_session".into(),
            match_ip: false,
            save_path: std::env::temp_dir()
                .join("keepsake")
                .to_string_lossy()
                .into_owned(),
            expiration_secs: 7200,
            key_prefix: String::new(),
            lock_retry_interval_ms: None,
            lock_max_attempts: None,
            id_length: SessionId::DEFAULT_LENGTH,
        }
    }
}

impl HandlerConfig {
    /// Normalizes the cookie name and checks every field.
    ///
    /// The cookie name is lowercased and stripped to `[a-z0-9_-]`, since it
    /// ends up in file names and cache keys.
    ///
    /// # Errors
    /// Returns [`SessionError::Configuration`] when the cookie name is empty
    /// after sanitizing, the save path is blank, or the id length is out
    /// of range.
    pub fn validated(mut self) -> Result<Self, SessionError> {
        self.cookie_name = sanitize_cookie_name(&self.cookie_name);
        if self.cookie_name.is_empty() {
            return Err(SessionError::Configuration(
                "cookie name is empty after removing characters outside [a-z0-9_-]".into(),
            ));
        }

        self.save_path = self.save_path.trim().to_string();
        if self.save_path.is_empty() {
            return Err(SessionError::Configuration("save path is empty".into()));
        }

        let range = SessionId::MIN_LENGTH..=SessionId::MAX_LENGTH;
        if !range.contains(&self.id_length) {
            return Err(SessionError::Configuration(format!(
                "id length {} is outside {}..={}",
                self.id_length,
                SessionId::MIN_LENGTH,
                SessionId::MAX_LENGTH
            )));
        }

        if self.lock_max_attempts == Some(0) {
            return Err(SessionError::Configuration(
                "lock attempt budget must be at least 1".into(),
            ));
        }

        Ok(self)
    }

    /// TTL applied to remote payloads.
    pub fn data_ttl_secs(&self) -> u64 {
        match self.expiration_secs {
            0 => SESSION_ONLY_TTL_SECS,
            secs => secs,
        }
    }
}

fn sanitize_cookie_name(raw: &str) -> String {
    raw.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

// ---------------------------------------------------------------------------
// Cookie collaborator
// ---------------------------------------------------------------------------

/// Attributes the session cookie was issued with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieAttributes {
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
}

impl Default for CookieAttributes {
    fn default() -> Self {
        Self {
            domain: None,
            path: "/".into(),
            secure: false,
        }
    }
}

/// The web layer's cookie jar, as seen by a handler.
///
/// Handlers read the cookie attributes when they open and ask for the
/// cookie to be expired when a session is destroyed.
pub trait CookieManager: Send + Sync {
    /// Attributes of the session cookie for the current request.
    fn attributes(&self) -> CookieAttributes;

    /// Tells the client to drop the cookie `name`.
    fn expire(&self, name: &str, attributes: &CookieAttributes);
}

/// A [`CookieManager`] with default attributes that ignores expiry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCookies;

impl CookieManager for NullCookies {
    fn attributes(&self) -> CookieAttributes {
        CookieAttributes::default()
    }

    fn expire(&self, _name: &str, _attributes: &CookieAttributes) {}
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a handler factory needs to build a handler for one request.
#[derive(Clone)]
pub struct HandlerContext {
    pub config: Arc<HandlerConfig>,
    pub client_ip: Option<IpAddr>,
    pub cookies: Arc<dyn CookieManager>,
    /// Built for maintenance outside a request (garbage collection), where
    /// no client IP exists.
    pub background: bool,
}

impl HandlerContext {
    pub fn new(config: Arc<HandlerConfig>) -> Self {
        Self {
            config,
            client_ip: None,
            cookies: Arc::new(NullCookies),
            background: false,
        }
    }

    /// A context for work that is not tied to a client, such as `collect`.
    ///
    /// IP matching never fails here and no IP segment is added to names.
    pub fn background(config: Arc<HandlerConfig>) -> Self {
        Self {
            background: true,
            ..Self::new(config)
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<Option<IpAddr>>) -> Self {
        self.client_ip = ip.into();
        self
    }

    pub fn with_cookies(mut self, cookies: Arc<dyn CookieManager>) -> Self {
        self.cookies = cookies;
        self
    }

    /// The client IP when IP matching is on, `None` when it is off.
    ///
    /// # Errors
    /// Returns [`SessionError::Configuration`] if matching is on but the
    /// request carries no client IP.
    pub fn matched_ip(&self) -> Result<Option<IpAddr>, SessionError> {
        if !self.config.match_ip || self.background {
            return Ok(None);
        }
        self.client_ip.map(Some).ok_or_else(|| {
            SessionError::Configuration("match_ip is enabled but the client IP is unknown".into())
        })
    }

    /// 32 hex characters identifying the client IP in file names.
    pub fn ip_hash(ip: IpAddr) -> String {
        Fingerprint::of(ip.to_string().as_bytes()).short_hex()
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("config", &self.config)
            .field("client_ip", &self.client_ip)
            .field("background", &self.background)
            .finish_non_exhaustive()
    }
}
