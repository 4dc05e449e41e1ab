//! Connection-string parsing for the remote stores.
//!
//! Two grammars are accepted:
//!
//! ```text
//! Redis:      [tcp://|redis://]host[:port][?auth=..&database=N&timeout=S&prefix=P]
//!             unix:///path/to/redis.sock[?auth=..&database=N&timeout=S&prefix=P]
//! Memcached:  host:port[:weight][,host:port[:weight]...]
//! ```
//!
//! Every parse failure is a [`StoreError::Config`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::StoreError;

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

/// Where a Redis server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisEndpoint {
    /// TCP host and port.
    Tcp { host: String, port: u16 },
    /// Unix domain socket path.
    Unix(PathBuf),
}

/// A parsed Redis save path.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisTarget {
    pub endpoint: RedisEndpoint,
    /// `auth` query parameter (or the password part of the URL).
    pub password: Option<String>,
    /// `database` query parameter. Default: 0.
    pub database: i64,
    /// `timeout` query parameter in (fractional) seconds.
    pub timeout: Option<Duration>,
    /// `prefix` query parameter; replaces the configured key prefix.
    pub prefix: Option<String>,
}

impl RedisTarget {
    /// Port used when the save path names none.
    pub const DEFAULT_PORT: u16 = 6379;

    /// Parses a Redis save path.
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] for empty paths, unknown schemes,
    /// missing hosts or socket paths, and malformed query values.
    pub fn parse(save_path: &str) -> Result<Self, StoreError> {
        let raw = save_path.trim();
        if raw.is_empty() {
            return Err(StoreError::Config("redis save path is empty".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("tcp://{raw}")
        };
        let url = Url::parse(&with_scheme)
            .map_err(|e| StoreError::Config(format!("{raw:?}: {e}")))?;

        let endpoint = match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(StoreError::Config(format!(
                        "{raw:?}: unix socket path is missing"
                    )));
                }
                RedisEndpoint::Unix(PathBuf::from(path))
            }
            "tcp" | "redis" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| StoreError::Config(format!("{raw:?}: host is missing")))?;
                RedisEndpoint::Tcp {
                    host: host.to_string(),
                    port: url.port().unwrap_or(Self::DEFAULT_PORT),
                }
            }
            other => {
                return Err(StoreError::Config(format!(
                    "{raw:?}: unsupported scheme {other:?}"
                )));
            }
        };

        let mut target = Self {
            endpoint,
            password: url.password().map(str::to_string),
            database: 0,
            timeout: None,
            prefix: None,
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "auth" => target.password = Some(value.into_owned()),
                "database" => {
                    target.database = value.parse().map_err(|_| {
                        StoreError::Config(format!("{raw:?}: invalid database {value:?}"))
                    })?;
                }
                "timeout" => {
                    let secs: f64 = value
                        .parse()
                        .ok()
                        .filter(|s: &f64| s.is_finite() && *s >= 0.0)
                        .ok_or_else(|| {
                            StoreError::Config(format!("{raw:?}: invalid timeout {value:?}"))
                        })?;
                    target.timeout = (secs > 0.0).then(|| Duration::from_secs_f64(secs));
                }
                "prefix" => target.prefix = Some(value.into_owned()),
                other => {
                    tracing::debug!(param = other, "ignoring unknown redis save path parameter");
                }
            }
        }

        Ok(target)
    }

    /// Renders the target as a URL the `redis` crate understands.
    pub fn connection_url(&self) -> Result<String, StoreError> {
        let invalid = |what: &str| StoreError::Config(format!("cannot encode redis {what}"));
        match &self.endpoint {
            RedisEndpoint::Tcp { host, port } => {
                let mut url = Url::parse(&format!("redis://{host}:{port}/{}", self.database))
                    .map_err(|_| invalid("host"))?;
                if let Some(password) = &self.password {
                    url.set_password(Some(password))
                        .map_err(|()| invalid("password"))?;
                }
                Ok(url.to_string())
            }
            RedisEndpoint::Unix(path) => {
                let mut url = Url::parse("redis+unix:///").map_err(|_| invalid("socket"))?;
                url.set_path(&path.to_string_lossy());
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("db", &self.database.to_string());
                    if let Some(password) = &self.password {
                        query.append_pair("pass", password);
                    }
                }
                Ok(url.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Memcached
// ---------------------------------------------------------------------------

/// One server of a Memcached pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemcachedServer {
    pub host: String,
    pub port: u16,
    /// Relative share of keys routed to this server (at least 1).
    pub weight: u32,
}

impl MemcachedServer {
    /// Parses a `host:port[:weight][,...]` server list.
    ///
    /// Duplicate `host:port` pairs are dropped (first one wins).
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] for malformed entries or an empty pool.
    pub fn parse_pool(save_path: &str) -> Result<Vec<Self>, StoreError> {
        let mut seen = HashSet::new();
        let mut servers = Vec::new();

        for entry in save_path.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let server = Self::parse_one(entry)?;
            if !seen.insert((server.host.clone(), server.port)) {
                tracing::debug!(server = entry, "dropping duplicate memcached server");
                continue;
            }
            servers.push(server);
        }

        if servers.is_empty() {
            return Err(StoreError::Config("memcached server pool is empty".into()));
        }
        Ok(servers)
    }

    fn parse_one(entry: &str) -> Result<Self, StoreError> {
        let bad = || StoreError::Config(format!("invalid memcached server {entry:?}"));
        let mut fields = entry.split(':');

        let host = fields.next().filter(|h| !h.is_empty()).ok_or_else(bad)?;
        let port = fields
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(bad)?;
        let weight = match fields.next() {
            Some(w) => w.parse::<u32>().map_err(|_| bad())?.max(1),
            None => 1,
        };
        if fields.next().is_some() {
            return Err(bad());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            weight,
        })
    }
}
