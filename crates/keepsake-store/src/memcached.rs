//! Memcached store speaking the classic text protocol.
//!
//! Only the commands sessions need are implemented: `get`, `set`, `add`,
//! `touch`, `delete` and `quit`. Keys are routed to one server of the pool
//! by a weighted hash, so every request for a session lands on the same
//! server while the pool is unchanged.
//!
//! ```text
//! set <key> 0 <exptime> <bytes>\r\n<data>\r\n   → STORED
//! add <key> 0 <exptime> <bytes>\r\n<data>\r\n   → STORED | NOT_STORED
//! get <key>\r\n                                 → VALUE <key> <flags> <bytes>\r\n<data>\r\nEND | END
//! touch <key> <exptime>\r\n                     → TOUCHED | NOT_FOUND
//! delete <key>\r\n                              → DELETED | NOT_FOUND
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::{CacheStore, MemcachedServer, StoreError};

/// Relative exptimes above this many seconds are read by the server as
/// absolute unix timestamps.
const MAX_RELATIVE_EXPTIME: u64 = 60 * 60 * 24 * 30;

/// Longest key the server accepts.
const MAX_KEY_LENGTH: usize = 250;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type Conn = BufStream<TcpStream>;

struct Node {
    server: MemcachedServer,
    conn: Mutex<Option<Conn>>,
}

impl Node {
    fn addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

enum Command<'a> {
    Get(&'a str),
    Store {
        verb: &'static str,
        key: &'a str,
        value: &'a [u8],
        exptime: u64,
    },
    Touch(&'a str, u64),
    Delete(&'a str),
}

enum Reply {
    Hit(Vec<u8>),
    Miss,
    Done,
    Refused,
}

/// A [`CacheStore`] backed by a pool of Memcached servers.
pub struct MemcachedStore {
    nodes: Vec<Node>,
    total_weight: u64,
    timeout: Duration,
}

impl MemcachedStore {
    /// Builds a store over `servers`. Connections are opened lazily.
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] for an empty pool.
    pub fn new(servers: Vec<MemcachedServer>) -> Result<Self, StoreError> {
        if servers.is_empty() {
            return Err(StoreError::Config("memcached server pool is empty".into()));
        }
        let total_weight = servers.iter().map(|s| u64::from(s.weight.max(1))).sum();
        let nodes = servers
            .into_iter()
            .map(|server| Node {
                server,
                conn: Mutex::new(None),
            })
            .collect();
        Ok(Self {
            nodes,
            total_weight,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Parses a `host:port[:weight],...` list and builds a store for it.
    pub fn from_save_path(save_path: &str) -> Result<Self, StoreError> {
        Self::new(MemcachedServer::parse_pool(save_path)?)
    }

    /// Sets the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The servers in the pool, in configuration order.
    pub fn servers(&self) -> impl Iterator<Item = &MemcachedServer> {
        self.nodes.iter().map(|n| &n.server)
    }

    fn pick(&self, key: &str) -> &Node {
        let digest = Sha256::digest(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let mut slot = u64::from_be_bytes(head) % self.total_weight;

        for node in &self.nodes {
            let weight = u64::from(node.server.weight.max(1));
            if slot < weight {
                return node;
            }
            slot -= weight;
        }
        &self.nodes[self.nodes.len() - 1]
    }

    async fn open_conn(&self, node: &Node) -> Result<Conn, StoreError> {
        let connect = TcpStream::connect((node.server.host.as_str(), node.server.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(stream) => {
                let stream = stream?;
                stream.set_nodelay(true)?;
                Ok(BufStream::new(stream))
            }
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn execute(&self, command: Command<'_>) -> Result<Reply, StoreError> {
        let key = command.key();
        validate_key(key)?;

        let node = self.pick(key);
        let mut guard = node.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_conn(node).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::NotConnected);
        };

        let result = match tokio::time::timeout(self.timeout, command.run(conn)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        if let Err(e) = &result {
            tracing::warn!(server = %node.addr(), error = %e, "memcached command failed, dropping connection");
            *guard = None;
        }
        result
    }
}

impl std::fmt::Debug for MemcachedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcachedStore")
            .field("servers", &self.nodes.iter().map(Node::addr).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl CacheStore for MemcachedStore {
    fn name(&self) -> &'static str {
        "memcached"
    }

    fn max_key_length(&self) -> Option<usize> {
        Some(MAX_KEY_LENGTH)
    }

    /// Connects every server in the pool. Succeeds if at least one answers.
    async fn connect(&self) -> Result<(), StoreError> {
        let mut connected = 0usize;
        let mut last_error = None;

        for node in &self.nodes {
            let mut guard = node.conn.lock().await;
            if guard.is_some() {
                connected += 1;
                continue;
            }
            match self.open_conn(node).await {
                Ok(conn) => {
                    *guard = Some(conn);
                    connected += 1;
                }
                Err(e) => {
                    tracing::warn!(server = %node.addr(), error = %e, "memcached server unreachable");
                    last_error = Some(e);
                }
            }
        }

        match (connected, last_error) {
            (0, Some(e)) => Err(e),
            _ => {
                tracing::debug!(connected, pool = self.nodes.len(), "memcached connected");
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        for node in &self.nodes {
            if let Some(mut conn) = node.conn.lock().await.take() {
                // The server closes without replying.
                let quit = async {
                    conn.write_all(b"quit\r\n").await?;
                    conn.flush().await
                };
                if let Ok(Err(e)) = tokio::time::timeout(self.timeout, quit).await {
                    tracing::debug!(server = %node.addr(), error = %e, "memcached quit failed");
                }
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.execute(Command::Get(key)).await? {
            Reply::Hit(value) => Ok(Some(value)),
            Reply::Miss => Ok(None),
            _ => Err(StoreError::Protocol("unexpected reply to get".into())),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StoreError> {
        let command = Command::Store {
            verb: "set",
            key,
            value,
            exptime: exptime(ttl_secs),
        };
        match self.execute(command).await? {
            Reply::Done => Ok(()),
            _ => Err(StoreError::Protocol(format!("set of {key:?} was not stored"))),
        }
    }

    async fn add(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool, StoreError> {
        let command = Command::Store {
            verb: "add",
            key,
            value,
            exptime: exptime(ttl_secs),
        };
        Ok(matches!(self.execute(command).await?, Reply::Done))
    }

    async fn touch(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let reply = self.execute(Command::Touch(key, exptime(ttl_secs))).await?;
        Ok(matches!(reply, Reply::Done))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(matches!(self.execute(Command::Delete(key)).await?, Reply::Done))
    }
}

impl Command<'_> {
    fn key(&self) -> &str {
        match self {
            Self::Get(key) | Self::Touch(key, _) | Self::Delete(key) => key,
            Self::Store { key, .. } => key,
        }
    }

    async fn run(&self, conn: &mut Conn) -> Result<Reply, StoreError> {
        match self {
            Self::Get(key) => {
                conn.write_all(format!("get {key}\r\n").as_bytes()).await?;
                conn.flush().await?;
                read_value(conn, key).await
            }
            Self::Store {
                verb,
                key,
                value,
                exptime,
            } => {
                let header = format!("{verb} {key} 0 {exptime} {}\r\n", value.len());
                conn.write_all(header.as_bytes()).await?;
                conn.write_all(value).await?;
                conn.write_all(b"\r\n").await?;
                conn.flush().await?;
                expect(conn, "STORED", "NOT_STORED").await
            }
            Self::Touch(key, exptime) => {
                conn.write_all(format!("touch {key} {exptime}\r\n").as_bytes())
                    .await?;
                conn.flush().await?;
                expect(conn, "TOUCHED", "NOT_FOUND").await
            }
            Self::Delete(key) => {
                conn.write_all(format!("delete {key}\r\n").as_bytes()).await?;
                conn.flush().await?;
                expect(conn, "DELETED", "NOT_FOUND").await
            }
        }
    }
}

async fn read_line(conn: &mut Conn) -> Result<String, StoreError> {
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        return Err(StoreError::Protocol("connection closed by server".into()));
    }
    let line = line.trim_end_matches(['\r', '\n']).to_string();
    if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
        return Err(StoreError::Protocol(line));
    }
    Ok(line)
}

async fn expect(conn: &mut Conn, done: &str, refused: &str) -> Result<Reply, StoreError> {
    let line = read_line(conn).await?;
    if line == done {
        Ok(Reply::Done)
    } else if line == refused {
        Ok(Reply::Refused)
    } else {
        Err(StoreError::Protocol(format!("unexpected reply {line:?}")))
    }
}

async fn read_value(conn: &mut Conn, key: &str) -> Result<Reply, StoreError> {
    let header = read_line(conn).await?;
    if header == "END" {
        return Ok(Reply::Miss);
    }

    let mut fields = header.split(' ');
    let len = match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some("VALUE"), Some(k), Some(_flags), Some(len)) if k == key => len
            .parse::<usize>()
            .map_err(|_| StoreError::Protocol(format!("bad value length in {header:?}")))?,
        _ => return Err(StoreError::Protocol(format!("unexpected reply {header:?}"))),
    };

    let mut data = vec![0u8; len + 2];
    conn.read_exact(&mut data).await?;
    if !data.ends_with(b"\r\n") {
        return Err(StoreError::Protocol("value block not terminated".into()));
    }
    data.truncate(len);

    let end = read_line(conn).await?;
    if end != "END" {
        return Err(StoreError::Protocol(format!("expected END, got {end:?}")));
    }
    Ok(Reply::Hit(data))
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(StoreError::Protocol(format!(
            "memcached key must be 1..={MAX_KEY_LENGTH} bytes, got {}",
            key.len()
        )));
    }
    if key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(StoreError::Protocol(format!(
            "memcached key {key:?} contains whitespace or control characters"
        )));
    }
    Ok(())
}

fn exptime(ttl_secs: u64) -> u64 {
    if ttl_secs <= MAX_RELATIVE_EXPTIME {
        return ttl_secs;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    now + ttl_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(spec: &str) -> MemcachedStore {
        MemcachedStore::from_save_path(spec).unwrap()
    }

    #[test]
    fn test_exptime_relative_up_to_thirty_days() {
        assert_eq!(exptime(0), 0);
        assert_eq!(exptime(7200), 7200);
        assert_eq!(exptime(MAX_RELATIVE_EXPTIME), MAX_RELATIVE_EXPTIME);
    }

    #[test]
    fn test_exptime_long_ttl_becomes_absolute() {
        let ttl = MAX_RELATIVE_EXPTIME + 1;
        assert!(exptime(ttl) > 1_600_000_000 + ttl);
    }

    #[test]
    fn test_validate_key_rules() {
        assert!(validate_key("app_session:abc").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("line\nbreak").is_err());
        assert!(validate_key(&"k".repeat(251)).is_err());
    }

    #[test]
    fn test_pick_is_stable_per_key() {
        let store = pool("10.0.0.1:11211,10.0.0.2:11211,10.0.0.3:11211");

        let first = store.pick("session:abc").addr();
        for _ in 0..10 {
            assert_eq!(store.pick("session:abc").addr(), first);
        }
    }

    #[test]
    fn test_pick_respects_weights() {
        let store = pool("10.0.0.1:11211:1,10.0.0.2:11211:9");

        let heavy = (0..1000)
            .filter(|i| store.pick(&format!("key{i}")).server.host == "10.0.0.2")
            .count();
        assert!(heavy > 800, "heavy server got {heavy}/1000 keys");
    }

    #[test]
    fn test_new_rejects_empty_pool() {
        assert!(matches!(
            MemcachedStore::new(Vec::new()),
            Err(StoreError::Config(_))
        ));
    }
}
