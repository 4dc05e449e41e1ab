//! Redis store via the `redis` crate's multiplexed async connection.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, RedisResult};
use tokio::sync::Mutex;

use crate::{CacheStore, RedisTarget, StoreError};

/// Connect/command timeout used when the save path sets none.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`CacheStore`] backed by one Redis server.
pub struct RedisStore {
    client: Client,
    target: RedisTarget,
    timeout: Duration,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Builds a store for `target`. No connection is made until
    /// [`CacheStore::connect`].
    pub fn new(target: RedisTarget) -> Result<Self, StoreError> {
        let client = Client::open(target.connection_url()?.as_str())?;
        let timeout = target.timeout.unwrap_or(DEFAULT_TIMEOUT);
        Ok(Self {
            client,
            target,
            timeout,
            conn: Mutex::new(None),
        })
    }

    /// Parses `save_path` and builds a store for it.
    pub fn from_save_path(save_path: &str) -> Result<Self, StoreError> {
        Self::new(RedisTarget::parse(save_path)?)
    }

    /// The parsed connection target.
    pub fn target(&self) -> &RedisTarget {
        &self.target
    }

    async fn bounded<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn run<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .await
            .clone()
            .ok_or(StoreError::NotConnected)?;
        self.bounded(cmd.query_async(&mut conn)).await
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("endpoint", &self.target.endpoint)
            .field("database", &self.target.database)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<(), StoreError> {
        let mut conn = self
            .bounded(self.client.get_multiplexed_async_connection())
            .await?;

        let pong: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        if pong != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply {pong:?}")));
        }

        tracing::debug!(endpoint = ?self.target.endpoint, db = self.target.database, "redis connected");
        *self.conn.lock().await = Some(conn);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.conn.lock().await.take();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.run(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        let _: () = self.run(&cmd).await?;
        Ok(())
    }

    async fn add(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        let reply: Option<String> = self.run(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn touch(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let touched: i64 = if ttl_secs > 0 {
            self.run(redis::cmd("EXPIRE").arg(key).arg(ttl_secs)).await?
        } else {
            self.run(redis::cmd("EXISTS").arg(key)).await?
        };
        Ok(touched > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = self.run(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }
}
