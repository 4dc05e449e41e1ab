//! Cache store abstraction layer for Keepsake.
//!
//! Provides the [`CacheStore`] trait: the handful of key/value primitives
//! the remote session handlers need (get, set, atomic add, touch, delete),
//! with implementations for Redis, Memcached and an in-process map.
//!
//! All TTLs are whole seconds; `0` means "no expiry".
//!
//! # Feature Flags
//!
//! - `redis` (default) — Redis store via the `redis` crate
//! - `memcached` (default) — Memcached store speaking the text protocol over tokio

mod error;
#[cfg(feature = "memcached")]
mod memcached;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod target;

pub use error::StoreError;
#[cfg(feature = "memcached")]
pub use memcached::MemcachedStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use target::{MemcachedServer, RedisEndpoint, RedisTarget};

use async_trait::async_trait;

/// A remote key/value store a session handler can keep payloads and locks in.
///
/// Implementations are shared between tasks, so every method takes `&self`.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Short backend name used in log fields.
    fn name(&self) -> &'static str;

    /// Longest key the backend accepts, in bytes. `None` when unbounded.
    fn max_key_length(&self) -> Option<usize> {
        None
    }

    /// Establishes the connection. Called once per request, from `open`.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Drops the connection. Errors are for logging only.
    async fn disconnect(&self) -> Result<(), StoreError>;

    /// Fetches a value. `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores a value unconditionally.
    async fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StoreError>;

    /// Stores a value only if the key does not exist yet.
    ///
    /// Returns `true` when this call created the key.
    async fn add(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool, StoreError>;

    /// Resets a key's TTL without rewriting its value.
    ///
    /// Returns `false` when the key does not exist.
    async fn touch(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError>;

    /// Removes a key. Returns `false` when it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}
