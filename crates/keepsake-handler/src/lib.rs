//! Session storage handlers for Keepsake.
//!
//! A handler turns a session id into bytes and back, and makes sure only
//! one request at a time works on a given id:
//!
//! - **Files** ([`FileHandler`]): one file per session, `flock`ed while in use.
//! - **Remote caches** ([`CacheHandler`]): any [`CacheStore`](keepsake_store::CacheStore),
//!   with a TTL'd lock key. [`RedisHandler`] and [`MemcachedHandler`] are
//!   the stock instantiations.
//! - **Null** ([`NullHandler`]): stores nothing.
//!
//! # How it fits in the stack
//!
//! ```text
//! Orchestrator (keepsake)   ← owns one handler per request
//!     ↕
//! Handler Layer (this crate)  ← bytes, locks, fingerprints, GC
//!     ↕
//! Store Layer (keepsake-store)  ← Redis / Memcached / memory clients
//! ```
//!
//! # Feature Flags
//!
//! - `redis` (default) — [`RedisHandler`]
//! - `memcached` (default) — [`MemcachedHandler`]

mod cache;
mod config;
mod error;
mod file;
mod handler;
mod lock;
mod null;

#[cfg(feature = "memcached")]
pub use cache::MemcachedHandler;
#[cfg(feature = "redis")]
pub use cache::RedisHandler;
pub use cache::CacheHandler;
pub use config::{
    CookieAttributes, CookieManager, HandlerConfig, HandlerContext, NullCookies,
    SESSION_ONLY_TTL_SECS,
};
pub use error::SessionError;
pub use file::FileHandler;
pub use handler::SessionHandler;
pub use lock::{FileLock, LockPolicy, LockState, RemoteLock};
pub use null::NullHandler;
