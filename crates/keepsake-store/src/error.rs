use std::time::Duration;

/// Errors that can occur talking to a cache server.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The connection string or server list is unusable.
    #[error("invalid store configuration: {0}")]
    Config(String),

    /// Connecting, sending or receiving failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered something the client did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server did not answer in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// An operation was attempted before `connect` (or after `disconnect`).
    #[error("not connected")]
    NotConnected,

    /// Error reported by the `redis` client.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
