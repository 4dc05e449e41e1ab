//! # Keepsake
//!
//! Server-side HTTP sessions with pluggable storage.
//!
//! A web framework hands Keepsake the session cookie and the client IP at
//! the start of a request and gets back a [`Session`]: a typed key/value
//! map with flash and temp data, locked against concurrent requests for
//! the same id until the request commits.
//!
//! ## Layers
//!
//! ```text
//! keepsake          ← SessionManager, Session, registry (this crate)
//!     ↕
//! keepsake-data     ← SessionData, SessionId, Codec, Fingerprint
//! keepsake-handler  ← files / redis / memcached / null handlers, locks
//! keepsake-store    ← cache wire clients
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keepsake::prelude::*;
//!
//! # async fn handle(cookie: Option<&str>) -> Result<(), KeepsakeError> {
//! let manager = SessionManager::builder()
//!     .driver("redis")
//!     .save_path("tcp://127.0.0.1:6379?database=1")
//!     .build()?;
//!
//! let mut session = manager.start(cookie, None).await?;
//! let visits: u64 = session.data().get("visits").unwrap_or(0);
//! session.data_mut().set("visits", visits + 1)?;
//! session.data_mut().set_flash("notice", "welcome back")?;
//! // Send `session.id()` back as the cookie if `session.id_changed()`.
//! session.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `redis` (default) — the `redis` driver
//! - `memcached` (default) — the `memcached` driver

mod clock;
mod config;
mod error;
mod manager;
mod registry;
mod session;

pub use clock::{Clock, SystemClock};
pub use config::SessionConfig;
pub use error::KeepsakeError;
pub use manager::{SessionManager, SessionManagerBuilder};
pub use registry::{HandlerFactory, HandlerRegistry};
pub use session::Session;

pub use keepsake_data as data;
pub use keepsake_handler as handler;
pub use keepsake_store as store;

/// Convenience re-exports for typical use.
pub mod prelude {
    pub use crate::{
        Clock, HandlerRegistry, KeepsakeError, Session, SessionConfig, SessionManager,
        SessionManagerBuilder,
    };
    pub use keepsake_data::{FlashState, SessionData, SessionId};
    pub use keepsake_handler::{
        CookieAttributes, CookieManager, HandlerConfig, HandlerContext, SessionError,
        SessionHandler,
    };
}
