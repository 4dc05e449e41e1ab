//! Session data model for Keepsake.
//!
//! This crate defines what a session *is*, independent of where it is
//! stored:
//!
//! - **Ids** ([`SessionId`]) — the opaque token a client carries.
//! - **Data** ([`SessionData`]) — the key/value map, including the
//!   flash/temp lifecycle ([`Mark`], [`SessionData::sweep`]).
//! - **Fingerprints** ([`Fingerprint`]) — content hashes that let backends
//!   skip writing unchanged payloads.
//! - **Codecs** ([`Codec`], [`JsonCodec`]) — how data becomes bytes.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (keepsake) → Data (this crate) → Handler (bytes + locks) → Store
//! ```

mod codec;
mod data;
mod error;
mod fingerprint;
mod id;

pub use codec::{Codec, JsonCodec};
pub use data::{FlashState, LAST_REGENERATE_KEY, MARKS_KEY, Mark, SessionData};
pub use error::DataError;
pub use fingerprint::Fingerprint;
pub use id::SessionId;
