//! Session ids: the opaque token a client presents in its cookie.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// An opaque session identifier made of lowercase hex characters.
///
/// The id is the only credential guarding a session's data, so ids are
/// drawn from the thread-local CSPRNG and anything a client sends is
/// validated with [`SessionId::parse`] before it reaches a backend (it
/// becomes part of a file name or a cache key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Default id length: 32 hex characters (128 bits).
    pub const DEFAULT_LENGTH: usize = 32;
    /// Shortest accepted id length.
    pub const MIN_LENGTH: usize = 22;
    /// Longest accepted id length.
    pub const MAX_LENGTH: usize = 256;

    /// Generates a fresh random id of `len` hex characters.
    pub fn generate(len: usize) -> Self {
        let mut rng = rand::rng();
        let bytes: Vec<u8> = (0..len.div_ceil(2)).map(|_| rng.random()).collect();
        let mut id = hex::encode(bytes);
        id.truncate(len);
        Self(id)
    }

    /// Validates an id received from a client.
    ///
    /// Returns `None` unless `raw` is exactly `len` lowercase hex characters.
    pub fn parse(raw: &str, len: usize) -> Option<Self> {
        let valid = raw.len() == len
            && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    /// The regex source matching ids of `len` characters, without anchors.
    pub fn pattern(len: usize) -> String {
        format!("[0-9a-f]{{{len}}}")
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
