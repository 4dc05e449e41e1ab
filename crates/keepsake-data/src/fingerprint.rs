//! Content hashes used to skip redundant writes.
//!
//! Sessions are read on almost every request but only occasionally
//! changed. Every backend remembers the [`Fingerprint`] of the payload it
//! last read or wrote; when the payload about to be written hashes to the
//! same value, the backend only refreshes the entry's TTL (or the file's
//! mtime) instead of rewriting it.
//!
//! The threat model is "same bytes, skip the I/O", not an adversary, so
//! any well-distributed digest would do. SHA-256 is used because it is
//! already needed for IP hashes and is fast on small payloads.

use std::fmt;

use sha2::{Digest, Sha256};

/// SHA-256 digest of a serialized session payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hashes a payload.
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }

    /// The fingerprint of an empty payload, i.e. of a session that has
    /// never been written.
    pub fn empty() -> Self {
        Self::of(&[])
    }

    /// Returns `true` if `payload` hashes to this fingerprint.
    pub fn matches(&self, payload: &[u8]) -> bool {
        *self == Self::of(payload)
    }

    /// The first 16 bytes as 32 lowercase hex characters.
    ///
    /// Used where a fixed-width name segment is needed, e.g. the client-IP
    /// segment of session file names.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..16])
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_same_payload_is_equal() {
        assert_eq!(Fingerprint::of(b"abc"), Fingerprint::of(b"abc"));
        assert_ne!(Fingerprint::of(b"abc"), Fingerprint::of(b"abd"));
    }

    #[test]
    fn test_empty_matches_empty_payload() {
        assert!(Fingerprint::empty().matches(b""));
        assert_eq!(Fingerprint::default(), Fingerprint::empty());
    }

    #[test]
    fn test_display_is_full_hex_digest() {
        // Well-known SHA-256 of the empty string.
        assert_eq!(
            Fingerprint::empty().to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_short_hex_is_32_chars() {
        let short = Fingerprint::of(b"192.0.2.1").short_hex();
        assert_eq!(short.len(), 32);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
