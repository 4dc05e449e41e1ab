//! Codec trait and implementations for (de)serializing session payloads.
//!
//! Backends only ever see bytes. The codec decides how a [`SessionData`]
//! becomes those bytes, and the fingerprint is taken over its output, so a
//! codec must be deterministic: equal data must encode to equal bytes.

use crate::{DataError, SessionData};

/// Converts session data to and from the payload handed to a backend.
///
/// An empty session must encode to an empty payload, and an empty payload
/// must decode to an empty session. Backends report a session that was
/// never stored as an empty payload, so this keeps "never written" and
/// "written but empty" indistinguishable, fingerprint included.
pub trait Codec: Send + Sync + 'static {
    /// Serializes session data.
    ///
    /// # Errors
    /// Returns [`DataError::Encode`] if serialization fails.
    fn encode(&self, data: &SessionData) -> Result<Vec<u8>, DataError>;

    /// Parses a stored payload.
    ///
    /// # Errors
    /// Returns [`DataError::Decode`] if the payload is malformed.
    fn decode(&self, payload: &[u8]) -> Result<SessionData, DataError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that stores sessions as a JSON object (via `serde_json`).
///
/// Bookkeeping entries appear as the reserved keys
/// [`MARKS_KEY`](crate::MARKS_KEY) and
/// [`LAST_REGENERATE_KEY`](crate::LAST_REGENERATE_KEY) next to the user's
/// own keys, which keeps payloads readable with `redis-cli` or `cat`.
///
/// ## Example
///
/// ```rust
/// use keepsake_data::{Codec, JsonCodec, SessionData};
///
/// let mut data = SessionData::new();
/// data.set("user_id", 7).unwrap();
///
/// let bytes = JsonCodec.encode(&data).unwrap();
/// assert_eq!(bytes, br#"{"user_id":7}"#);
/// assert_eq!(JsonCodec.decode(&bytes).unwrap(), data);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, data: &SessionData) -> Result<Vec<u8>, DataError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::to_vec(data).map_err(DataError::Encode)
    }

    fn decode(&self, payload: &[u8]) -> Result<SessionData, DataError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(SessionData::new());
        }
        serde_json::from_slice(payload).map_err(DataError::Decode)
    }
}
