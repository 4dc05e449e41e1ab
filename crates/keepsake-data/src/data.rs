//! The in-memory session map and the flash/temp lifecycle layered on it.
//!
//! A session is a flat map of string keys to JSON values. Some keys are
//! *transient*:
//!
//! - **flash** entries survive exactly one more request after being set,
//! - **temp** entries survive until an absolute unix timestamp.
//!
//! Which keys are transient is tracked in a side map of [`Mark`]s that is
//! persisted together with the data under a reserved key, so the lifecycle
//! carries over between requests regardless of backend.
//!
//! ```text
//!   flash:  mark ──→ New ──(sweep)──→ Old ──(sweep)──→ removed
//!   temp:   mark ──→ Until(t) ──(sweep, now >= t)──→ removed
//! ```
//!
//! [`SessionData::sweep`] must run exactly once per session load, before
//! application code looks at the data. The orchestrator in the `keepsake`
//! crate does that.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DataError;

/// Reserved key holding the flash/temp marks in the serialized payload.
pub const MARKS_KEY: &str = "__keepsake_vars";

/// Reserved key holding the unix time of the last id regeneration.
pub const LAST_REGENERATE_KEY: &str = "__keepsake_last_regenerate";

// ---------------------------------------------------------------------------
// Mark
// ---------------------------------------------------------------------------

/// Where a flash entry is in its two-step lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashState {
    /// Set during the current request.
    New,
    /// Set during the previous request; removed at the next load.
    Old,
}

/// Lifecycle state of a transient key.
///
/// Serialized as `"new"`, `"old"` or a bare unix timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mark {
    /// Flash entry.
    Flash(FlashState),
    /// Temp entry, removed once the clock reaches this unix timestamp.
    Until(u64),
}

impl Mark {
    /// Returns `true` for flash marks.
    pub fn is_flash(&self) -> bool {
        matches!(self, Self::Flash(_))
    }

    /// Returns `true` for temp marks.
    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Until(_))
    }
}

// ---------------------------------------------------------------------------
// SessionData
// ---------------------------------------------------------------------------

/// A session's key/value data plus its bookkeeping.
///
/// Values live in a `BTreeMap` so serialization is deterministic: the
/// same logical content always produces the same bytes, which is what the
/// fingerprint comparison relies on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(
        rename = "__keepsake_vars",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    marks: BTreeMap<String, Mark>,

    #[serde(
        rename = "__keepsake_last_regenerate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    last_regenerate: Option<u64>,

    #[serde(flatten)]
    values: BTreeMap<String, Value>,
}

impl SessionData {
    /// Creates an empty session map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if there is nothing to persist at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.marks.is_empty() && self.last_regenerate.is_none()
    }

    /// Number of user-visible entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if `key` holds a value.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Looks up a raw JSON value.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Looks up a value and deserializes it into `T`.
    ///
    /// Returns `None` if the key is missing or holds a value of another shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Stores a value under `key`, replacing any previous value.
    ///
    /// An existing flash/temp mark on the key is kept.
    ///
    /// # Errors
    /// - [`DataError::ReservedKey`] for the bookkeeping keys
    /// - [`DataError::Encode`] if `value` cannot be represented as JSON
    pub fn set<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), DataError> {
        let key = key.into();
        if key == MARKS_KEY || key == LAST_REGENERATE_KEY {
            return Err(DataError::ReservedKey(key));
        }
        let value = serde_json::to_value(value).map_err(DataError::Encode)?;
        self.values.insert(key, value);
        Ok(())
    }

    /// Removes a value together with any flash/temp mark on it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.marks.remove(key);
        self.values.remove(key)
    }

    /// Removes every entry and mark. The regeneration timestamp is kept.
    pub fn clear(&mut self) {
        self.values.clear();
        self.marks.clear();
    }

    /// Iterates over the user-visible entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The current mark on `key`, if any.
    pub fn mark(&self, key: &str) -> Option<Mark> {
        self.marks.get(key).copied()
    }

    /// Unix time of the last id regeneration, if recorded.
    pub fn last_regenerate(&self) -> Option<u64> {
        self.last_regenerate
    }

    /// Records the unix time of an id regeneration.
    pub fn set_last_regenerate(&mut self, at: u64) {
        self.last_regenerate = Some(at);
    }

    // -- Flash data -------------------------------------------------------

    /// Stores a value and marks it as flash data.
    pub fn set_flash<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), DataError> {
        let key = key.into();
        self.set(key.clone(), value)?;
        self.marks.insert(key, Mark::Flash(FlashState::New));
        Ok(())
    }

    /// Marks existing keys as flash data.
    ///
    /// Returns `false` without marking anything if any key is missing.
    pub fn mark_as_flash(&mut self, keys: &[&str]) -> bool {
        if !keys.iter().all(|k| self.values.contains_key(*k)) {
            return false;
        }
        for key in keys {
            self.marks
                .insert((*key).to_string(), Mark::Flash(FlashState::New));
        }
        true
    }

    /// Keeps flash entries alive for one more request by re-marking them
    /// as `New`. Same return value as [`mark_as_flash`](Self::mark_as_flash).
    pub fn keep_flash(&mut self, keys: &[&str]) -> bool {
        self.mark_as_flash(keys)
    }

    /// Turns flash entries back into ordinary, persistent entries.
    pub fn unmark_flash(&mut self, keys: &[&str]) {
        for key in keys {
            if self.marks.get(*key).is_some_and(Mark::is_flash) {
                self.marks.remove(*key);
            }
        }
    }

    /// Keys currently marked as flash data.
    pub fn flash_keys(&self) -> Vec<&str> {
        self.keys_where(Mark::is_flash)
    }

    /// Reads a flash entry. Ordinary entries are not returned.
    pub fn get_flash<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if self.marks.get(key).is_some_and(Mark::is_flash) {
            self.get(key)
        } else {
            None
        }
    }

    /// All flash entries.
    pub fn flash(&self) -> BTreeMap<String, Value> {
        self.collect_where(Mark::is_flash)
    }

    // -- Temp data --------------------------------------------------------

    /// Stores a value that expires `ttl_secs` after `now`.
    pub fn set_temp<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
        ttl_secs: u64,
        now: u64,
    ) -> Result<(), DataError> {
        let key = key.into();
        self.set(key.clone(), value)?;
        self.marks.insert(key, Mark::Until(now.saturating_add(ttl_secs)));
        Ok(())
    }

    /// Marks existing keys as temp data expiring `ttl_secs` after `now`.
    ///
    /// Returns `false` without marking anything if any key is missing.
    pub fn mark_as_temp(&mut self, keys: &[&str], ttl_secs: u64, now: u64) -> bool {
        if !keys.iter().all(|k| self.values.contains_key(*k)) {
            return false;
        }
        let until = now.saturating_add(ttl_secs);
        for key in keys {
            self.marks.insert((*key).to_string(), Mark::Until(until));
        }
        true
    }

    /// Turns temp entries back into ordinary, persistent entries.
    pub fn unmark_temp(&mut self, keys: &[&str]) {
        for key in keys {
            if self.marks.get(*key).is_some_and(Mark::is_temp) {
                self.marks.remove(*key);
            }
        }
    }

    /// Keys currently marked as temp data.
    pub fn temp_keys(&self) -> Vec<&str> {
        self.keys_where(Mark::is_temp)
    }

    /// Reads a temp entry. Ordinary entries are not returned.
    pub fn get_temp<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if self.marks.get(key).is_some_and(Mark::is_temp) {
            self.get(key)
        } else {
            None
        }
    }

    // -- Lifecycle --------------------------------------------------------

    /// Advances every mark by one request boundary.
    ///
    /// `New` flash entries become `Old`; `Old` flash entries and temp
    /// entries whose expiry is at or before `now` are removed together
    /// with their data. A key promoted in this pass is never removed in
    /// the same pass. Returns the removed keys.
    pub fn sweep(&mut self, now: u64) -> Vec<String> {
        let mut removed = Vec::new();

        self.marks.retain(|key, mark| match *mark {
            Mark::Flash(FlashState::New) => {
                *mark = Mark::Flash(FlashState::Old);
                true
            }
            Mark::Flash(FlashState::Old) => {
                removed.push(key.clone());
                false
            }
            Mark::Until(expiry) if expiry <= now => {
                removed.push(key.clone());
                false
            }
            Mark::Until(_) => true,
        });

        for key in &removed {
            self.values.remove(key);
        }

        // A mark must never outlive its data.
        let values = &self.values;
        self.marks.retain(|key, _| values.contains_key(key));

        removed
    }

    fn keys_where(&self, pred: impl Fn(&Mark) -> bool) -> Vec<&str> {
        self.marks
            .iter()
            .filter(|(_, m)| pred(*m))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    fn collect_where(&self, pred: impl Fn(&Mark) -> bool) -> BTreeMap<String, Value> {
        self.marks
            .iter()
            .filter(|(_, m)| pred(*m))
            .filter_map(|(k, _)| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the flash/temp state machine.
    //!
    //! Time is passed in explicitly (`now`), so expiry is tested by simply
    //! choosing timestamps instead of sleeping.

    use super::*;

    fn data_with(keys: &[&str]) -> SessionData {
        let mut data = SessionData::new();
        for key in keys {
            data.set(*key, format!("value of {key}")).unwrap();
        }
        data
    }

    // =====================================================================
    // set() / get() / remove()
    // =====================================================================

    #[test]
    fn test_set_and_get_typed_value() {
        let mut data = SessionData::new();
        data.set("user_id", 42u64).unwrap();
        data.set("roles", vec!["admin", "ops"]).unwrap();

        assert_eq!(data.get::<u64>("user_id"), Some(42));
        assert_eq!(
            data.get::<Vec<String>>("roles"),
            Some(vec!["admin".to_string(), "ops".to_string()])
        );
        assert_eq!(data.get::<u64>("roles"), None, "shape mismatch is None");
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn test_set_reserved_key_returns_error() {
        let mut data = SessionData::new();

        let result = data.set(MARKS_KEY, 1);

        assert!(matches!(result, Err(DataError::ReservedKey(k)) if k == MARKS_KEY));
        assert!(data.set(LAST_REGENERATE_KEY, 1).is_err());
        assert!(data.is_empty());
    }

    #[test]
    fn test_remove_drops_mark_too() {
        let mut data = SessionData::new();
        data.set_flash("notice", "saved").unwrap();

        data.remove("notice");

        assert!(data.mark("notice").is_none());
        assert!(data.is_empty());
    }

    // =====================================================================
    // Flash marks
    // =====================================================================

    #[test]
    fn test_mark_as_flash_absent_key_returns_false() {
        let mut data = data_with(&["a"]);

        assert!(!data.mark_as_flash(&["a", "missing"]));
        // Nothing was marked, not even the key that exists.
        assert!(data.mark("a").is_none());
    }

    #[test]
    fn test_mark_as_flash_existing_keys_marks_new() {
        let mut data = data_with(&["a", "b"]);

        assert!(data.mark_as_flash(&["a", "b"]));

        assert_eq!(data.mark("a"), Some(Mark::Flash(FlashState::New)));
        assert_eq!(data.flash_keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_flash_survives_exactly_one_sweep() {
        let mut data = SessionData::new();
        data.set_flash("notice", "saved").unwrap();

        // Load of request N+1: New → Old, value still visible.
        let removed = data.sweep(0);
        assert!(removed.is_empty());
        assert_eq!(data.get_flash::<String>("notice").as_deref(), Some("saved"));
        assert_eq!(data.mark("notice"), Some(Mark::Flash(FlashState::Old)));

        // Load of request N+2: Old → removed.
        let removed = data.sweep(0);
        assert_eq!(removed, vec!["notice".to_string()]);
        assert!(!data.contains("notice"));
        assert!(data.is_empty());
    }

    #[test]
    fn test_keep_flash_restarts_lifecycle() {
        let mut data = SessionData::new();
        data.set_flash("notice", "saved").unwrap();
        data.sweep(0);

        assert!(data.keep_flash(&["notice"]));
        data.sweep(0);

        assert!(data.contains("notice"), "kept flash survives another load");
    }

    #[test]
    fn test_unmark_flash_makes_value_persistent() {
        let mut data = SessionData::new();
        data.set_flash("notice", "saved").unwrap();

        data.unmark_flash(&["notice"]);
        data.sweep(0);
        data.sweep(0);

        assert!(data.contains("notice"));
        assert!(data.get_flash::<String>("notice").is_none());
    }

    #[test]
    fn test_flash_returns_only_flash_entries() {
        let mut data = data_with(&["plain"]);
        data.set_flash("notice", "saved").unwrap();

        let flash = data.flash();

        assert_eq!(flash.len(), 1);
        assert_eq!(flash["notice"], Value::from("saved"));
    }

    // =====================================================================
    // Temp marks
    // =====================================================================

    #[test]
    fn test_temp_survives_until_expiry_regardless_of_sweeps() {
        let mut data = SessionData::new();
        data.set_temp("otp", "123456", 5, 1_000).unwrap();

        for now in [1_000, 1_001, 1_002, 1_004] {
            data.sweep(now);
            assert!(data.contains("otp"), "still present at {now}");
        }

        data.sweep(1_005);
        assert!(!data.contains("otp"));
        assert!(data.temp_keys().is_empty());
    }

    #[test]
    fn test_mark_as_temp_absent_key_returns_false() {
        let mut data = SessionData::new();

        assert!(!data.mark_as_temp(&["missing"], 10, 0));
        assert!(data.is_empty());
    }

    #[test]
    fn test_unmark_temp_ignores_flash_marks() {
        let mut data = SessionData::new();
        data.set_flash("notice", 1).unwrap();
        data.set_temp("otp", 2, 10, 0).unwrap();

        data.unmark_temp(&["notice", "otp"]);

        assert!(data.mark("notice").is_some_and(|m| m.is_flash()));
        assert!(data.mark("otp").is_none());
        assert_eq!(data.get_temp::<u32>("otp"), None);
    }

    // =====================================================================
    // sweep()
    // =====================================================================

    #[test]
    fn test_sweep_mixed_marks() {
        let mut data = data_with(&["plain"]);
        data.set_flash("fresh", 1).unwrap();
        data.set_flash("stale", 2).unwrap();
        data.sweep(0); // "fresh" and "stale" are now Old
        data.set_flash("fresh", 1).unwrap(); // re-flash "fresh"
        data.set_temp("expired", 3, 5, 0).unwrap();
        data.set_temp("pending", 4, 500, 0).unwrap();

        let mut removed = data.sweep(100);
        removed.sort();

        assert_eq!(removed, vec!["expired".to_string(), "stale".to_string()]);
        assert!(data.contains("plain"));
        assert!(data.contains("fresh"));
        assert!(data.contains("pending"));
    }
}
