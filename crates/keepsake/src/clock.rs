use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current unix time, in seconds.
///
/// Temp expiries and regeneration timestamps are stored in payloads, so
/// they use wall-clock time rather than a monotonic clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}
