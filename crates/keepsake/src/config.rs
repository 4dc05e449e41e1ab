use keepsake_handler::HandlerConfig;
use serde::{Deserialize, Serialize};

/// Top-level session settings.
///
/// ```rust
/// use keepsake::SessionConfig;
///
/// let config: SessionConfig = serde_json::from_str(
///     r#"{ "driver": "redis", "handler": { "save_path": "tcp://127.0.0.1:6379?database=2" } }"#,
/// ).unwrap();
/// assert_eq!(config.time_to_update_secs, 300);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Registry name of the handler to use (`files`, `redis`, `memcached`,
    /// `null`, or anything registered by the application).
    pub driver: String,
    pub handler: HandlerConfig,
    /// Seconds between automatic id regenerations. `0` disables them.
    pub time_to_update_secs: u64,
    /// Delete the old payload when the id is regenerated automatically.
    pub regenerate_destroy: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            driver: "files".into(),
            handler: HandlerConfig::default(),
            time_to_update_secs: 300,
            regenerate_destroy: false,
        }
    }
}
