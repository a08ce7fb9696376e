//! Sharing Configuration
//!
//! Settings for the sharing subsystem, loadable from `SHARING_*`
//! environment variables.

use crate::aggregate::DEFAULT_LINK_KEY;
use crate::map::{MapOptions, DEFAULT_LOG_WINDOW};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SharingConfig {
    /// Unique identifier for this process (default: random UUID)
    pub node_id: String,

    /// Path to the SQLite database holding primary maps (default: sharing.db)
    pub db_path: String,

    /// Deltas kept per map for incremental catch-up (default: 100)
    pub update_log_window: usize,

    /// Compiled methods cached per map (default: 100)
    pub method_cache_size: usize,

    /// Reject every serialized method call (default: false)
    pub no_exec: bool,

    /// Debounce window for full-dump broadcasts (default: 100ms)
    pub recovery_interval: Duration,

    /// Key listing linked maps in an aggregate (default: __link_key__)
    pub link_key: String,

    pub debug: bool,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            db_path: "sharing.db".to_string(),
            update_log_window: DEFAULT_LOG_WINDOW,
            method_cache_size: 100,
            no_exec: false,
            recovery_interval: Duration::from_millis(100),
            link_key: DEFAULT_LINK_KEY.to_string(),
            debug: false,
        }
    }
}

impl SharingConfig {
    /// Create a new configuration with node ID.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn db_path(mut self, path: impl Into<String>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn update_log_window(mut self, window: usize) -> Self {
        self.update_log_window = window;
        self
    }

    pub fn method_cache_size(mut self, size: usize) -> Self {
        self.method_cache_size = size;
        self
    }

    pub fn no_exec(mut self, no_exec: bool) -> Self {
        self.no_exec = no_exec;
        self
    }

    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    pub fn link_key(mut self, key: impl Into<String>) -> Self {
        self.link_key = key.into();
        self
    }

    /// Options for maps created by the sharing manager.
    pub fn map_options(&self) -> MapOptions {
        MapOptions {
            log_window: self.update_log_window,
            method_cache_size: self.method_cache_size,
            no_exec: self.no_exec,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::MissingNodeId);
        }
        if self.update_log_window == 0 {
            return Err(ConfigError::ZeroLogWindow);
        }
        if self.method_cache_size == 0 {
            return Err(ConfigError::ZeroMethodCache);
        }
        if self.link_key.is_empty() {
            return Err(ConfigError::MissingLinkKey);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("node_id is required")]
    MissingNodeId,
    #[error("update_log_window must be positive")]
    ZeroLogWindow,
    #[error("method_cache_size must be positive")]
    ZeroMethodCache,
    #[error("link_key is required")]
    MissingLinkKey,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<SharingConfig> {
    let defaults = SharingConfig::default();

    let node_id = std::env::var("SHARING_NODE_ID").unwrap_or(defaults.node_id);

    let db_path = std::env::var("SHARING_DB_PATH").unwrap_or(defaults.db_path);

    let update_log_window = env_parse("SHARING_UPDATE_LOG_WINDOW", defaults.update_log_window);

    let method_cache_size = env_parse("SHARING_METHOD_CACHE_SIZE", defaults.method_cache_size);

    let no_exec = env_flag("SHARING_NO_EXEC");

    let recovery_interval = Duration::from_millis(env_parse(
        "SHARING_RECOVERY_INTERVAL_MS",
        defaults.recovery_interval.as_millis() as u64,
    ));

    let link_key = std::env::var("SHARING_LINK_KEY").unwrap_or(defaults.link_key);

    let debug = std::env::var("DEBUG").is_ok();

    let config = SharingConfig {
        node_id,
        db_path,
        update_log_window,
        method_cache_size,
        no_exec,
        recovery_interval,
        link_key,
        debug,
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SharingConfig::default();
        assert!(!config.node_id.is_empty());
        assert_eq!(config.db_path, "sharing.db");
        assert_eq!(config.update_log_window, 100);
        assert_eq!(config.recovery_interval, Duration::from_millis(100));
        assert_eq!(config.link_key, "__link_key__");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = SharingConfig::new("node-1")
            .db_path("/tmp/x.db")
            .update_log_window(5)
            .no_exec(true)
            .link_key("links");

        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.db_path, "/tmp/x.db");
        let options = config.map_options();
        assert_eq!(options.log_window, 5);
        assert!(options.no_exec);
        assert_eq!(config.link_key, "links");
    }

    #[test]
    fn test_validate_errors() {
        assert_eq!(
            SharingConfig::new("").validate(),
            Err(ConfigError::MissingNodeId)
        );
        assert_eq!(
            SharingConfig::new("n").update_log_window(0).validate(),
            Err(ConfigError::ZeroLogWindow)
        );
        assert_eq!(
            SharingConfig::new("n").method_cache_size(0).validate(),
            Err(ConfigError::ZeroMethodCache)
        );
        assert_eq!(
            SharingConfig::new("n").link_key("").validate(),
            Err(ConfigError::MissingLinkKey)
        );
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("SHARING_TEST_UNSET_VARIABLE", 42usize), 42);
        assert!(!env_flag("SHARING_TEST_UNSET_VARIABLE"));
    }
}
