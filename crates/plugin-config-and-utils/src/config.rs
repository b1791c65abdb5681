//! Runtime configuration for the plugin host and child.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Largest frame either side accepts before treating the pipe as broken.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Environment variable overriding `log_level`.
pub const LOG_LEVEL_ENV: &str = "SLPLUGIN_LOG_LEVEL";

/// Timing and limits for one host/child pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Child tick period. 10 ms gives the ~100 Hz loop.
    pub child_sleep_time_ms: u64,
    /// How often the child reports CPU usage upward.
    pub heartbeat_interval_ms: u64,
    /// Time the host waits for a launched child to connect.
    pub plugin_launch_timeout_ms: u64,
    /// Time the host waits for the backend to report it is loaded.
    pub plugin_load_timeout_ms: u64,
    /// Silence after which a running child counts as locked up.
    pub plugin_lockup_timeout_ms: u64,
    /// Upper bound on a blocking request. `None` waits forever.
    pub blocking_request_timeout_ms: Option<u64>,
    /// Largest accepted frame payload in bytes.
    pub max_frame_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            child_sleep_time_ms: 10,
            heartbeat_interval_ms: 1000,
            plugin_launch_timeout_ms: 10_000,
            plugin_load_timeout_ms: 60_000,
            plugin_lockup_timeout_ms: 15_000,
            blocking_request_timeout_ms: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load `config.json` under `paths`, falling back to defaults when the
    /// file does not exist.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();
        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };
        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup(LOG_LEVEL_ENV).filter(|level| !level.trim().is_empty()) {
            self.log_level = level.trim().to_string();
        }
    }

    /// Reject values that would stall the loops.
    pub fn validate(&self) -> CoreResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(CoreError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(CoreError::Config("max_frame_len must be positive".to_string()));
        }
        Ok(())
    }

    pub fn child_sleep_time(&self) -> Duration {
        Duration::from_millis(self.child_sleep_time_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn plugin_launch_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_launch_timeout_ms)
    }

    pub fn plugin_load_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_load_timeout_ms)
    }

    pub fn plugin_lockup_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_lockup_timeout_ms)
    }

    pub fn blocking_request_timeout(&self) -> Option<Duration> {
        self.blocking_request_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.child_sleep_time(), Duration::from_millis(10));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.blocking_request_timeout(), None);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{ "log_level": "debug", "blocking_request_timeout_ms": 2500 }"#,
        )
        .unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(
            config.blocking_request_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.plugin_lockup_timeout_ms, 15_000);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.child_sleep_time_ms = 25;
        config.max_frame_len = 1024;
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.plugin_launch_timeout_ms, 10_000);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        std::fs::write(paths.config_file(), "{ not json").unwrap();

        assert!(matches!(Config::load(&paths), Err(CoreError::Json(_))));
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        std::fs::write(paths.config_file(), r#"{ "heartbeat_interval_ms": 0 }"#).unwrap();

        assert!(matches!(Config::load(&paths), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_env_overrides_log_level() {
        let mut config = Config::default();
        config.apply_env(|name| (name == LOG_LEVEL_ENV).then(|| " trace ".to_string()));
        assert_eq!(config.log_level, "trace");

        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.log_level, "trace");
    }
}
