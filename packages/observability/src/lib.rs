//! # Observability
//!
//! One place to set up `tracing` for the plugin host and every child
//! process it launches.
//!
//! Processes call [`init`] or [`init_with_config`] once at startup and then
//! log with plain `tracing` macros. Where the output goes is decided here.
//!
//! ## Dev Mode
//!
//! With the `dev` feature (on by default) every process appends structured
//! JSONL to one shared file, `~/.slplugin/logs/dev.jsonl`. Host and children
//! interleave line by line, so a crash in a child shows up right next to the
//! host's view of it:
//!
//! ```text
//! tail -f ~/.slplugin/logs/dev.jsonl | jq 'select(.service == "slplugin")'
//! ```
//!
//! Without the feature a compact formatter writes to stderr.
//!
//! ## Usage
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "slplugin".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! });
//! tracing::info!(port, "connecting to host");
//! ```

#[cfg(feature = "dev")]
mod dev;

mod json_layer;

use std::path::PathBuf;

pub use json_layer::{JsonLayer, LogEntry};

/// Directory under the home directory that holds plugin runtime files.
pub const BASE_DIR_NAME: &str = ".slplugin";

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name written into every log line ("host", "slplugin", ...).
    pub service_name: String,

    /// Default filter, overridden by `RUST_LOG`.
    pub default_level: String,

    /// Log file path. Defaults to `~/.slplugin/logs/dev.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Mirror log lines to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Central log file location shared by all processes.
///
/// `None` when the home directory cannot be determined.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(BASE_DIR_NAME).join("logs").join("dev.jsonl"))
}

/// Initialize logging with default settings for `service_name`.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Calling this twice in one process is harmless; the second call keeps
/// the subscriber installed by the first.
pub fn init_with_config(config: LogConfig) {
    #[cfg(feature = "dev")]
    {
        dev::init_dev_subscriber(&config);
    }

    #[cfg(not(feature = "dev"))]
    {
        use tracing_subscriber::util::SubscriberInitExt;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.default_level)),
            )
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
            .finish()
            .try_init();
    }
}

pub use tracing::{debug, error, info, instrument, span, trace, warn, Level};
