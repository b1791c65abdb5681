//! Logging initialization.
//!
//! Thin wrappers over the observability crate so the host and the child
//! log the same way. By default everything lands in
//! `~/.slplugin/logs/dev.jsonl`, tagged with the service name.

use std::path::PathBuf;

/// Initialize logging under `service_name`, optionally writing to a log
/// file other than the shared default.
pub fn init_logging_for_service(service_name: &str, level: &str, log_path: Option<PathBuf>) {
    observability::init_with_config(observability::LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        log_path,
        also_stderr: true,
    });
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
