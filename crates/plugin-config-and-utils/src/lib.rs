//! Configuration, paths and logging setup shared by the plugin host and
//! the `slplugin` child.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, DEFAULT_LOG_LEVEL, DEFAULT_MAX_FRAME_LEN, LOG_LEVEL_ENV};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging_for_service, parse_level};
pub use paths::Paths;
