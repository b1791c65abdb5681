//! Plugin child entry point.
//!
//! Usage: slplugin <PORT> [--log-level <level>] [--base-dir <dir>]
//!
//! Connects back to the host on 127.0.0.1:<PORT>, loads whatever backend
//! the host names and runs it until told to stop.

use std::path::PathBuf;

use clap::Parser;
use plugin_config_and_utils::{init_logging_for_service, Config, Paths};
use plugin_process::{ChildOptions, DylibLoader, ProcessChild};
use tracing::{error, info};

/// slplugin: sandbox process for one media backend.
#[derive(Parser, Debug)]
#[command(name = "slplugin")]
#[command(about = "Hosts a media plugin backend on behalf of the viewer")]
struct Args {
    /// Loopback port the host is listening on.
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SLPLUGIN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Directory holding config.json and logs/ (default ~/.slplugin)
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

fn load_config(args: &Args) -> (Config, Option<Paths>) {
    let paths = match &args.base_dir {
        Some(dir) => Ok(Paths::with_base_dir(dir.clone())),
        None => Paths::new(),
    };
    match paths {
        Ok(paths) => match Config::load(&paths) {
            Ok(config) => (config, Some(paths)),
            Err(err) => {
                eprintln!("slplugin: ignoring config: {err}");
                (Config::new(), Some(paths))
            }
        },
        Err(_) => (Config::new(), None),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (config, paths) = load_config(&args);

    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    let log_path = match (&args.base_dir, &paths) {
        (Some(_), Some(paths)) => Some(paths.dev_log_file()),
        _ => None,
    };
    init_logging_for_service("slplugin", &level, log_path);

    info!(
        port = args.port,
        pid = std::process::id(),
        sleep_ms = config.child_sleep_time_ms,
        "Plugin child starting"
    );

    let mut child = ProcessChild::new(DylibLoader, ChildOptions::from_config(&config));
    child.init(args.port);
    child.run().await;

    if child.failed() {
        error!(port = args.port, "Plugin child exited after an error");
        anyhow::bail!("plugin child on port {} failed", args.port);
    }
    info!("Plugin child exiting");
    Ok(())
}
