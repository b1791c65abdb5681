//! Starting and stopping the child process.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};

use crate::error::{ProcessError, ProcessResult};

/// Starts the child that will connect back to the host.
///
/// The host only ever passes the port it listens on; everything else
/// travels over the pipe once the child has connected.
pub trait ChildLauncher {
    fn launch(&mut self, port: u16) -> ProcessResult<()>;

    /// Whether a launched child has gone away.
    fn has_exited(&mut self) -> bool;

    /// Best-effort stop. Safe to call when nothing was launched.
    fn terminate(&mut self);
}

/// Runs the `slplugin` executable.
#[derive(Debug)]
pub struct ExecutableLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    child: Option<Child>,
}

impl ExecutableLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            child: None,
        }
    }

    /// Extra arguments passed after the port.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

impl ChildLauncher for ExecutableLauncher {
    fn launch(&mut self, port: u16) -> ProcessResult<()> {
        if self.child.is_some() {
            return Err(ProcessError::Launch("child already launched".to_string()));
        }

        let mut command = Command::new(&self.program);
        command
            .arg(port.to_string())
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        match command.spawn() {
            Ok(child) => {
                info!(
                    pid = child.id(),
                    program = %self.program.display(),
                    port,
                    "Spawned plugin child"
                );
                self.child = Some(child);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ProcessError::Launch(format!(
                "plugin executable not found: {}",
                self.program.display()
            ))),
            Err(err) => Err(ProcessError::Launch(format!(
                "failed to spawn {}: {}",
                self.program.display(),
                err
            ))),
        }
    }

    fn has_exited(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), status = %status, "Plugin child exited");
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "Failed to inspect plugin child state");
                true
            }
        }
    }

    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(status = %status, "Plugin child already exited");
            }
            Ok(None) => {
                if let Err(err) = child.kill() {
                    warn!(error = %err, "Failed to terminate plugin child");
                }
                if let Err(err) = child.wait() {
                    warn!(error = %err, "Failed to reap plugin child");
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to inspect plugin child state");
            }
        }
    }
}

impl Drop for ExecutableLauncher {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_is_a_launch_error() {
        let mut launcher = ExecutableLauncher::new("/nonexistent/slplugin-missing");
        assert!(matches!(launcher.launch(1), Err(ProcessError::Launch(_))));
        assert!(!launcher.has_exited());
        launcher.terminate();
    }
}
