//! Daemon Process
//!
//! Launching is fire-and-forget: the process is spawned and left alone.
//! Readiness is never polled; the manager waits a fixed grace period
//! before it talks to the control port.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Daemon launch errors
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Failed to spawn {binary}: {reason}")]
    SpawnFailed { binary: String, reason: String },
}

/// A launched daemon
pub trait DaemonProcess: Send {
    /// Has the process neither exited nor been cancelled?
    fn is_running(&mut self) -> bool;

    /// Terminate the process
    fn cancel(&mut self);
}

/// Starts daemon processes
pub trait DaemonLauncher: Send {
    /// Spawn the daemon with the given arguments
    fn launch(&mut self, arguments: Vec<String>) -> Result<Box<dyn DaemonProcess>, DaemonError>;
}

/// Launches the real daemon binary
#[derive(Debug, Clone)]
pub struct TorLauncher {
    binary: PathBuf,
    forward_output: bool,
}

impl TorLauncher {
    /// Create a launcher for `binary`
    ///
    /// With `forward_output`, daemon stdout is logged under the `tor` target.
    pub fn new(binary: impl Into<PathBuf>, forward_output: bool) -> Self {
        Self {
            binary: binary.into(),
            forward_output,
        }
    }
}

impl DaemonLauncher for TorLauncher {
    fn launch(&mut self, arguments: Vec<String>) -> Result<Box<dyn DaemonProcess>, DaemonError> {
        let stdout = if self.forward_output {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let mut child = Command::new(&self.binary)
            .args(&arguments)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::SpawnFailed {
                binary: self.binary.display().to_string(),
                reason: e.to_string(),
            })?;

        let forwarder = child.stdout.take().map(|out| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "tor", "{}", line.trim());
                }
            })
        });

        info!("Starting daemon (pid {:?})", child.id());

        Ok(Box::new(TorProcess {
            child,
            forwarder,
            cancelled: false,
        }))
    }
}

/// Running daemon child process
pub struct TorProcess {
    child: Child,
    forwarder: Option<JoinHandle<()>>,
    cancelled: bool,
}

impl DaemonProcess for TorProcess {
    fn is_running(&mut self) -> bool {
        if self.cancelled {
            return false;
        }

        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("Daemon exited on its own: {}", status);
                false
            }
            Err(e) => {
                warn!("Failed to check daemon status: {}", e);
                false
            }
        }
    }

    fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;

        if let Err(e) = self.child.start_kill() {
            debug!("Daemon already gone: {}", e);
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for TorProcess {
    fn drop(&mut self) {
        self.cancel();
    }
}
