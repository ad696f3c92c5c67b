//! Supervision of the resource daemon the dispatcher fronts.
//!
//! The daemon is spawned after the namespace join so it inherits the joined
//! namespaces, with its working directory inside the shared path. It is our
//! child, so its exit also reaches the lifecycle monitor as SIGCHLD.

use std::ffi::OsString;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{Result, SidecarError};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
}

#[derive(Debug)]
pub struct ResourceDaemon {
    program: PathBuf,
    child: Child,
}

impl ResourceDaemon {
    /// Start the daemon with stdout/stderr forwarded to the log.
    pub fn spawn(spec: &DaemonSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SidecarError::Daemon {
            program: spec.program.clone(),
            detail: format!("spawn failed: {e}"),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        info!(target: "resource_daemon", "{line}");
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!(target: "resource_daemon", "stderr: {line}");
                    }
                }
            });
        }

        info!(
            program = %spec.program.display(),
            pid = child.id(),
            cwd = %spec.working_dir.display(),
            "resource daemon started"
        );
        Ok(Self {
            program: spec.program.clone(),
            child,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait until the daemon has created its socket at `path`.
    ///
    /// Fails early if the daemon exits first.
    pub async fn wait_for_socket(&mut self, path: &Path, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(meta) = std::fs::symlink_metadata(path)
                && meta.file_type().is_socket()
            {
                info!(path = %path.display(), "resource daemon socket is up");
                return Ok(());
            }
            if let Some(status) = self.exit_status()? {
                return Err(self.error(format!(
                    "exited with {status} before creating {}",
                    path.display()
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(self.error(format!(
                    "did not create {} within {}ms",
                    path.display(),
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// `Some` once the daemon has exited.
    pub fn exit_status(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .map_err(|e| self.error(format!("status check failed: {e}")))
    }

    /// Stop the daemon (SIGTERM, bounded wait, then SIGKILL).
    pub async fn stop(&mut self, timeout: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status()? {
            info!(%status, "resource daemon already exited");
            return Ok(status);
        }
        info!(pid = self.id(), "stopping resource daemon");
        send_sigterm(&self.child);

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "resource daemon stopped");
                Ok(status)
            }
            Ok(Err(e)) => Err(self.error(format!("wait failed: {e}"))),
            Err(_) => {
                warn!("resource daemon did not exit in time, sending SIGKILL");
                if let Err(e) = self.child.kill().await {
                    return Err(self.error(format!("kill failed: {e}")));
                }
                self.child
                    .wait()
                    .await
                    .map_err(|e| self.error(format!("wait failed: {e}")))
            }
        }
    }

    fn error(&self, detail: String) -> SidecarError {
        SidecarError::Daemon {
            program: self.program.clone(),
            detail,
        }
    }
}

/// An exit with a non-zero code. Termination by signal is not a failure:
/// that is how [`ResourceDaemon::stop`] ends a daemon that ignores SIGTERM.
pub fn exited_with_failure(status: ExitStatus) -> bool {
    status.code().is_some_and(|code| code != 0)
}

fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}
