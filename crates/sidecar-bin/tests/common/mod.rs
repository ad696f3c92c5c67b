#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

use std::ffi::OsStr;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

pub const DISPATCHER: &str = env!("CARGO_BIN_EXE_virtiofs-dispatcher");
pub const PLACEHOLDER: &str = env!("CARGO_BIN_EXE_virtiofs-placeholder");
pub const CONTAINER_DISK: &str = env!("CARGO_BIN_EXE_container-disk");

/// External wait that is known to be enough in practice.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

pub const BURST_CLIENTS: usize = 200;
pub const BURST_SPACING: Duration = Duration::from_millis(25);

/// A sidecar process killed on drop if the test did not reap it.
pub struct Sidecar {
    child: Child,
}

impl Sidecar {
    pub fn spawn<I, S>(bin: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(bin)
            .args(args)
            .env("SIDECAR_LOG", "debug")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .unwrap_or_else(|e| panic!("spawn {bin}: {e}"));
        Self { child }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(i32::try_from(self.child.id()).unwrap())
    }

    pub fn signal(&self, signal: Signal) {
        kill(self.pid(), signal).unwrap();
    }

    pub fn is_running(&mut self) -> bool {
        self.child.try_wait().unwrap().is_none()
    }

    pub fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(
                Instant::now() < deadline,
                "process {} did not exit within {timeout:?}",
                self.child.id()
            );
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Run to completion with captured output.
pub fn run<I, S>(bin: &str, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .unwrap_or_else(|e| panic!("run {bin}: {e}"))
}

pub fn wait_for_path(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        assert!(
            Instant::now() < deadline,
            "{} did not appear within {timeout:?}",
            path.display()
        );
        thread::sleep(Duration::from_millis(10));
    }
}

/// Dial `count` clients `spacing` apart, keeping every connection open.
/// Returns the number of failed attempts.
pub fn burst(path: &Path, count: usize, spacing: Duration) -> usize {
    let mut open = Vec::with_capacity(count);
    let mut failures = 0;
    for _ in 0..count {
        match UnixStream::connect(path) {
            Ok(stream) => open.push(stream),
            Err(_) => failures += 1,
        }
        thread::sleep(spacing);
    }
    failures
}

/// Dial `count` clients `spacing` apart, closing each right after connect.
pub fn connect_close_cycles(path: &Path, count: usize, spacing: Duration) -> usize {
    let mut failures = 0;
    for _ in 0..count {
        match UnixStream::connect(path) {
            Ok(stream) => drop(stream),
            Err(_) => failures += 1,
        }
        thread::sleep(spacing);
    }
    failures
}

pub fn accepts_connections(path: &Path) -> bool {
    UnixStream::connect(path).is_ok()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
