//! Serve flags shared by every sidecar binary.

use std::time::Duration;

use clap::Args;

use crate::error::{Result, SidecarError};
use crate::server::DEFAULT_DRAIN_TIMEOUT;
use crate::socket::{DEFAULT_BACKLOG, MAX_BACKLOG, MIN_BACKLOG};

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Listen backlog for the bridge socket
    #[arg(long, env = "SIDECAR_BACKLOG", default_value_t = DEFAULT_BACKLOG)]
    pub backlog: i32,
    /// How long to wait for open connections after shutdown begins
    #[arg(
        long,
        env = "SIDECAR_DRAIN_TIMEOUT_MS",
        default_value_t = DEFAULT_DRAIN_TIMEOUT.as_millis() as u64
    )]
    pub drain_timeout_ms: u64,
}

/// Validated [`ServeArgs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeConfig {
    pub backlog: i32,
    pub drain_timeout: Duration,
}

impl ServeArgs {
    pub fn validate(&self) -> Result<ServeConfig> {
        if !(MIN_BACKLOG..=MAX_BACKLOG).contains(&self.backlog) {
            return Err(SidecarError::Config(format!(
                "--backlog must be between {MIN_BACKLOG} and {MAX_BACKLOG}, got {}",
                self.backlog
            )));
        }
        Ok(ServeConfig {
            backlog: self.backlog,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        })
    }
}
