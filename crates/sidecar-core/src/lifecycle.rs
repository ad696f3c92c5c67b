//! Signal-driven shutdown.
//!
//! Two classes of signal end a sidecar's life: conventional termination
//! requests (SIGTERM, SIGINT) and SIGCHLD. The latter arrives because the
//! sidecar shares a PID namespace with the workload container and is
//! positioned to reap it, so a SIGCHLD means the sibling has gone away.
//!
//! Signals are never inspected from the accept loop. A waiter task turns the
//! first one into a [`ShutdownReason`] published on a `watch` channel, and
//! everything else observes that channel.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM
    Terminate,
    /// SIGINT
    Interrupt,
    /// SIGCHLD: the sibling container (or our own resource daemon) exited.
    SiblingExited,
    /// Requested in-process through a [`ShutdownTrigger`].
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Terminate => "terminate",
            Self::Interrupt => "interrupt",
            Self::SiblingExited => "sibling-exited",
            Self::Requested => "requested",
        };
        f.write_str(s)
    }
}

/// Receiving side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl Shutdown {
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    ///
    /// Pends forever if every trigger is dropped without firing.
    pub async fn wait(&mut self) -> ShutdownReason {
        loop {
            let current = *self.rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Sending side of the shutdown channel. The first reason wins.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownTrigger {
    /// Returns `true` if this call initiated shutdown.
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }
}

/// A connected trigger/receiver pair with no signal handling attached.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(None);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

/// Watches process signals and publishes the first shutdown reason.
///
/// Must be installed inside a Tokio runtime, before the listener is bound,
/// so that no signal delivered after startup is lost.
#[derive(Debug)]
pub struct LifecycleMonitor {
    shutdown: Shutdown,
    waiter: JoinHandle<()>,
}

impl LifecycleMonitor {
    /// Register SIGTERM, SIGINT and SIGCHLD. Registration failure is fatal.
    pub fn install() -> io::Result<Self> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigchld = signal(SignalKind::child())?;

        let (trigger, shutdown) = shutdown_channel();
        let waiter = tokio::spawn(async move {
            let reason = tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    ShutdownReason::Terminate
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    ShutdownReason::Interrupt
                }
                _ = sigchld.recv() => {
                    info!("received SIGCHLD, sibling exited, shutting down");
                    ShutdownReason::SiblingExited
                }
            };
            trigger.fire(reason);
        });

        Ok(Self {
            shutdown,
            waiter,
        })
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }
}

impl Drop for LifecycleMonitor {
    fn drop(&mut self) {
        self.waiter.abort();
    }
}
