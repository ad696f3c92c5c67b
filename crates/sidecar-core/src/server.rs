//! The accept loop shared by every sidecar.
//!
//! Readiness is published strictly before the first `accept`. Each accepted
//! stream is handed to its own task immediately, so an idle or slow peer can
//! never hold up the next dialer. Shutdown closes the listener first, then
//! cancels and drains the connection tasks for a bounded time.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SidecarError};
use crate::handler::ConnectionHandler;
use crate::lifecycle::{Shutdown, ShutdownReason};
use crate::readiness::Readiness;
use crate::socket::BridgeSocket;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after `EMFILE`/`ENFILE` so a process at its descriptor limit does
/// not spin on accept while connections wind down.
const FD_EXHAUSTED_BACKOFF: Duration = Duration::from_millis(50);

/// How a completed `serve()` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub accepted: u64,
    pub reason: ShutdownReason,
}

pub struct BridgeServer {
    socket: BridgeSocket,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: Shutdown,
    readiness: Arc<Readiness>,
    drain_timeout: Duration,
}

impl BridgeServer {
    pub fn new(
        socket: BridgeSocket,
        handler: Arc<dyn ConnectionHandler>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            socket,
            handler,
            shutdown,
            readiness: Arc::new(Readiness::default()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_readiness(mut self, readiness: Arc<Readiness>) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn readiness(&self) -> Arc<Readiness> {
        Arc::clone(&self.readiness)
    }

    /// Serve until shutdown is requested or the listener fails.
    ///
    /// The socket file is gone by the time this returns, on every path.
    pub async fn serve(self) -> Result<ServeSummary> {
        let Self {
            socket,
            handler,
            mut shutdown,
            readiness,
            drain_timeout,
        } = self;

        readiness.mark_ready()?;
        info!(path = %socket.path().display(), backlog = socket.backlog(), "listening");

        let cancel = CancellationToken::new();
        let mut connections = JoinSet::new();
        let mut accepted: u64 = 0;

        let reason = loop {
            tokio::select! {
                reason = shutdown.wait() => break reason,
                result = socket.accept() => match result {
                    Ok(stream) => {
                        accepted += 1;
                        let handler = Arc::clone(&handler);
                        let token = cancel.child_token();
                        connections.spawn(async move {
                            if let Err(e) = handler.handle(stream, token).await {
                                debug!(error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "transient accept failure, retrying");
                        if is_fd_exhausted(&e) {
                            tokio::time::sleep(FD_EXHAUSTED_BACKOFF).await;
                        }
                    }
                    Err(source) => {
                        error!(error = %source, accepted, "listener failed");
                        cancel.cancel();
                        return Err(SidecarError::Serve {
                            path: socket.path().to_path_buf(),
                            source,
                        });
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!(error = %e, "connection task panicked");
                    }
                }
            }
        };

        info!(%reason, accepted, "shutdown requested, closing listener");
        drop(socket);
        cancel.cancel();
        drain(&mut connections, drain_timeout).await;
        info!(%reason, accepted, "stopped");

        Ok(ServeSummary { accepted, reason })
    }
}

async fn drain(connections: &mut JoinSet<()>, timeout: Duration) {
    if connections.is_empty() {
        return;
    }
    debug!(in_flight = connections.len(), "draining connections");
    let drained = tokio::time::timeout(timeout, async {
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                error!(error = %e, "connection task panicked during drain");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            timeout_ms = timeout.as_millis() as u64,
            "drain timeout elapsed, aborting connections"
        );
        connections.abort_all();
    }
}

fn is_transient(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Interrupted
        || matches!(
            e.raw_os_error(),
            Some(libc::ECONNABORTED) | Some(libc::EINTR) | Some(libc::EMFILE) | Some(libc::ENFILE)
        )
}

fn is_fd_exhausted(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}
