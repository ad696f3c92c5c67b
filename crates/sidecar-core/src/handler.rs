//! What happens to a connection after the accept loop hands it off.
//!
//! Handlers never interpret the bytes they move; the protocol belongs to
//! whoever sits on either end of the bridge.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const HOLD_BUF_SIZE: usize = 4 * 1024;

/// A per-connection task body. Errors stay with the connection that raised them.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: UnixStream, cancel: CancellationToken) -> io::Result<()>;
}

/// Keeps the connection open until the peer hangs up or shutdown begins.
///
/// Anything the peer writes is discarded. Consumers use the connection
/// itself (and its peer credentials) as proof that the sidecar is alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct HoldOpen;

#[async_trait]
impl ConnectionHandler for HoldOpen {
    async fn handle(&self, mut stream: UnixStream, cancel: CancellationToken) -> io::Result<()> {
        let mut buf = [0u8; HOLD_BUF_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                n = stream.read(&mut buf) => {
                    if n? == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Splices each client onto a fresh connection to an upstream socket.
#[derive(Debug, Clone)]
pub struct Forward {
    upstream: PathBuf,
}

impl Forward {
    pub fn new(upstream: impl Into<PathBuf>) -> Self {
        Self {
            upstream: upstream.into(),
        }
    }
}

#[async_trait]
impl ConnectionHandler for Forward {
    async fn handle(&self, mut client: UnixStream, cancel: CancellationToken) -> io::Result<()> {
        let mut upstream = UnixStream::connect(&self.upstream).await?;
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            copied = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
                let (to_upstream, to_client) = copied?;
                trace!(to_upstream, to_client, "forwarded connection closed");
                Ok(())
            }
        }
    }
}
