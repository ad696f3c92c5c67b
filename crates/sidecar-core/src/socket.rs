//! The bridge socket: a path-addressed Unix listener with an explicit backlog.
//!
//! The listen backlog is what turns a burst of near-simultaneous dialers
//! into queued connections rather than `ECONNREFUSED`, so it is a
//! configuration value and never left at whatever default the socket layer
//! picks.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};

use nix::sys::socket::{Backlog, listen};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::anchor::PathAnchor;
use crate::error::{Result, SidecarError};

pub const DEFAULT_BACKLOG: i32 = 1024;
pub const MIN_BACKLOG: i32 = 256;
/// Kernel upper bound (`SOMAXCONN`) on current Linux.
pub const MAX_BACKLOG: i32 = 4096;

/// Capture the directory that will hold the socket, before any mount
/// namespace change.
pub fn capture_anchor(path: &Path) -> Result<PathAnchor> {
    PathAnchor::capture(path).map_err(|source| SidecarError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug)]
enum Cleanup {
    Path(PathBuf),
    Anchor(PathAnchor),
}

/// A listening bridge socket, exclusively owned by this process.
///
/// The socket file is removed when the value is dropped.
#[derive(Debug)]
pub struct BridgeSocket {
    listener: UnixListener,
    path: PathBuf,
    backlog: i32,
    cleanup: Cleanup,
}

impl BridgeSocket {
    /// Bind at `path` in the current mount namespace.
    pub fn bind(path: &Path, backlog: i32) -> Result<Self> {
        let listener = listen_at(path, backlog).map_err(|source| SidecarError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), backlog, "bridge socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            backlog,
            cleanup: Cleanup::Path(path.to_path_buf()),
        })
    }

    /// Bind through an anchor captured before a mount namespace change.
    ///
    /// Changes the working directory to the anchor directory.
    pub fn bind_anchored(anchor: PathAnchor, backlog: i32) -> Result<Self> {
        let path = anchor.path();
        let listener = anchor
            .enter()
            .and_then(|()| listen_at(Path::new(anchor.name()), backlog))
            .map_err(|source| SidecarError::Bind {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), backlog, "bridge socket listening (anchored)");
        Ok(Self {
            listener,
            path,
            backlog,
            cleanup: Cleanup::Anchor(anchor),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    pub(crate) async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for BridgeSocket {
    fn drop(&mut self) {
        let result = match &self.cleanup {
            Cleanup::Path(path) => std::fs::remove_file(path),
            Cleanup::Anchor(anchor) => anchor.unlink(),
        };
        match result {
            Ok(()) => debug!(path = %self.path.display(), "removed bridge socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove bridge socket"),
        }
    }
}

fn listen_at(path: &Path, backlog: i32) -> io::Result<UnixListener> {
    clear_stale(path)?;
    let listener = StdUnixListener::bind(path)?;
    match apply_backlog(&listener, backlog) {
        Ok(()) => UnixListener::from_std(listener),
        Err(e) => {
            let _ = std::fs::remove_file(path);
            Err(e)
        }
    }
}

/// `listen(2)` on an already-listening socket replaces its backlog.
fn apply_backlog(listener: &StdUnixListener, backlog: i32) -> io::Result<()> {
    listen(listener, Backlog::new(backlog)?)?;
    listener.set_nonblocking(true)
}

/// Refuse a live socket, unlink a stale one left by a dead process.
fn clear_stale(path: &Path) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        ));
    }
    match StdUnixStream::connect(path) {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "socket is already being served",
        )),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)
        }
        Err(e) => Err(e),
    }
}
