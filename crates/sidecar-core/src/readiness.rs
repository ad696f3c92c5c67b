//! Two-phase readiness: configuring, then ready.
//!
//! Inside the daemon readiness is a flag flipped exactly once. Outside it is
//! the existence of a marker file, checked by a separate probe invocation of
//! the same binary.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::anchor::PathAnchor;
use crate::error::{Result, SidecarError};

#[derive(Debug)]
enum Marker {
    Path(PathBuf),
    /// Created through a directory captured before a mount namespace change.
    Anchored(PathAnchor),
}

impl Marker {
    fn path(&self) -> PathBuf {
        match self {
            Self::Path(path) => path.clone(),
            Self::Anchored(anchor) => anchor.path(),
        }
    }

    fn create(&self) -> io::Result<()> {
        match self {
            Self::Path(path) => OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(path)
                .map(drop),
            Self::Anchored(anchor) => anchor.create_file().map(drop),
        }
    }
}

#[derive(Debug, Default)]
pub struct Readiness {
    marker: Option<Marker>,
    ready: AtomicBool,
}

impl Readiness {
    pub fn new(marker: Option<PathBuf>) -> Self {
        Self {
            marker: marker.map(Marker::Path),
            ready: AtomicBool::new(false),
        }
    }

    /// Readiness whose marker lives in the directory behind `anchor`.
    pub fn anchored(anchor: PathAnchor) -> Self {
        Self {
            marker: Some(Marker::Anchored(anchor)),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Publish readiness. Must only be called once the listener is bound.
    ///
    /// Idempotent: later calls neither rewrite the marker nor fail.
    pub fn mark_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        if let Some(marker) = &self.marker {
            marker.create().map_err(|source| SidecarError::Marker {
                path: marker.path(),
                source,
            })?;
            info!(marker = %marker.path().display(), "readiness marker written");
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Capture the marker's directory before a mount namespace change.
pub fn capture_anchor(marker: &Path) -> Result<PathAnchor> {
    PathAnchor::capture(marker).map_err(|source| SidecarError::Marker {
        path: marker.to_path_buf(),
        source,
    })
}

/// Health-check probe: `true` if the marker exists. Never creates anything.
pub fn probe(marker: &Path) -> bool {
    match marker.try_exists() {
        Ok(exists) => exists,
        Err(e) => {
            debug!(marker = %marker.display(), error = %e, "readiness probe failed");
            false
        }
    }
}
