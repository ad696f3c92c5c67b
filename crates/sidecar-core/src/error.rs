use std::io;
use std::path::PathBuf;

use crate::namespace::NamespaceKind;

/// Failure to enter the target's namespaces.
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("target process {pid} no longer exists")]
    TargetGone { pid: i32 },

    #[error("open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("inspect {}: {source}", path.display())]
    Inspect { path: PathBuf, source: io::Error },

    #[error("setns({kind}) for pid {pid}: {source}")]
    Setns {
        kind: NamespaceKind,
        pid: i32,
        source: nix::errno::Errno,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to move process into the namespace: {0}")]
    Namespace(#[from] NamespaceError),

    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to bind socket {}: {source}", path.display())]
    Bind { path: PathBuf, source: io::Error },

    #[error("failed to create readiness marker {}: {source}", path.display())]
    Marker { path: PathBuf, source: io::Error },

    #[error("resource daemon {}: {detail}", program.display())]
    Daemon { program: PathBuf, detail: String },

    #[error("listener {} failed: {source}", path.display())]
    Serve { path: PathBuf, source: io::Error },

    #[error("runtime error: {0}")]
    Runtime(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SidecarError>;
