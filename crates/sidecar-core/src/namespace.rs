//! Joining the Linux namespaces of a sibling process.
//!
//! The target is addressed by the pid of a still-living member. Joining is
//! two steps. [`NamespaceJoiner::prepare`] opens every target handle and
//! compares it with our own while `/proc` is still ours. [`PreparedJoin::enter`]
//! then only calls `setns(2)`. A target that exits halfway through cannot
//! leave this process split across namespaces, and nothing resolves
//! `/proc/self` after the mount namespace has changed.
//!
//! `setns(CLONE_NEWNS)` fails with `EINVAL` when the caller shares its
//! filesystem attributes with other threads, so [`PreparedJoin::enter`]
//! must run before any async runtime or helper thread is started.

use std::fmt;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use nix::sched::CloneFlags;
use tracing::{debug, info};

use crate::error::NamespaceError;

pub const DEFAULT_PROC_ROOT: &str = "/proc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    Mount,
    Pid,
}

impl NamespaceKind {
    /// Entry name under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Pid => "pid",
        }
    }

    fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Pid => CloneFlags::CLONE_NEWPID,
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// The namespaces of a running process, resolved once at startup.
#[derive(Debug, Clone)]
pub struct TargetNamespace {
    pid: i32,
    kinds: Vec<NamespaceKind>,
    proc_root: PathBuf,
}

impl TargetNamespace {
    pub fn new(pid: i32, kinds: Vec<NamespaceKind>) -> Self {
        Self {
            pid,
            kinds,
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }

    /// Resolve handles against a different procfs root.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn kinds(&self) -> &[NamespaceKind] {
        &self.kinds
    }

    /// `<proc_root>/<pid>/ns/<kind>`
    pub fn handle_path(&self, kind: NamespaceKind) -> PathBuf {
        self.proc_root
            .join(self.pid.to_string())
            .join("ns")
            .join(kind.proc_name())
    }

    fn own_handle_path(&self, kind: NamespaceKind) -> PathBuf {
        self.proc_root.join("self").join("ns").join(kind.proc_name())
    }
}

/// Moves the calling process into a target's namespaces.
pub trait NamespaceJoiner {
    /// Resolve the target without changing any namespace.
    fn prepare(&self, target: &TargetNamespace) -> Result<PreparedJoin, NamespaceError>;

    /// Returns the kinds that were actually entered; kinds the caller
    /// already shares with the target are skipped.
    fn join(&self, target: &TargetNamespace) -> Result<Vec<NamespaceKind>, NamespaceError> {
        self.prepare(target)?.enter()
    }
}

/// Open target handles for the namespaces we do not share yet.
#[derive(Debug)]
pub struct PreparedJoin {
    pid: i32,
    pending: Vec<(NamespaceKind, File)>,
}

impl PreparedJoin {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Kinds that [`enter`](Self::enter) will switch, in order.
    pub fn pending(&self) -> impl Iterator<Item = NamespaceKind> + '_ {
        self.pending.iter().map(|(kind, _)| *kind)
    }

    pub fn enter(self) -> Result<Vec<NamespaceKind>, NamespaceError> {
        let pid = self.pid;
        let mut entered = Vec::with_capacity(self.pending.len());
        for (kind, file) in self.pending {
            nix::sched::setns(&file, kind.clone_flag())
                .map_err(|source| NamespaceError::Setns { kind, pid, source })?;
            info!(pid, %kind, "entered namespace");
            entered.push(kind);
        }
        Ok(entered)
    }
}

/// [`NamespaceJoiner`] backed by `setns(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetnsJoiner;

impl NamespaceJoiner for SetnsJoiner {
    fn prepare(&self, target: &TargetNamespace) -> Result<PreparedJoin, NamespaceError> {
        let handles = target
            .kinds()
            .iter()
            .map(|&kind| open_handle(target, kind).map(|file| (kind, file)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pending = Vec::with_capacity(handles.len());
        for (kind, file) in handles {
            if shares_namespace(target, kind, &file)? {
                debug!(pid = target.pid(), %kind, "already in target namespace, skipping");
                continue;
            }
            pending.push((kind, file));
        }
        Ok(PreparedJoin {
            pid: target.pid(),
            pending,
        })
    }
}

fn open_handle(target: &TargetNamespace, kind: NamespaceKind) -> Result<File, NamespaceError> {
    let path = target.handle_path(kind);
    File::open(&path).map_err(|source| match source.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ESRCH) => NamespaceError::TargetGone { pid: target.pid() },
        _ => NamespaceError::Open { path, source },
    })
}

/// Compare the target handle with our own by (device, inode).
fn shares_namespace(
    target: &TargetNamespace,
    kind: NamespaceKind,
    handle: &File,
) -> Result<bool, NamespaceError> {
    let theirs = handle
        .metadata()
        .map_err(|source| NamespaceError::Inspect {
            path: target.handle_path(kind),
            source,
        })?;
    let own_path = target.own_handle_path(kind);
    let ours = std::fs::metadata(&own_path).map_err(|source| NamespaceError::Inspect {
        path: own_path.clone(),
        source,
    })?;
    Ok(theirs.dev() == ours.dev() && theirs.ino() == ours.ino())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    /// Lay out `<root>/<pid>/ns/<kind>` and `<root>/self/ns/<kind>` as plain files.
    fn fake_proc(root: &Path, pid: i32, kind: NamespaceKind, shared: bool) {
        let own = root.join("self").join("ns");
        let theirs = root.join(pid.to_string()).join("ns");
        std::fs::create_dir_all(&own).unwrap();
        std::fs::create_dir_all(&theirs).unwrap();
        std::fs::write(own.join(kind.proc_name()), b"").unwrap();
        if shared {
            std::fs::hard_link(own.join(kind.proc_name()), theirs.join(kind.proc_name())).unwrap();
        } else {
            std::fs::write(theirs.join(kind.proc_name()), b"").unwrap();
        }
    }

    #[test]
    fn handle_path_layout() {
        let target = TargetNamespace::new(123, vec![NamespaceKind::Mount]);
        assert_eq!(
            target.handle_path(NamespaceKind::Mount),
            PathBuf::from("/proc/123/ns/mnt")
        );
        assert_eq!(
            target.handle_path(NamespaceKind::Pid),
            PathBuf::from("/proc/123/ns/pid")
        );
    }

    #[test]
    fn missing_target_is_reported_as_gone() {
        let dir = tempfile::tempdir().unwrap();
        let target = TargetNamespace::new(999_999, vec![NamespaceKind::Mount])
            .with_proc_root(dir.path());
        let err = SetnsJoiner.join(&target).unwrap_err();
        assert!(
            matches!(err, NamespaceError::TargetGone { pid: 999_999 }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn shared_namespace_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 55, NamespaceKind::Mount, true);
        let target =
            TargetNamespace::new(55, vec![NamespaceKind::Mount]).with_proc_root(dir.path());
        let entered = SetnsJoiner.join(&target).unwrap();
        assert!(entered.is_empty());
    }

    #[test]
    fn setns_failure_is_surfaced() {
        // A regular file is not a namespace handle, so setns(2) rejects it.
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 56, NamespaceKind::Pid, false);
        let target = TargetNamespace::new(56, vec![NamespaceKind::Pid]).with_proc_root(dir.path());
        let err = SetnsJoiner.join(&target).unwrap_err();
        assert!(
            matches!(
                err,
                NamespaceError::Setns {
                    kind: NamespaceKind::Pid,
                    pid: 56,
                    ..
                }
            ),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn all_handles_opened_before_any_join() {
        // Mount handle is present but the pid handle is missing: nothing may be entered.
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 57, NamespaceKind::Mount, false);
        let target = TargetNamespace::new(57, vec![NamespaceKind::Mount, NamespaceKind::Pid])
            .with_proc_root(dir.path());
        let err = SetnsJoiner.join(&target).unwrap_err();
        assert!(matches!(err, NamespaceError::TargetGone { pid: 57 }));
    }

    #[test]
    fn own_handles_are_only_read_while_preparing() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 58, NamespaceKind::Mount, true);
        fake_proc(dir.path(), 58, NamespaceKind::Pid, false);
        let target = TargetNamespace::new(58, vec![NamespaceKind::Mount, NamespaceKind::Pid])
            .with_proc_root(dir.path());

        let prepared = SetnsJoiner.prepare(&target).unwrap();
        assert_eq!(prepared.pid(), 58);
        assert_eq!(prepared.pending().collect::<Vec<_>>(), vec![NamespaceKind::Pid]);

        // `/proc/self` no longer resolves, as inside a foreign procfs.
        std::fs::remove_dir_all(dir.path().join("self")).unwrap();
        let err = prepared.enter().unwrap_err();
        assert!(
            matches!(err, NamespaceError::Setns { kind: NamespaceKind::Pid, .. }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn missing_own_handle_fails_before_anything_is_entered() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 59, NamespaceKind::Mount, false);
        std::fs::create_dir_all(dir.path().join("59").join("ns")).unwrap();
        std::fs::write(dir.path().join("59").join("ns").join("pid"), b"").unwrap();
        let target = TargetNamespace::new(59, vec![NamespaceKind::Mount, NamespaceKind::Pid])
            .with_proc_root(dir.path());

        let err = SetnsJoiner.prepare(&target).unwrap_err();
        assert!(
            matches!(&err, NamespaceError::Inspect { path, .. } if path.ends_with("self/ns/pid")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn own_namespace_under_real_proc_is_a_noop() {
        let pid = i32::try_from(std::process::id()).unwrap();
        let target = TargetNamespace::new(pid, vec![NamespaceKind::Mount, NamespaceKind::Pid]);
        let entered = SetnsJoiner.join(&target).unwrap();
        assert!(entered.is_empty());
    }
}
