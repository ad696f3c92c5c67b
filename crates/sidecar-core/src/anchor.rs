//! Directory handles captured before a mount namespace change.
//!
//! Once the process has moved into another mount namespace, an absolute
//! path may resolve to a different filesystem. A [`PathAnchor`] holds an
//! `O_PATH` descriptor on the parent directory as seen from the original
//! namespace, and every later operation on the entry goes through it.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{OFlag, openat};
use nix::sys::stat::Mode;
use nix::unistd::{UnlinkatFlags, fchdir, unlinkat};

#[derive(Debug)]
pub struct PathAnchor {
    dir: File,
    dir_path: PathBuf,
    name: OsString,
}

impl PathAnchor {
    /// Open the parent of `path`. The entry itself need not exist yet.
    pub fn capture(path: &Path) -> io::Result<Self> {
        let name = path
            .file_name()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?
            .to_os_string();
        let dir_path = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let dir = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
            .open(&dir_path)?;
        Ok(Self {
            dir,
            dir_path,
            name,
        })
    }

    /// The anchored path as seen from the original namespace.
    pub fn path(&self) -> PathBuf {
        self.dir_path.join(&self.name)
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// Make the anchor directory the working directory.
    pub fn enter(&self) -> io::Result<()> {
        fchdir(&self.dir)?;
        Ok(())
    }

    /// Create the entry as an empty regular file, keeping any existing one.
    pub fn create_file(&self) -> io::Result<OwnedFd> {
        let fd = openat(
            &self.dir,
            self.name.as_os_str(),
            OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o644),
        )?;
        Ok(fd)
    }

    pub fn unlink(&self) -> io::Result<()> {
        unlinkat(&self.dir, self.name.as_os_str(), UnlinkatFlags::NoRemoveDir)?;
        Ok(())
    }
}
