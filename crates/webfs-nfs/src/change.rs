//! Metadata-change capability for disk-backed filesystems.

use std::fs::{self, File, FileTimes, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::filesystem::{
    Change, DirEntryInfo, FileAttr, Filesystem, lstat_not_symlink, no_follow, resolve_under,
};

/// Returns the metadata-change capability of `fs`, or `None` when the
/// filesystem cannot persist metadata changes.
pub fn change_capability(fs: &dyn Filesystem) -> Option<&dyn Change> {
    fs.as_change()
}

/// Wraps a filesystem so that metadata changes are available whenever the
/// base can honour them.
///
/// A base that already offers [`Change`] keeps its own implementation. A
/// base rooted on the local disk gets chmod/chown/chtimes applied directly
/// to the resolved path. Anything else reports no capability.
#[derive(Debug, Clone)]
pub struct ChangeFs<F> {
    inner: F,
}

impl<F: Filesystem> ChangeFs<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    fn disk_path(&self, path: &[String]) -> io::Result<PathBuf> {
        let root = self
            .inner
            .local_root()
            .ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))?;
        resolve_under(root, path)
    }
}

impl<F: Filesystem> Filesystem for ChangeFs<F> {
    fn metadata(&self, path: &[String]) -> io::Result<FileAttr> {
        self.inner.metadata(path)
    }

    fn read_dir(&self, path: &[String]) -> io::Result<Vec<DirEntryInfo>> {
        self.inner.read_dir(path)
    }

    fn read(&self, path: &[String], offset: u64, count: u32) -> io::Result<(Vec<u8>, bool)> {
        self.inner.read(path, offset, count)
    }

    fn write(&self, path: &[String], offset: u64, data: &[u8]) -> io::Result<()> {
        self.inner.write(path, offset, data)
    }

    fn create(&self, path: &[String], exclusive: bool) -> io::Result<()> {
        self.inner.create(path, exclusive)
    }

    fn mkdir(&self, path: &[String]) -> io::Result<()> {
        self.inner.mkdir(path)
    }

    fn remove(&self, path: &[String]) -> io::Result<()> {
        self.inner.remove(path)
    }

    fn rename(&self, from: &[String], to: &[String]) -> io::Result<()> {
        self.inner.rename(from, to)
    }

    fn symlink(&self, target: &Path, link: &[String]) -> io::Result<()> {
        self.inner.symlink(target, link)
    }

    fn readlink(&self, path: &[String]) -> io::Result<PathBuf> {
        self.inner.readlink(path)
    }

    fn truncate(&self, path: &[String], size: u64) -> io::Result<()> {
        self.inner.truncate(path, size)
    }

    fn local_root(&self) -> Option<&Path> {
        self.inner.local_root()
    }

    fn as_change(&self) -> Option<&dyn Change> {
        if let Some(change) = self.inner.as_change() {
            return Some(change);
        }
        if self.inner.local_root().is_some() {
            return Some(self);
        }
        None
    }
}

impl<F: Filesystem> Change for ChangeFs<F> {
    fn chmod(&self, path: &[String], mode: u32) -> io::Result<()> {
        let full = self.disk_path(path)?;
        debug!(path = %full.display(), mode = format_args!("{mode:o}"), "chmod");
        lstat_not_symlink(&full)?;
        fs::set_permissions(&full, Permissions::from_mode(mode & 0o7777))
    }

    fn chown(&self, path: &[String], uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        let full = self.disk_path(path)?;
        debug!(path = %full.display(), ?uid, ?gid, "chown");
        std::os::unix::fs::chown(&full, uid, gid)
    }

    fn lchown(&self, path: &[String], uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        let full = self.disk_path(path)?;
        debug!(path = %full.display(), ?uid, ?gid, "lchown");
        std::os::unix::fs::lchown(&full, uid, gid)
    }

    fn chtimes(
        &self,
        path: &[String],
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()> {
        let full = self.disk_path(path)?;
        debug!(path = %full.display(), ?atime, ?mtime, "chtimes");
        let mut times = FileTimes::new();
        if let Some(atime) = atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = mtime {
            times = times.set_modified(mtime);
        }
        // Directories can't be opened for writing; read-only handles still accept futimens
        let file = if lstat_not_symlink(&full)?.is_dir() {
            no_follow(File::options().read(true)).open(&full)?
        } else {
            no_follow(File::options().write(true)).open(&full)?
        };
        file.set_times(times)
    }
}
