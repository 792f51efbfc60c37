//! Filesystem abstraction served over NFS.
//!
//! Paths are passed around as lists of components relative to the export
//! root, which is the same shape the handle cache stores. [`OsFs`] backs
//! them with a directory on the local disk.
//!
//! Metadata mutation (chmod, chown, utimes) is a separate capability,
//! [`Change`], because not every backing store can honour it. Callers ask for
//! it through [`Filesystem::as_change`] and must cope with `None`.

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use tracing::{debug, trace};

/// Permission bits for files created through the export.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Kind of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link (never followed).
    Symlink,
    /// Sockets, fifos and devices.
    Other,
}

/// Attributes of a filesystem object, as reported by `lstat`.
#[derive(Debug, Clone)]
pub struct FileAttr {
    pub kind: FileKind,
    /// Permission bits only (`0o7777` mask).
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Bytes actually allocated on disk.
    pub used: u64,
    /// Inode number on the backing device.
    pub ino: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttr {
    /// Builds attributes from `std::fs::Metadata` obtained without following symlinks.
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };

        Self {
            kind,
            mode: meta.mode() & 0o7777,
            nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
            used: meta.blocks().saturating_mul(512),
            ino: meta.ino(),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        }
    }
}

/// Converts a `(seconds, nanoseconds)` pair since the epoch; pre-epoch times clamp to the epoch.
fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let secs = u64::try_from(secs).unwrap_or(0);
    let nsecs = u32::try_from(nsecs).unwrap_or(0);
    UNIX_EPOCH + Duration::new(secs, nsecs)
}

/// A single directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub attr: FileAttr,
}

/// Metadata mutation capability.
///
/// Only offered by filesystems that can persist ownership, permission bits
/// and timestamps. Only `chown` follows a final symlink; `chmod` and
/// `chtimes` refuse one with `ELOOP`.
pub trait Change: Send + Sync {
    /// Sets permission bits.
    fn chmod(&self, path: &[String], mode: u32) -> io::Result<()>;

    /// Changes ownership, following symlinks. `None` leaves the id untouched.
    fn chown(&self, path: &[String], uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    /// Changes ownership of the entry itself. `None` leaves the id untouched.
    fn lchown(&self, path: &[String], uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    /// Sets access and modification times. `None` leaves the time untouched.
    fn chtimes(
        &self,
        path: &[String],
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()>;
}

/// POSIX-like operations over a tree rooted somewhere.
///
/// All paths are component lists relative to the root; the empty list is the
/// root itself. Implementations must never let a path escape the root.
pub trait Filesystem: Send + Sync {
    /// Attributes of the entry, not following a final symlink.
    fn metadata(&self, path: &[String]) -> io::Result<FileAttr>;

    /// Lists a directory, sorted by name.
    fn read_dir(&self, path: &[String]) -> io::Result<Vec<DirEntryInfo>>;

    /// Reads up to `count` bytes at `offset`. The flag is true when the read
    /// reached end of file.
    fn read(&self, path: &[String], offset: u64, count: u32) -> io::Result<(Vec<u8>, bool)>;

    /// Writes `data` at `offset` into an existing file.
    fn write(&self, path: &[String], offset: u64, data: &[u8]) -> io::Result<()>;

    /// Creates a regular file. With `exclusive` an existing entry is an error;
    /// otherwise an existing file is left as is.
    fn create(&self, path: &[String], exclusive: bool) -> io::Result<()>;

    fn mkdir(&self, path: &[String]) -> io::Result<()>;

    /// Removes a file, symlink or empty directory.
    fn remove(&self, path: &[String]) -> io::Result<()>;

    fn rename(&self, from: &[String], to: &[String]) -> io::Result<()>;

    /// Creates a symlink at `link` pointing to `target` (stored verbatim).
    fn symlink(&self, target: &Path, link: &[String]) -> io::Result<()>;

    fn readlink(&self, path: &[String]) -> io::Result<PathBuf>;

    /// Sets the file length, zero-filling on growth.
    fn truncate(&self, path: &[String], size: u64) -> io::Result<()>;

    /// On-disk directory backing this filesystem, if there is one.
    fn local_root(&self) -> Option<&Path> {
        None
    }

    /// Metadata mutation capability, if this filesystem supports it.
    fn as_change(&self) -> Option<&dyn Change> {
        None
    }
}

/// Joins path components under `root`, rejecting anything that is not a
/// plain file name.
///
/// Intermediate components that are symlinks fail with `ELOOP`, so the
/// result never leaves `root` through a link. The final component is not
/// checked; callers that open it use [`no_follow`].
pub fn resolve_under(root: &Path, path: &[String]) -> io::Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    let Some((last, parents)) = path.split_last() else {
        return Ok(resolved);
    };
    for component in parents {
        validate_component(component)?;
        resolved.push(component);
        // Missing parents surface as NotFound from the operation itself
        if let Ok(meta) = fs::symlink_metadata(&resolved)
            && meta.file_type().is_symlink()
        {
            return Err(Errno::ELOOP.into());
        }
    }
    validate_component(last)?;
    resolved.push(last);
    Ok(resolved)
}

/// Makes `options` fail with `ELOOP` instead of opening through a final symlink.
pub(crate) fn no_follow(options: &mut OpenOptions) -> &mut OpenOptions {
    options.custom_flags(OFlag::O_NOFOLLOW.bits())
}

/// `lstat`s `path`, failing with `ELOOP` when it is a symlink.
pub(crate) fn lstat_not_symlink(path: &Path) -> io::Result<fs::Metadata> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Err(Errno::ELOOP.into());
    }
    Ok(meta)
}

fn validate_component(component: &str) -> io::Result<()> {
    let invalid = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\0');
    if invalid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid path component: {component:?}"),
        ));
    }
    Ok(())
}

/// Filesystem backed by a directory on the local disk.
#[derive(Debug, Clone)]
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    /// Creates a filesystem rooted at `root`. The directory is not touched
    /// until the first operation.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory this filesystem serves.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &[String]) -> io::Result<PathBuf> {
        resolve_under(&self.root, path)
    }
}

impl Filesystem for OsFs {
    fn metadata(&self, path: &[String]) -> io::Result<FileAttr> {
        let full = self.resolve(path)?;
        trace!(path = %full.display(), "lstat");
        fs::symlink_metadata(&full).map(|meta| FileAttr::from_metadata(&meta))
    }

    fn read_dir(&self, path: &[String]) -> io::Result<Vec<DirEntryInfo>> {
        let full = self.resolve(path)?;
        if fs::symlink_metadata(&full)?.file_type().is_symlink() {
            return Err(Errno::ENOTDIR.into());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                debug!(
                    dir = %full.display(),
                    name = ?entry.file_name(),
                    "Skipping non-UTF-8 entry"
                );
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                // Raced with a concurrent delete
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            entries.push(DirEntryInfo {
                name,
                attr: FileAttr::from_metadata(&meta),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, path: &[String], offset: u64, count: u32) -> io::Result<(Vec<u8>, bool)> {
        let full = self.resolve(path)?;
        let file = no_follow(OpenOptions::new().read(true)).open(&full)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok((Vec::new(), true));
        }

        let want = usize::try_from(u64::from(count).min(len - offset)).unwrap_or(usize::MAX);
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        let eof = offset + filled as u64 >= len;
        Ok((buf, eof))
    }

    fn write(&self, path: &[String], offset: u64, data: &[u8]) -> io::Result<()> {
        let full = self.resolve(path)?;
        let file = no_follow(OpenOptions::new().write(true)).open(&full)?;
        file.write_all_at(data, offset)
    }

    fn create(&self, path: &[String], exclusive: bool) -> io::Result<()> {
        let full = self.resolve(path)?;
        let mut options = OpenOptions::new();
        no_follow(options.write(true).mode(DEFAULT_FILE_MODE));
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true);
        }
        options.open(&full).map(drop)
    }

    fn mkdir(&self, path: &[String]) -> io::Result<()> {
        fs::create_dir(self.resolve(path)?)
    }

    fn remove(&self, path: &[String]) -> io::Result<()> {
        let full = self.resolve(path)?;
        if fs::symlink_metadata(&full)?.is_dir() {
            fs::remove_dir(&full)
        } else {
            fs::remove_file(&full)
        }
    }

    fn rename(&self, from: &[String], to: &[String]) -> io::Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)
    }

    fn symlink(&self, target: &Path, link: &[String]) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(link)?)
    }

    fn readlink(&self, path: &[String]) -> io::Result<PathBuf> {
        fs::read_link(self.resolve(path)?)
    }

    fn truncate(&self, path: &[String], size: u64) -> io::Result<()> {
        let full = self.resolve(path)?;
        no_follow(OpenOptions::new().write(true)).open(&full)?.set_len(size)
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// Turns raw protocol bytes into a path usable as a symlink target.
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    fn fixture() -> (TempDir, OsFs) {
        let dir = TempDir::new().unwrap();
        let fs = OsFs::new(dir.path());
        (dir, fs)
    }

    #[test]
    fn test_rejects_escaping_components() {
        let (_dir, fs) = fixture();
        for bad in [&[".."][..], &["a", ".."], &["."], &[""], &["a/b"], &["nul\0"]] {
            let err = fs.metadata(&p(bad)).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{bad:?}");
        }
    }

    #[test]
    fn test_create_write_read() {
        let (_dir, fs) = fixture();
        let file = p(&["hello.txt"]);
        fs.create(&file, false).unwrap();
        fs.write(&file, 0, b"hello world").unwrap();

        let (data, eof) = fs.read(&file, 0, 5).unwrap();
        assert_eq!(data, b"hello");
        assert!(!eof);

        let (data, eof) = fs.read(&file, 6, 100).unwrap();
        assert_eq!(data, b"world");
        assert!(eof);

        let (data, eof) = fs.read(&file, 64, 10).unwrap();
        assert!(data.is_empty());
        assert!(eof);
    }

    #[test]
    fn test_create_exclusive_conflicts() {
        let (_dir, fs) = fixture();
        let file = p(&["once"]);
        fs.create(&file, true).unwrap();
        let err = fs.create(&file, true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        // Unchecked create of an existing file is fine
        fs.create(&file, false).unwrap();
    }

    #[test]
    fn test_read_dir_sorted_with_kinds() {
        let (_dir, fs) = fixture();
        fs.mkdir(&p(&["b_dir"])).unwrap();
        fs.create(&p(&["a_file"]), false).unwrap();
        fs.symlink(Path::new("a_file"), &p(&["c_link"])).unwrap();

        let entries = fs.read_dir(&[]).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a_file", "b_dir", "c_link"]);
        assert_eq!(entries[0].attr.kind, FileKind::File);
        assert_eq!(entries[1].attr.kind, FileKind::Directory);
        assert_eq!(entries[2].attr.kind, FileKind::Symlink);
        assert_eq!(fs.readlink(&p(&["c_link"])).unwrap(), PathBuf::from("a_file"));
    }

    #[test]
    fn test_remove_and_rename() {
        let (_dir, fs) = fixture();
        fs.mkdir(&p(&["d"])).unwrap();
        fs.create(&p(&["d", "f"]), false).unwrap();

        let err = fs.remove(&p(&["d"])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::DirectoryNotEmpty);

        fs.rename(&p(&["d", "f"]), &p(&["g"])).unwrap();
        fs.remove(&p(&["d"])).unwrap();
        assert!(fs.metadata(&p(&["g"])).is_ok());
        assert_eq!(
            fs.metadata(&p(&["d"])).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_truncate() {
        let (_dir, fs) = fixture();
        let file = p(&["t"]);
        fs.create(&file, false).unwrap();
        fs.write(&file, 0, b"0123456789").unwrap();
        fs.truncate(&file, 4).unwrap();
        assert_eq!(fs.metadata(&file).unwrap().size, 4);
        fs.truncate(&file, 8).unwrap();
        let (data, _) = fs.read(&file, 0, 100).unwrap();
        assert_eq!(data, b"0123\0\0\0\0");
    }

    fn is_eloop(err: &io::Error) -> bool {
        err.raw_os_error() == Some(Errno::ELOOP as i32)
    }

    #[test]
    fn test_final_symlink_is_not_followed() {
        let (dir, fs) = fixture();
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("secret");
        std::fs::write(&secret, b"original").unwrap();
        fs.symlink(&secret, &p(&["link"])).unwrap();
        let link = p(&["link"]);

        assert!(is_eloop(&fs.read(&link, 0, 64).unwrap_err()));
        assert!(is_eloop(&fs.write(&link, 0, b"changed").unwrap_err()));
        assert!(is_eloop(&fs.truncate(&link, 0).unwrap_err()));
        assert!(is_eloop(&fs.create(&link, false).unwrap_err()));
        assert_eq!(std::fs::read(&secret).unwrap(), b"original");

        // The link itself is still visible
        assert_eq!(fs.metadata(&link).unwrap().kind, FileKind::Symlink);
        assert_eq!(fs.readlink(&link).unwrap(), secret);
        drop(dir);
    }

    #[test]
    fn test_dangling_symlink_create_stays_inside() {
        let (_dir, fs) = fixture();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("planted");
        fs.symlink(&target, &p(&["trap"])).unwrap();

        assert!(is_eloop(&fs.create(&p(&["trap"]), false).unwrap_err()));
        assert!(!target.exists());
    }

    #[test]
    fn test_symlinked_directory_is_not_traversed() {
        let (_dir, fs) = fixture();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("f"), b"x").unwrap();
        fs.symlink(outside.path(), &p(&["out"])).unwrap();

        assert!(is_eloop(&fs.metadata(&p(&["out", "f"])).unwrap_err()));
        assert!(is_eloop(&fs.create(&p(&["out", "new"]), true).unwrap_err()));
        assert!(!outside.path().join("new").exists());
        assert_eq!(
            fs.read_dir(&p(&["out"])).unwrap_err().kind(),
            io::ErrorKind::NotADirectory
        );
    }

    #[test]
    fn test_os_fs_has_no_change_capability_by_itself() {
        let (dir, fs) = fixture();
        assert!(fs.as_change().is_none());
        assert_eq!(fs.local_root(), Some(dir.path()));
    }
}
