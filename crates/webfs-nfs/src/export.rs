//! `nfsserve` bridge.
//!
//! [`HandlerExport`] implements `NFSFileSystem` on top of a handler stack.
//! File ids on the wire are the handler's 8-byte handles, so every id the
//! client sees round-trips through [`NfsHandler::from_handle`].

use std::io;
use std::os::unix::ffi::OsStringExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nfsserve::nfs::{
    fattr3, fileid3, filename3, ftype3, nfspath3, nfsstat3, nfsstring, nfstime3, sattr3,
    set_atime, set_gid3, set_mode3, set_mtime, set_size3, set_uid3, specdata3,
};
use nfsserve::vfs::{DirEntry, NFSFileSystem, ReadDirResult, VFSCapabilities};
use tracing::{debug, error, trace};

use crate::caching::{ROOT_HANDLE_ID, decode_handle, encode_handle};
use crate::error::io_error_to_nfsstat;
use crate::filesystem::{FileAttr, FileKind, path_from_bytes};
use crate::handler::{FsRef, FsStat, NfsHandler, Resolved};

/// Exposes a handler stack as an `nfsserve` filesystem.
pub struct HandlerExport<H> {
    handler: Arc<H>,
    root_id: fileid3,
    generation: u64,
}

impl<H: NfsHandler + 'static> HandlerExport<H> {
    /// Creates an export whose root is `root`. The root handle is registered
    /// with the handler immediately.
    pub fn new(handler: Arc<H>, root: &FsRef) -> Self {
        let root_id = decode_handle(&handler.to_handle(root, &[])).unwrap_or(ROOT_HANDLE_ID);
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            handler,
            root_id,
            generation,
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Filesystem statistics for the tree containing `id`.
    pub async fn fs_stat(&self, id: fileid3) -> Result<FsStat, nfsstat3> {
        let (fs, _) = self.resolve(id)?;
        let handler = Arc::clone(&self.handler);
        blocking(move || {
            let mut stat = FsStat::default();
            handler.fs_stat(fs.as_ref(), &mut stat)?;
            Ok(stat)
        })
        .await
    }

    fn resolve(&self, id: fileid3) -> Result<Resolved, nfsstat3> {
        match self.handler.from_handle(&encode_handle(id)) {
            Ok(Some(resolved)) => Ok(resolved),
            Ok(None) => Err(nfsstat3::NFS3ERR_BADHANDLE),
            Err(e) => {
                trace!(id, error = %e, "Handle did not resolve");
                Err(e.into())
            }
        }
    }

    fn id_for(&self, fs: &FsRef, path: &[String]) -> Result<fileid3, nfsstat3> {
        decode_handle(&self.handler.to_handle(fs, path)).map_err(nfsstat3::from)
    }

    async fn attr_for(&self, fs: &FsRef, path: &[String]) -> Result<(fileid3, fattr3), nfsstat3> {
        let id = self.id_for(fs, path)?;
        let attr = metadata(fs, path.to_vec()).await?;
        Ok((id, to_fattr(id, &attr)))
    }

    /// Applies settable attributes. Size goes through `truncate`; everything
    /// else needs the change capability.
    async fn apply_sattr(&self, fs: &FsRef, path: &[String], attr: sattr3) -> Result<(), nfsstat3> {
        let handler = Arc::clone(&self.handler);
        let fs = FsRef::clone(fs);
        let path = path.to_vec();
        blocking(move || {
            if let set_size3::size(size) = attr.size {
                fs.truncate(&path, size)?;
            }

            let mode = match attr.mode {
                set_mode3::mode(mode) => Some(mode),
                set_mode3::Void => None,
            };
            let uid = match attr.uid {
                set_uid3::uid(uid) => Some(uid),
                set_uid3::Void => None,
            };
            let gid = match attr.gid {
                set_gid3::gid(gid) => Some(gid),
                set_gid3::Void => None,
            };
            let atime = match attr.atime {
                set_atime::DONT_CHANGE => None,
                set_atime::SET_TO_SERVER_TIME => Some(SystemTime::now()),
                set_atime::SET_TO_CLIENT_TIME(t) => Some(from_nfs_time(t)),
            };
            let mtime = match attr.mtime {
                set_mtime::DONT_CHANGE => None,
                set_mtime::SET_TO_SERVER_TIME => Some(SystemTime::now()),
                set_mtime::SET_TO_CLIENT_TIME(t) => Some(from_nfs_time(t)),
            };

            let untouched = mode.is_none() && uid.is_none() && gid.is_none();
            if untouched && atime.is_none() && mtime.is_none() {
                return Ok(());
            }
            let change = handler
                .change(fs.as_ref())
                .ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))?;
            if let Some(mode) = mode {
                change.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                change.lchown(&path, uid, gid)?;
            }
            if atime.is_some() || mtime.is_some() {
                change.chtimes(&path, atime, mtime)?;
            }
            Ok(())
        })
        .await
    }
}

/// Runs filesystem work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T, nfsstat3>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            trace!(error = %e, "Filesystem operation failed");
            Err(io_error_to_nfsstat(&e))
        }
        Err(e) => {
            error!(error = %e, "Filesystem task panicked");
            Err(nfsstat3::NFS3ERR_SERVERFAULT)
        }
    }
}

async fn metadata(fs: &FsRef, path: Vec<String>) -> Result<FileAttr, nfsstat3> {
    let fs = FsRef::clone(fs);
    blocking(move || fs.metadata(&path)).await
}

fn filename_to_str(filename: &filename3) -> Result<&str, nfsstat3> {
    std::str::from_utf8(filename).map_err(|_| nfsstat3::NFS3ERR_INVAL)
}

fn child_path(parent: &[String], name: &str) -> Vec<String> {
    let mut path = Vec::with_capacity(parent.len() + 1);
    path.extend_from_slice(parent);
    path.push(name.to_string());
    path
}

fn to_nfs_time(t: SystemTime) -> nfstime3 {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    // NFSv3 seconds are 32 bits and wrap
    #[allow(clippy::cast_possible_truncation)]
    nfstime3 {
        seconds: d.as_secs() as u32,
        nseconds: d.subsec_nanos(),
    }
}

fn from_nfs_time(t: nfstime3) -> SystemTime {
    UNIX_EPOCH + Duration::new(u64::from(t.seconds), t.nseconds)
}

fn to_fattr(fileid: fileid3, attr: &FileAttr) -> fattr3 {
    let ftype = match attr.kind {
        FileKind::File => ftype3::NF3REG,
        FileKind::Directory => ftype3::NF3DIR,
        FileKind::Symlink => ftype3::NF3LNK,
        FileKind::Other => ftype3::NF3FIFO,
    };
    fattr3 {
        ftype,
        mode: attr.mode,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        size: attr.size,
        used: attr.used,
        rdev: specdata3::default(),
        fsid: 0,
        fileid,
        atime: to_nfs_time(attr.atime),
        mtime: to_nfs_time(attr.mtime),
        ctime: to_nfs_time(attr.ctime),
    }
}

#[async_trait]
impl<H: NfsHandler + 'static> NFSFileSystem for HandlerExport<H> {
    fn capabilities(&self) -> VFSCapabilities {
        VFSCapabilities::ReadWrite
    }

    fn root_dir(&self) -> fileid3 {
        self.root_id
    }

    fn serverid(&self) -> [u8; 8] {
        self.generation.to_be_bytes()
    }

    async fn lookup(&self, dirid: fileid3, filename: &filename3) -> Result<fileid3, nfsstat3> {
        let (fs, dir) = self.resolve(dirid)?;
        let name = filename_to_str(filename)?;
        trace!(dirid, name, "lookup");

        let dir_attr = metadata(&fs, dir.clone()).await?;
        if dir_attr.kind != FileKind::Directory {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        match name {
            "." => Ok(dirid),
            ".." => {
                let parent = dir.split_last().map_or(&[][..], |(_, rest)| rest);
                self.id_for(&fs, parent)
            }
            _ => {
                let path = child_path(&dir, name);
                metadata(&fs, path.clone()).await?;
                self.id_for(&fs, &path)
            }
        }
    }

    async fn getattr(&self, id: fileid3) -> Result<fattr3, nfsstat3> {
        let (fs, path) = self.resolve(id)?;
        trace!(id, "getattr");
        let attr = metadata(&fs, path).await?;
        Ok(to_fattr(id, &attr))
    }

    async fn setattr(&self, id: fileid3, setattr: sattr3) -> Result<fattr3, nfsstat3> {
        let (fs, path) = self.resolve(id)?;
        debug!(id, ?setattr, "setattr");
        self.apply_sattr(&fs, &path, setattr).await?;
        let attr = metadata(&fs, path).await?;
        Ok(to_fattr(id, &attr))
    }

    async fn read(
        &self,
        id: fileid3,
        offset: u64,
        count: u32,
    ) -> Result<(Vec<u8>, bool), nfsstat3> {
        let (fs, path) = self.resolve(id)?;
        trace!(id, offset, count, "read");
        blocking(move || fs.read(&path, offset, count)).await
    }

    async fn write(&self, id: fileid3, offset: u64, data: &[u8]) -> Result<fattr3, nfsstat3> {
        let (fs, path) = self.resolve(id)?;
        trace!(id, offset, len = data.len(), "write");
        let data = data.to_vec();
        let attr = blocking(move || {
            fs.write(&path, offset, &data)?;
            fs.metadata(&path)
        })
        .await?;
        Ok(to_fattr(id, &attr))
    }

    async fn create(
        &self,
        dirid: fileid3,
        filename: &filename3,
        attr: sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let (fs, dir) = self.resolve(dirid)?;
        let name = filename_to_str(filename)?;
        debug!(dirid, name, "create");

        let path = child_path(&dir, name);
        {
            let fs = FsRef::clone(&fs);
            let path = path.clone();
            blocking(move || fs.create(&path, false)).await?;
        }
        // Attributes that the store cannot hold are dropped rather than failing the create
        match self.apply_sattr(&fs, &path, attr).await {
            Ok(()) | Err(nfsstat3::NFS3ERR_NOTSUPP) => {}
            Err(e) => return Err(e),
        }
        self.attr_for(&fs, &path).await
    }

    async fn create_exclusive(
        &self,
        dirid: fileid3,
        filename: &filename3,
    ) -> Result<fileid3, nfsstat3> {
        let (fs, dir) = self.resolve(dirid)?;
        let name = filename_to_str(filename)?;
        debug!(dirid, name, "create_exclusive");

        let path = child_path(&dir, name);
        {
            let fs = FsRef::clone(&fs);
            let path = path.clone();
            blocking(move || fs.create(&path, true)).await?;
        }
        self.id_for(&fs, &path)
    }

    async fn mkdir(
        &self,
        dirid: fileid3,
        dirname: &filename3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let (fs, dir) = self.resolve(dirid)?;
        let name = filename_to_str(dirname)?;
        debug!(dirid, name, "mkdir");

        let path = child_path(&dir, name);
        {
            let fs = FsRef::clone(&fs);
            let path = path.clone();
            blocking(move || fs.mkdir(&path)).await?;
        }
        self.attr_for(&fs, &path).await
    }

    async fn remove(&self, dirid: fileid3, filename: &filename3) -> Result<(), nfsstat3> {
        let (fs, dir) = self.resolve(dirid)?;
        let name = filename_to_str(filename)?;
        debug!(dirid, name, "remove");

        let path = child_path(&dir, name);
        {
            let fs = FsRef::clone(&fs);
            let path = path.clone();
            blocking(move || fs.remove(&path)).await?;
        }
        self.handler.invalidate_path(&fs, &path);
        Ok(())
    }

    async fn rename(
        &self,
        from_dirid: fileid3,
        from_filename: &filename3,
        to_dirid: fileid3,
        to_filename: &filename3,
    ) -> Result<(), nfsstat3> {
        let (from_fs, from_dir) = self.resolve(from_dirid)?;
        let (to_fs, to_dir) = self.resolve(to_dirid)?;
        if !std::ptr::addr_eq(Arc::as_ptr(&from_fs), Arc::as_ptr(&to_fs)) {
            return Err(nfsstat3::NFS3ERR_XDEV);
        }
        let from_name = filename_to_str(from_filename)?;
        let to_name = filename_to_str(to_filename)?;
        debug!(from_dirid, from_name, to_dirid, to_name, "rename");

        let from = child_path(&from_dir, from_name);
        let to = child_path(&to_dir, to_name);
        {
            let fs = FsRef::clone(&from_fs);
            let (from, to) = (from.clone(), to.clone());
            blocking(move || fs.rename(&from, &to)).await?;
        }
        self.handler.invalidate_path(&from_fs, &from);
        self.handler.invalidate_path(&from_fs, &to);
        Ok(())
    }

    async fn readdir(
        &self,
        dirid: fileid3,
        start_after: fileid3,
        max_entries: usize,
    ) -> Result<ReadDirResult, nfsstat3> {
        let (fs, dir) = self.resolve(dirid)?;
        trace!(dirid, start_after, max_entries, "readdir");

        // The cookie is the file id of the last entry returned; it must still
        // name a child of this directory.
        let resume_after = if start_after == 0 {
            None
        } else {
            let (_, cookie_path) = self
                .resolve(start_after)
                .map_err(|_| nfsstat3::NFS3ERR_BAD_COOKIE)?;
            match cookie_path.split_last() {
                Some((name, parent)) if parent == dir.as_slice() => Some(name.clone()),
                _ => return Err(nfsstat3::NFS3ERR_BAD_COOKIE),
            }
        };

        let listing = {
            let fs = FsRef::clone(&fs);
            let dir = dir.clone();
            blocking(move || fs.read_dir(&dir)).await?
        };

        let mut remaining = listing
            .into_iter()
            .filter(|entry| resume_after.as_ref().is_none_or(|after| entry.name > *after))
            .peekable();

        let mut entries = Vec::new();
        while entries.len() < max_entries {
            let Some(entry) = remaining.next() else { break };
            let path = child_path(&dir, &entry.name);
            let fileid = self.id_for(&fs, &path)?;
            entries.push(DirEntry {
                fileid,
                name: nfsstring::from(entry.name.as_bytes()),
                attr: to_fattr(fileid, &entry.attr),
            });
        }
        let end = remaining.peek().is_none();

        Ok(ReadDirResult { entries, end })
    }

    async fn symlink(
        &self,
        dirid: fileid3,
        linkname: &filename3,
        symlink: &nfspath3,
        _attr: &sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let (fs, dir) = self.resolve(dirid)?;
        let name = filename_to_str(linkname)?;
        debug!(dirid, name, "symlink");

        let path = child_path(&dir, name);
        let target = path_from_bytes(symlink);
        {
            let fs = FsRef::clone(&fs);
            let path = path.clone();
            blocking(move || fs.symlink(&target, &path)).await?;
        }
        self.attr_for(&fs, &path).await
    }

    async fn readlink(&self, id: fileid3) -> Result<nfspath3, nfsstat3> {
        let (fs, path) = self.resolve(id)?;
        trace!(id, "readlink");
        let target = blocking(move || fs.readlink(&path)).await?;
        Ok(nfsstring(target.into_os_string().into_vec()))
    }
}
