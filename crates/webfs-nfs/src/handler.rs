//! The handler capability set consulted by the export.
//!
//! A handler decides who may mount, turns paths into opaque handles and
//! back, and reports filesystem statistics. Handlers compose: the CIDR gate
//! sits innermost and the caching layer wraps it to supply real handles.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::HandleError;
use crate::filesystem::{Change, Filesystem};

/// Shared reference to a served filesystem.
pub type FsRef = Arc<dyn Filesystem>;

/// An incoming mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Address of the connecting peer.
    pub peer: IpAddr,
    /// Export path requested by the client.
    pub path: String,
}

impl MountRequest {
    pub fn new(peer: IpAddr, path: impl Into<String>) -> Self {
        Self {
            peer,
            path: path.into(),
        }
    }
}

/// Outcome of a mount request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Ok,
    PermissionDenied,
}

/// RPC authentication flavors a server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlavor {
    Null,
    Unix,
    Short,
    Des,
}

/// Reply to a mount request.
#[derive(Clone)]
pub struct MountResponse {
    pub status: MountStatus,
    /// Filesystem to serve; always `None` on denial.
    pub filesystem: Option<FsRef>,
    pub auth_flavors: Vec<AuthFlavor>,
}

impl MountResponse {
    pub fn denied() -> Self {
        Self {
            status: MountStatus::PermissionDenied,
            filesystem: None,
            auth_flavors: Vec::new(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.status == MountStatus::Ok
    }
}

impl fmt::Debug for MountResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountResponse")
            .field("status", &self.status)
            .field("filesystem", &self.filesystem.as_ref().map(|_| ".."))
            .field("auth_flavors", &self.auth_flavors)
            .finish()
    }
}

/// Filesystem statistics as reported over FSSTAT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsStat {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
    /// Seconds for which the values above are not expected to change.
    pub invarsec: u32,
}

/// Resolved handle: the filesystem it belongs to and its path components.
pub type Resolved = (FsRef, Vec<String>);

pub trait NfsHandler: Send + Sync {
    /// Decides whether a peer may mount and, if so, which filesystem it sees.
    fn mount(&self, request: &MountRequest) -> MountResponse;

    /// Metadata-change capability for `fs`, if any.
    fn change<'a>(&self, fs: &'a dyn Filesystem) -> Option<&'a dyn Change>;

    /// Fills in statistics for `fs`.
    fn fs_stat(&self, fs: &dyn Filesystem, stat: &mut FsStat) -> io::Result<()>;

    /// Opaque handle for `path` on `fs`.
    fn to_handle(&self, fs: &FsRef, path: &[String]) -> Vec<u8>;

    /// Resolves a handle. `Ok(None)` means this handler keeps no handles.
    fn from_handle(&self, handle: &[u8]) -> Result<Option<Resolved>, HandleError>;

    /// Maximum number of live handles, `None` when unbounded.
    fn handle_limit(&self) -> Option<usize>;

    /// Drops handles for `path` and everything below it.
    fn invalidate_path(&self, _fs: &FsRef, _path: &[String]) {}
}

impl<H: NfsHandler + ?Sized> NfsHandler for Arc<H> {
    fn mount(&self, request: &MountRequest) -> MountResponse {
        (**self).mount(request)
    }

    fn change<'a>(&self, fs: &'a dyn Filesystem) -> Option<&'a dyn Change> {
        (**self).change(fs)
    }

    fn fs_stat(&self, fs: &dyn Filesystem, stat: &mut FsStat) -> io::Result<()> {
        (**self).fs_stat(fs, stat)
    }

    fn to_handle(&self, fs: &FsRef, path: &[String]) -> Vec<u8> {
        (**self).to_handle(fs, path)
    }

    fn from_handle(&self, handle: &[u8]) -> Result<Option<Resolved>, HandleError> {
        (**self).from_handle(handle)
    }

    fn handle_limit(&self) -> Option<usize> {
        (**self).handle_limit()
    }

    fn invalidate_path(&self, fs: &FsRef, path: &[String]) {
        (**self).invalidate_path(fs, path);
    }
}
