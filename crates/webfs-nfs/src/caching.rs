//! Bounded handle cache.
//!
//! Handles are 8-byte big-endian ids. Ids are allocated monotonically and
//! never reused, so an evicted handle can only ever resolve to `Stale`. The
//! root handle is pinned outside the LRU.

use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::HandleError;
use crate::filesystem::{Change, Filesystem};
use crate::handler::{FsRef, FsStat, MountRequest, MountResponse, NfsHandler, Resolved};

/// Handle id of the export root.
pub const ROOT_HANDLE_ID: u64 = 1;

/// Default number of non-root handles kept alive.
pub const DEFAULT_HANDLE_LIMIT: usize = 1024;

/// Length of every handle issued by [`CachingHandler`].
pub const HANDLE_LEN: usize = 8;

pub fn encode_handle(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub fn decode_handle(handle: &[u8]) -> Result<u64, HandleError> {
    let bytes: [u8; HANDLE_LEN] = handle
        .try_into()
        .map_err(|_| HandleError::Malformed { len: handle.len() })?;
    Ok(u64::from_be_bytes(bytes))
}

struct Entry {
    fs: FsRef,
    path: Vec<String>,
}

struct HandleTable {
    root: Option<FsRef>,
    entries: LruCache<u64, Entry>,
    by_path: HashMap<Vec<String>, u64>,
    next_id: u64,
}

impl HandleTable {
    fn lookup(&mut self, fs: &FsRef, path: &[String]) -> Option<u64> {
        let id = *self.by_path.get(path)?;
        let entry = self.entries.get(&id)?;
        same_fs(&entry.fs, fs).then_some(id)
    }

    fn insert(&mut self, fs: &FsRef, path: &[String]) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let entry = Entry {
            fs: FsRef::clone(fs),
            path: path.to_vec(),
        };
        if let Some((evicted_id, evicted)) = self.entries.push(id, entry)
            && evicted_id != id
        {
            trace!(id = evicted_id, path = ?evicted.path, "Evicted handle");
            self.forget_path(&evicted.path, evicted_id);
        }
        self.by_path.insert(path.to_vec(), id);
        id
    }

    fn forget_path(&mut self, path: &[String], id: u64) {
        if self.by_path.get(path) == Some(&id) {
            self.by_path.remove(path);
        }
    }
}

fn same_fs(a: &FsRef, b: &FsRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Wraps a handler with a bounded path/handle map.
pub struct CachingHandler<H> {
    inner: H,
    capacity: NonZeroUsize,
    table: Mutex<HandleTable>,
}

impl<H: NfsHandler> CachingHandler<H> {
    /// Creates a cache keeping at most `capacity` handles besides the root.
    /// A capacity of zero is raised to one.
    pub fn new(inner: H, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            capacity,
            table: Mutex::new(HandleTable {
                root: None,
                entries: LruCache::new(capacity),
                by_path: HashMap::new(),
                next_id: ROOT_HANDLE_ID + 1,
            }),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Number of live non-root handles.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: NfsHandler> NfsHandler for CachingHandler<H> {
    fn mount(&self, request: &MountRequest) -> MountResponse {
        self.inner.mount(request)
    }

    fn change<'a>(&self, fs: &'a dyn Filesystem) -> Option<&'a dyn Change> {
        self.inner.change(fs)
    }

    fn fs_stat(&self, fs: &dyn Filesystem, stat: &mut FsStat) -> io::Result<()> {
        self.inner.fs_stat(fs, stat)
    }

    fn to_handle(&self, fs: &FsRef, path: &[String]) -> Vec<u8> {
        let mut table = self.table.lock();
        if path.is_empty() {
            table.root = Some(FsRef::clone(fs));
            return encode_handle(ROOT_HANDLE_ID);
        }
        let id = match table.lookup(fs, path) {
            Some(id) => id,
            None => table.insert(fs, path),
        };
        encode_handle(id)
    }

    fn from_handle(&self, handle: &[u8]) -> Result<Option<Resolved>, HandleError> {
        let id = decode_handle(handle)?;
        let mut table = self.table.lock();
        if id == ROOT_HANDLE_ID {
            return match &table.root {
                Some(fs) => Ok(Some((FsRef::clone(fs), Vec::new()))),
                None => Err(HandleError::Stale(id)),
            };
        }
        match table.entries.get(&id) {
            Some(entry) => Ok(Some((FsRef::clone(&entry.fs), entry.path.clone()))),
            None => Err(HandleError::Stale(id)),
        }
    }

    fn handle_limit(&self) -> Option<usize> {
        Some(self.capacity.get())
    }

    fn invalidate_path(&self, fs: &FsRef, path: &[String]) {
        let mut table = self.table.lock();
        let doomed: Vec<u64> = table
            .entries
            .iter()
            .filter(|(_, entry)| same_fs(&entry.fs, fs) && entry.path.starts_with(path))
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            if let Some(entry) = table.entries.pop(&id) {
                table.forget_path(&entry.path, id);
            }
        }
        self.inner.invalidate_path(fs, path);
    }
}
