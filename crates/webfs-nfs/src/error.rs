//! Error types for the export.

use std::io;

use nfsserve::nfs::nfsstat3;
use nix::errno::Errno;
use thiserror::Error;

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded or is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Listener could not be bound, or the serve loop stopped.
    #[error("transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ServerError {
    pub(crate) fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }
}

/// Errors resolving an opaque file handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// Handle was evicted from the cache or never issued.
    #[error("stale file handle {0}")]
    Stale(u64),

    /// Handle bytes do not have the expected shape.
    #[error("malformed file handle ({len} bytes)")]
    Malformed { len: usize },
}

impl From<HandleError> for nfsstat3 {
    fn from(e: HandleError) -> Self {
        match e {
            HandleError::Stale(_) => nfsstat3::NFS3ERR_STALE,
            HandleError::Malformed { .. } => nfsstat3::NFS3ERR_BADHANDLE,
        }
    }
}

/// Maps an I/O error from the backing filesystem to an NFS status code.
pub fn io_error_to_nfsstat(e: &io::Error) -> nfsstat3 {
    use io::ErrorKind;
    // Refused symlink traversal
    if e.raw_os_error() == Some(Errno::ELOOP as i32) {
        return nfsstat3::NFS3ERR_INVAL;
    }
    match e.kind() {
        ErrorKind::NotFound => nfsstat3::NFS3ERR_NOENT,
        ErrorKind::PermissionDenied => nfsstat3::NFS3ERR_ACCES,
        ErrorKind::AlreadyExists => nfsstat3::NFS3ERR_EXIST,
        ErrorKind::InvalidInput | ErrorKind::InvalidFilename => nfsstat3::NFS3ERR_INVAL,
        ErrorKind::DirectoryNotEmpty => nfsstat3::NFS3ERR_NOTEMPTY,
        ErrorKind::IsADirectory => nfsstat3::NFS3ERR_ISDIR,
        ErrorKind::NotADirectory => nfsstat3::NFS3ERR_NOTDIR,
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => nfsstat3::NFS3ERR_NOSPC,
        ErrorKind::ReadOnlyFilesystem => nfsstat3::NFS3ERR_ROFS,
        ErrorKind::CrossesDevices => nfsstat3::NFS3ERR_XDEV,
        ErrorKind::FileTooLarge => nfsstat3::NFS3ERR_FBIG,
        ErrorKind::Unsupported => nfsstat3::NFS3ERR_NOTSUPP,
        _ => nfsstat3::NFS3ERR_IO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::discriminant;

    fn same(a: &nfsstat3, b: &nfsstat3) -> bool {
        discriminant(a) == discriminant(b)
    }

    #[test]
    fn test_io_error_mapping() {
        let cases = [
            (io::ErrorKind::NotFound, nfsstat3::NFS3ERR_NOENT),
            (io::ErrorKind::PermissionDenied, nfsstat3::NFS3ERR_ACCES),
            (io::ErrorKind::AlreadyExists, nfsstat3::NFS3ERR_EXIST),
            (io::ErrorKind::DirectoryNotEmpty, nfsstat3::NFS3ERR_NOTEMPTY),
            (io::ErrorKind::InvalidInput, nfsstat3::NFS3ERR_INVAL),
            (io::ErrorKind::Other, nfsstat3::NFS3ERR_IO),
        ];
        for (kind, expected) in cases {
            let got = io_error_to_nfsstat(&io::Error::from(kind));
            assert!(same(&got, &expected), "{kind:?} -> {got:?}");
        }
    }

    #[test]
    fn test_eloop_maps_to_inval() {
        let got = io_error_to_nfsstat(&io::Error::from(Errno::ELOOP));
        assert!(same(&got, &nfsstat3::NFS3ERR_INVAL), "{got:?}");
    }

    #[test]
    fn test_handle_error_mapping() {
        assert!(same(
            &nfsstat3::from(HandleError::Stale(7)),
            &nfsstat3::NFS3ERR_STALE
        ));
        assert!(same(
            &nfsstat3::from(HandleError::Malformed { len: 3 }),
            &nfsstat3::NFS3ERR_BADHANDLE
        ));
    }
}
