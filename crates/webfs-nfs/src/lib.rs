//! NFSv3 export of a local directory, gated by peer address.
//!
//! The export is assembled from layers:
//!
//! ```text
//! TCP peer ──► admission (NfsHandler::mount) ──► nfsserve ──► HandlerExport
//!                                                                 │
//!                              CachingHandler (handle ⇄ path, LRU)
//!                                  └── CidrAuthHandler (allowlist)
//!                                          └── ChangeFs<OsFs>
//! ```
//!
//! [`NfsServer`] wires these together from a [`ServerConfig`].

#![cfg(unix)]

pub mod auth;
pub mod caching;
pub mod change;
pub mod config;
mod error;
pub mod export;
pub mod filesystem;
pub mod handler;
pub mod rpc;
pub mod server;

pub use auth::{AllowRule, CidrAuthHandler, is_allowed};
pub use caching::{CachingHandler, DEFAULT_HANDLE_LIMIT, ROOT_HANDLE_ID};
pub use change::{ChangeFs, change_capability};
pub use config::{AuthConfig, ServerConfig};
pub use error::{HandleError, ServerError, io_error_to_nfsstat};
pub use export::HandlerExport;
pub use filesystem::{Change, DirEntryInfo, FileAttr, FileKind, Filesystem, OsFs};
pub use handler::{
    AuthFlavor, FsRef, FsStat, MountRequest, MountResponse, MountStatus, NfsHandler,
};
pub use server::{HANDLE_CACHE_SIZE, NfsServer, build_handler, serve};
