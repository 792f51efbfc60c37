//! Minimal TCP tunnel for NFS traffic.
//!
//! ```text
//! mount --> TunnelClient == "WEBFS-AUTH <token>\n" + bytes ==> TunnelServer --> NFS
//! ```
//!
//! The client announces readiness on a oneshot channel once its listener is
//! bound, so callers can mount without guessing a warm-up delay.

pub mod auth;
pub mod client;
mod error;
pub mod preamble;
pub mod server;
pub mod telemetry;

pub use auth::{ClientAuth, TokenSet};
pub use client::TunnelClient;
pub use error::TunnelError;
pub use server::TunnelServer;
