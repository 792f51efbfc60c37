//! Client-side mount orchestration.
//!
//! [`NfsClient`] shells out to the system `mount`/`umount` utilities;
//! [`MountSession`] wraps one mount and guarantees its teardown runs at most
//! once, however many interrupts arrive.
//!
//! ```ignore
//! let session = Arc::new(MountSession::new(
//!     NfsClient::system(),
//!     ClientMountSpec::new("127.0.0.1:6049", "/mnt/webfs"),
//! ));
//! session.mount()?;
//! teardown_on(session, shutdown_signal()).await;
//! ```

#![cfg(unix)]

pub mod address;
pub mod client;
pub mod command;
mod error;
pub mod session;
pub mod signal;

#[cfg(test)]
mod testing;

pub use address::Endpoint;
pub use client::{ClientMountSpec, NfsClient, REMOTE_EXPORT};
pub use command::{CommandOutput, CommandRunner, Invocation, SystemRunner, needs_elevation};
pub use error::{MountError, Result};
pub use session::{MountSession, MountState, Teardown, teardown_on};
pub use signal::shutdown_signal;
