//! Interrupt handling for mount sessions.

use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, warn};

/// Resolves on the first SIGINT, SIGTERM or SIGHUP.
///
/// If the SIGTERM/SIGHUP handlers can't be installed, only Ctrl+C is watched.
pub async fn shutdown_signal() {
    let handlers = (signal(SignalKind::terminate()), signal(SignalKind::hangup()));
    let (mut term, mut hup) = match handlers {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Could not install SIGTERM/SIGHUP handlers");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl+C");
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Ctrl+C listener failed");
            }
            debug!("Received SIGINT");
        }
        _ = term.recv() => debug!("Received SIGTERM"),
        _ = hup.recv() => debug!("Received SIGHUP"),
    }
}
