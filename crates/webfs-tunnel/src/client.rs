//! Local end of the tunnel.
//!
//! Listens on a local address (where the OS NFS client mounts from) and
//! forwards each connection to the remote tunnel server, prefixed with the
//! auth preamble when a token is configured.

use std::net::SocketAddr;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::preamble::write_preamble;

#[derive(Debug, Clone)]
pub struct TunnelClient {
    listen: String,
    connect: String,
    token: Option<String>,
}

impl TunnelClient {
    pub fn new(
        listen: impl Into<String>,
        connect: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            listen: listen.into(),
            connect: connect.into(),
            token,
        }
    }

    /// Binds the local listener and forwards connections until accept fails.
    ///
    /// The bound address is sent on `ready` as soon as the listener exists,
    /// before the first connection is accepted.
    pub async fn run(self, ready: Option<oneshot::Sender<SocketAddr>>) -> Result<(), TunnelError> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| TunnelError::transport(format!("failed to bind {}", self.listen), e))?;
        let local = listener
            .local_addr()
            .map_err(|e| TunnelError::transport("failed to read local address", e))?;
        info!(
            listen = %local,
            remote = %self.connect,
            auth = self.token.is_some(),
            "Tunnel client listening"
        );

        if let Some(ready) = ready
            && ready.send(local).is_err()
        {
            debug!("Nobody waiting for tunnel readiness");
        }

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| TunnelError::transport("accept failed", e))?;
            let connect = self.connect.clone();
            let token = self.token.clone();
            tokio::spawn(async move {
                if let Err(e) = forward(stream, &connect, token.as_deref()).await {
                    warn!(%peer, error = %e, "Tunnel connection failed");
                }
            });
        }
    }
}

async fn forward(
    mut local: TcpStream,
    connect: &str,
    token: Option<&str>,
) -> Result<(), TunnelError> {
    let mut remote = TcpStream::connect(connect)
        .await
        .map_err(|e| TunnelError::transport(format!("failed to connect to {connect}"), e))?;
    if let Some(token) = token {
        write_preamble(&mut remote, token).await?;
    }
    let (up, down) = copy_bidirectional(&mut local, &mut remote)
        .await
        .map_err(|e| TunnelError::transport("tunnel copy failed", e))?;
    debug!(up, down, "Tunnel connection closed");
    Ok(())
}
