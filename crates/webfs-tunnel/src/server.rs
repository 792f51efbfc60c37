//! Remote end of the tunnel.
//!
//! Accepts tunnel connections, checks the auth preamble when tokens are
//! configured, and forwards the rest of the stream to the NFS listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::TokenSet;
use crate::error::TunnelError;
use crate::preamble::read_preamble;
use crate::telemetry::{install_exporter, record_bytes, record_connection, record_rejected};

/// How long a client has to present its token.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TunnelServer {
    listen: String,
    connect: String,
    metrics_address: Option<String>,
    tokens: TokenSet,
}

impl TunnelServer {
    pub fn new(listen: impl Into<String>, connect: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            connect: connect.into(),
            metrics_address: None,
            tokens: TokenSet::default(),
        }
    }

    /// Serve Prometheus metrics on `address`.
    #[must_use]
    pub fn with_metrics(mut self, address: impl Into<String>) -> Self {
        self.metrics_address = Some(address.into());
        self
    }

    /// Require one of `tokens` on every connection. Empty tokens are ignored.
    #[must_use]
    pub fn with_tokens(mut self, tokens: TokenSet) -> Self {
        self.tokens = tokens;
        self
    }

    /// Serves until accept fails.
    pub async fn run(self, ready: Option<oneshot::Sender<SocketAddr>>) -> Result<(), TunnelError> {
        if let Some(address) = &self.metrics_address {
            install_exporter(address)?;
        }

        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| TunnelError::transport(format!("failed to bind {}", self.listen), e))?;
        let local = listener
            .local_addr()
            .map_err(|e| TunnelError::transport("failed to read local address", e))?;
        info!(
            listen = %local,
            upstream = %self.connect,
            auth = self.tokens.is_required(),
            "Tunnel server listening"
        );
        if let Some(ready) = ready
            && ready.send(local).is_err()
        {
            debug!("Nobody waiting for tunnel readiness");
        }

        let tokens = Arc::new(self.tokens);
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| TunnelError::transport("accept failed", e))?;
            record_connection();
            let tokens = Arc::clone(&tokens);
            let connect = self.connect.clone();
            tokio::spawn(async move {
                handle(stream, peer, &connect, &tokens).await;
            });
        }
    }
}

async fn handle(mut stream: TcpStream, peer: SocketAddr, connect: &str, tokens: &TokenSet) {
    if tokens.is_required() {
        let presented = match timeout(PREAMBLE_TIMEOUT, read_preamble(&mut stream)).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "Rejecting tunnel connection");
                record_rejected("preamble");
                return;
            }
            Err(_) => {
                warn!(%peer, "Rejecting tunnel connection: no preamble in time");
                record_rejected("timeout");
                return;
            }
        };
        if !tokens.verify(&presented) {
            warn!(%peer, "Rejecting tunnel connection: invalid token");
            record_rejected("token");
            return;
        }
    }

    let mut upstream = match TcpStream::connect(connect).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, upstream = connect, error = %e, "Could not reach upstream");
            return;
        }
    };
    match copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((inbound, outbound)) => {
            record_bytes(inbound, outbound);
            debug!(%peer, inbound, outbound, "Tunnel connection closed");
        }
        Err(e) => debug!(%peer, error = %e, "Tunnel connection ended with error"),
    }
}
