//! Server lifecycle.
//!
//! `nfsserve` has no hook for vetting a client before it mounts, so the
//! protocol server runs on an internal loopback port and the public
//! listener fronts it. Each accepted connection is put to the handler as a
//! mount request; admitted connections are spliced through, denied ones get
//! RPC-level refusals (see [`crate::rpc`]) and are then closed.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use nfsserve::tcp::{NFSTcp, NFSTcpListener};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::auth::CidrAuthHandler;
use crate::caching::{CachingHandler, DEFAULT_HANDLE_LIMIT};
use crate::change::ChangeFs;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::export::HandlerExport;
use crate::filesystem::OsFs;
use crate::handler::{FsRef, MountRequest, NfsHandler};
use crate::rpc;

/// Number of file handles the server keeps alive.
pub const HANDLE_CACHE_SIZE: usize = DEFAULT_HANDLE_LIMIT;

/// Export path reported in admission requests; the server has a single export.
const EXPORT_PATH: &str = "/";

/// Handler stack used by [`NfsServer`].
pub type ServerHandler = CachingHandler<CidrAuthHandler>;

/// NFS server for one exported directory.
pub struct NfsServer {
    config: ServerConfig,
}

impl NfsServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listener and serves until a fatal error.
    pub async fn start(&self) -> Result<(), ServerError> {
        let address = &self.config.address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServerError::transport(format!("failed to bind {address}"), e))?;
        let (handler, root) = build_handler(&self.config)?;

        info!(
            address = %address,
            dir = %self.config.dir.display(),
            rules = handler.inner().rules().len(),
            "NFS server listening"
        );
        serve(listener, handler, root).await
    }
}

/// Composes filesystem, change adapter, gate and handle cache for `config`.
pub fn build_handler(config: &ServerConfig) -> Result<(Arc<ServerHandler>, FsRef), ServerError> {
    if !config.dir.is_dir() {
        return Err(ServerError::Config(format!(
            "{} is not a directory",
            config.dir.display()
        )));
    }
    if !config.auth.enabled && !config.auth.allow_cidrs.is_empty() {
        debug!("auth.enabled is false but allow_cidrs are still enforced");
    }

    let fs: FsRef = Arc::new(ChangeFs::new(OsFs::new(&config.dir)));
    let gate = CidrAuthHandler::new(FsRef::clone(&fs), config.auth.allow_cidrs.as_slice());
    let handler = Arc::new(CachingHandler::new(gate, HANDLE_CACHE_SIZE));
    Ok((handler, fs))
}

/// Serves NFS on `listener` through `handler`, rooted at `root`.
///
/// Returns only when the public listener fails or the protocol server stops.
pub async fn serve<H>(
    listener: TcpListener,
    handler: Arc<H>,
    root: FsRef,
) -> Result<(), ServerError>
where
    H: NfsHandler + 'static,
{
    let export = HandlerExport::new(Arc::clone(&handler), &root);
    let loopback = format!("{}:0", Ipv4Addr::LOCALHOST);
    let backend = NFSTcpListener::bind(&loopback, export)
        .await
        .map_err(|e| ServerError::transport("failed to bind internal NFS listener", e))?;
    let backend_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, backend.get_listen_port()));
    debug!(%backend_addr, "Internal NFS listener ready");

    let mut backend_task = tokio::spawn(async move { backend.handle_forever().await });

    let result = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => admit(stream, peer, &*handler, backend_addr),
                Err(e) => break Err(ServerError::transport("accept failed", e)),
            },
            finished = &mut backend_task => {
                let source = match finished {
                    Ok(Ok(())) => io::Error::other("protocol server exited"),
                    Ok(Err(e)) => e,
                    Err(e) => io::Error::other(e),
                };
                break Err(ServerError::transport("NFS protocol server stopped", source));
            }
        }
    };

    backend_task.abort();
    if let Err(e) = &result {
        error!(error = %e, "NFS server stopped");
    }
    result
}

fn admit<H>(stream: TcpStream, peer: SocketAddr, handler: &H, backend: SocketAddr)
where
    H: NfsHandler + ?Sized,
{
    let response = handler.mount(&MountRequest::new(peer.ip(), EXPORT_PATH));
    if !response.is_allowed() {
        // The gate has already logged the denial
        tokio::spawn(rpc::refuse(stream, peer));
        return;
    }

    tokio::spawn(async move {
        let mut downstream = stream;
        let mut upstream = match TcpStream::connect(backend).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%peer, error = %e, "Could not reach internal NFS listener");
                return;
            }
        };
        match copy_bidirectional(&mut downstream, &mut upstream).await {
            Ok((to_server, to_client)) => {
                debug!(%peer, to_server, to_client, "NFS connection closed");
            }
            Err(e) => debug!(%peer, error = %e, "NFS connection ended with error"),
        }
    });
}
