//! Mount command - mount a remote webfs export through a local tunnel.
//!
//! The tunnel client listens on `--tcp-address`; the OS NFS client mounts
//! from there once the tunnel reports ready. The mount is torn down exactly
//! once, on the first interrupt or when the tunnel dies.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Args as ClapArgs;
use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};

use webfs_mount::{ClientMountSpec, MountSession, NfsClient, Teardown, shutdown_signal, teardown_on};
use webfs_tunnel::{ClientAuth, TunnelClient};

use crate::paths::expand_home;

#[derive(ClapArgs, Debug, Clone)]
pub struct Args {
    /// Tunnel token (takes precedence over --token-cmd)
    #[arg(long, env = "WEBFS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Shell command printing the tunnel token on stdout
    #[arg(long, value_name = "CMD")]
    pub token_cmd: Option<String>,

    /// Local address of the tunnel listener the mount goes through
    #[arg(long, default_value = "127.0.0.1:6049")]
    pub tcp_address: String,

    /// Remote webfs tunnel address (host:port)
    #[arg(value_name = "SERVER_ADDRESS")]
    pub server_address: String,

    /// Where to mount the export
    #[arg(value_name = "MOUNT_DIR")]
    pub mount_dir: PathBuf,
}

#[instrument(level = "info", name = "mount", skip_all, fields(server = %args.server_address))]
pub async fn execute(args: Args) -> Result<()> {
    let token = ClientAuth::new(args.token.clone(), args.token_cmd.clone())
        .resolve()
        .await
        .context("Failed to resolve tunnel token")?;

    let (ready_tx, ready_rx) = oneshot::channel();
    let client = TunnelClient::new(&args.tcp_address, &args.server_address, token);
    let mut tunnel = tokio::spawn(client.run(Some(ready_tx)));

    let local = match ready_rx.await {
        Ok(addr) => addr,
        Err(_) => {
            // The sender is only dropped unsent when run() returned early
            return Err(match tunnel.await {
                Ok(Err(e)) => anyhow!(e).context("Tunnel failed to start"),
                Ok(Ok(())) => anyhow!("tunnel exited before becoming ready"),
                Err(e) => anyhow!(e).context("Tunnel task panicked"),
            });
        }
    };
    info!(local = %local, "Tunnel ready");

    let spec = ClientMountSpec::new(local.to_string(), expand_home(&args.mount_dir));
    let session = Arc::new(MountSession::new(NfsClient::system(), spec));

    let mounting = Arc::clone(&session);
    let mounted = tokio::task::spawn_blocking(move || mounting.mount())
        .await
        .context("Mount task panicked")?;
    if let Err(e) = mounted {
        tunnel.abort();
        return Err(e).context("Failed to mount");
    }
    info!(path = %session.spec().mount_path.display(), "Mounted; press Ctrl+C to unmount");

    let mut tunnel_result = None;
    let stop = async {
        tokio::select! {
            () = shutdown_signal() => {}
            result = &mut tunnel => tunnel_result = Some(result),
        }
    };
    let outcome = teardown_on(Arc::clone(&session), stop).await;
    tunnel.abort();

    if outcome == Teardown::Failed {
        warn!(path = %session.spec().mount_path.display(), "Mount may still be present");
    }

    match tunnel_result {
        Some(Ok(Err(e))) => {
            error!(error = %e, "Tunnel stopped");
            Err(anyhow!(e).context("Tunnel stopped unexpectedly"))
        }
        Some(Ok(Ok(()))) => Err(anyhow!("tunnel stopped unexpectedly")),
        Some(Err(e)) => Err(anyhow!(e).context("Tunnel task panicked")),
        None => Ok(()),
    }
}
