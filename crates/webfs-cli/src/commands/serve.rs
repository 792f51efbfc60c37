//! Serve command - export a directory over NFS behind the token tunnel.
//!
//! Three listeners are involved:
//! - `--address`: public tunnel listener remote clients connect to
//! - `--tcp-address`: in-process NFS server (only with `--local-nfs true`)
//! - `--nfs-address`: where the tunnel forwards admitted connections

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args as ClapArgs;
use tracing::{info, instrument};

use webfs_nfs::{NfsServer, ServerConfig};
use webfs_tunnel::{TokenSet, TunnelServer};

use crate::paths::expand_home;

#[derive(ClapArgs, Debug, Clone)]
pub struct Args {
    /// Public address of the tunnel listener
    #[arg(long, default_value = "0.0.0.0:8049")]
    pub address: String,

    /// Address of the Prometheus metrics endpoint (empty to disable)
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: String,

    /// Address the in-process NFS server binds to
    #[arg(long, default_value = "127.0.0.1:7049")]
    pub tcp_address: String,

    /// Run the NFS server in this process
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub local_nfs: bool,

    /// NFS server the tunnel forwards to
    #[arg(long, default_value = "127.0.0.1:7049")]
    pub nfs_address: String,

    /// YAML or JSON server configuration (overrides DIR and --tcp-address)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Token tunnel clients must present (open tunnel when unset)
    #[arg(long, env = "WEBFS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Directory to export (required unless --config is given or --local-nfs is false)
    #[arg(value_name = "DIR")]
    pub dir: Option<PathBuf>,
}

impl Args {
    /// Server configuration from `--config`, or from DIR and `--tcp-address`.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(expand_home(path))
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => {
                let Some(dir) = &self.dir else {
                    bail!("DIR is required unless --config is given or --local-nfs is false");
                };
                ServerConfig::new(dir, &self.tcp_address)
            }
        };
        config.dir = expand_home(&config.dir);
        Ok(config)
    }

    fn tunnel(&self) -> TunnelServer {
        let mut tunnel = TunnelServer::new(&self.address, &self.nfs_address)
            .with_tokens(TokenSet::new(self.token.clone()));
        if !self.metrics_address.is_empty() {
            tunnel = tunnel.with_metrics(&self.metrics_address);
        }
        tunnel
    }
}

#[instrument(level = "info", name = "serve", skip_all)]
pub async fn execute(args: Args) -> Result<()> {
    let tunnel = args.tunnel();

    if !args.local_nfs {
        info!(upstream = %args.nfs_address, "Forwarding to an external NFS server");
        return tunnel.run(None).await.context("Tunnel server stopped");
    }

    let config = args.server_config()?;
    info!(
        dir = %config.dir.display(),
        nfs = %config.address,
        tunnel = %args.address,
        "Starting webfs server"
    );
    let server = NfsServer::new(config);

    tokio::select! {
        result = server.start() => result.context("NFS server stopped"),
        result = tunnel.run(None) => result.context("Tunnel server stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(dir: Option<&str>, config: Option<PathBuf>) -> Args {
        Args {
            address: "0.0.0.0:8049".into(),
            metrics_address: String::new(),
            tcp_address: "127.0.0.1:7049".into(),
            local_nfs: true,
            nfs_address: "127.0.0.1:7049".into(),
            config,
            token: None,
            dir: dir.map(PathBuf::from),
        }
    }

    #[test]
    fn test_config_from_args() {
        let config = args(Some("/srv/data"), None).server_config().unwrap();
        assert_eq!(config.dir, PathBuf::from("/srv/data"));
        assert_eq!(config.address, "127.0.0.1:7049");
        assert!(config.auth.allow_cidrs.is_empty());
    }

    #[test]
    fn test_config_file_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "dir: /srv/other\naddress: 127.0.0.1:9999\n\
             auth:\n  enabled: true\n  allow_cidrs: [10.0.0.0/8]"
        )
        .unwrap();
        let config = args(Some("/ignored"), Some(file.path().to_path_buf()))
            .server_config()
            .unwrap();
        assert_eq!(config.dir, PathBuf::from("/srv/other"));
        assert_eq!(config.address, "127.0.0.1:9999");
        assert_eq!(config.auth.allow_cidrs, vec!["10.0.0.0/8".to_string()]);
    }

    #[test]
    fn test_missing_config_file() {
        let missing = PathBuf::from("/definitely/not/here.yaml");
        assert!(args(None, Some(missing)).server_config().is_err());
    }

    #[test]
    fn test_missing_dir() {
        let err = args(None, None).server_config().unwrap_err();
        assert!(err.to_string().contains("DIR"), "{err}");
    }
}
