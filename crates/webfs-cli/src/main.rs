#![deny(unsafe_code)]

mod commands;
mod paths;

use std::io;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::commands::{mount, serve};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Serve a directory over NFS, or mount one served by a remote webfs
#[derive(Parser)]
#[command(name = "webfs")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Export ~/shared through the tunnel on :8049
    webfs serve --token \"$TOKEN\" ~/shared

    # Mount it on another machine
    webfs mount --token-cmd 'pass show webfs' server.example:8049 ~/mnt/shared
")]
struct Cli {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL, global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a directory over NFS behind the token tunnel
    Serve(serve::Args),

    /// Mount a remote webfs export through a local tunnel
    Mount(mount::Args),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => serve::execute(args).await,
        Commands::Mount(args) => mount::execute(args).await,
    }
}

/// Installs the global subscriber at `level`. Unparseable levels fall back to `info`.
fn init_tracing(level: &str) {
    let filter = parse_filter(level);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Accepts a bare level or `target=level` directives.
fn parse_filter(level: &str) -> EnvFilter {
    let level = level.trim();
    if let Ok(bare) = level.parse::<LevelFilter>() {
        return EnvFilter::new(bare.to_string());
    }
    if level.contains('=')
        && let Ok(filter) = EnvFilter::try_new(level)
    {
        return filter;
    }
    EnvFilter::new(DEFAULT_LOG_LEVEL)
}
