#![forbid(unsafe_code)]

//! Binary entry point: option parsing, log setup, startup host resolution,
//! and the coordinator loop. Exits 0 on a clean `quit`, 1 on any startup or
//! unhandled error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use rime_core::{resolve_ice_servers, AdapterOptions};
use rime_daemon::IceAdapter;

/// NAT-traversal sidecar for GPGNet-speaking games: exposes a JSON-RPC
/// signaling plane and per-peer loopback relays backed by ICE/STUN/TURN.
#[derive(Debug, Parser)]
#[command(name = "rime-daemon", version)]
struct Cli {
    /// Id of the local player, as assigned by the signaling service.
    #[arg(long = "player_id")]
    player_id: i64,

    /// Login of the local player.
    #[arg(long = "player_login")]
    player_login: String,

    /// TCP port of the JSON-RPC control plane.
    #[arg(long = "rpc_port", default_value_t = 7236)]
    rpc_port: u16,

    /// TCP port the game connects to for GPGNet control traffic.
    #[arg(long = "gpgnet_port", default_value_t = 7237)]
    gpgnet_port: u16,

    /// UDP port the game itself listens on for inbound peer traffic.
    #[arg(long = "game_udp_port", default_value_t = 6112)]
    game_udp_port: u16,

    /// STUN server host name.
    #[arg(long = "stun_host")]
    stun_host: String,

    /// TURN server host name.
    #[arg(long = "turn_host")]
    turn_host: String,

    /// TURN user name.
    #[arg(long = "turn_user", default_value = "")]
    turn_user: String,

    /// TURN password.
    #[arg(long = "turn_pass", default_value = "")]
    turn_pass: String,

    /// Append logs to this file in addition to stderr.
    #[arg(long = "log_file", default_value = "")]
    log_file: String,
}

impl From<Cli> for AdapterOptions {
    fn from(cli: Cli) -> Self {
        AdapterOptions {
            player_id: cli.player_id,
            player_login: cli.player_login,
            rpc_port: cli.rpc_port,
            gpgnet_port: cli.gpgnet_port,
            game_udp_port: cli.game_udp_port,
            stun_host: cli.stun_host,
            turn_host: cli.turn_host,
            turn_user: cli.turn_user,
            turn_pass: cli.turn_pass,
            log_file: cli.log_file,
        }
    }
}

fn init_logging(log_file: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("opening log file {log_file}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::io::stderr.and(Arc::new(file)))
            .init();
    }
    Ok(())
}

async fn run(opts: AdapterOptions) -> anyhow::Result<()> {
    let servers = resolve_ice_servers(&opts)
        .await
        .context("resolving STUN/TURN hosts")?;
    let mut adapter = IceAdapter::bind(opts, servers)
        .await
        .context("binding listeners")?;
    adapter.run().await;
    info!("clean shutdown");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_file) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }
    match run(cli.into()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
