//! # Shoal Node
//!
//! Runs either end of a shoal transport session with a synthetic media
//! source on the sending side and a counting sink on the receiving side.
//!
//! ## Usage
//!
//! ```bash
//! # Serve media over QUIC datagrams (the default session kind)
//! shoal serve --address 0.0.0.0:4242
//!
//! # Receive it, reporting minimal feedback for sender-side inference
//! shoal stream --address 127.0.0.1:4242 --feedback ack-timestamp
//!
//! # Plain UDP, settings from a file, engine statistics to stdout
//! shoal serve --config shoal.toml --session udp --stats stdout
//! ```

mod config;
mod serve;
mod source;
mod stream;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use shoal_transport::shutdown::shutdown_channel;

use crate::config::{NodeConfig, Overrides};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let Cli { command } = Cli::parse();
    let options = command.options();
    let config = NodeConfig::load(options.config.as_deref(), &options.overrides())?;
    let addr = resolve_address(&config.transport.session.address).await?;

    tracing::info!(
        command = command.name(),
        %addr,
        session = %config.transport.session.kind,
        feedback = %config.transport.sender.feedback_mode,
        frame_rate = config.media.frame_rate,
        "shoal starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down...");
            trigger.trigger();
        }
    });

    match command {
        Command::Serve(_) => serve::run(config, addr, shutdown).await?,
        Command::Stream(_) => stream::run(config, addr, shutdown).await?,
    }

    tracing::info!("shoal stopped");
    Ok(())
}

async fn resolve_address(address: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("failed to resolve '{address}'"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("'{address}' resolved to no addresses"))
}

// ─── CLI ────────────────────────────────────────────────────────────────────

/// Congestion-feedback-aware real-time media transport.
#[derive(Parser, Debug)]
#[command(name = "shoal", version, about = "Congestion-feedback-aware real-time media transport")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send synthetic media to every peer that connects.
    Serve(NodeArgs),
    /// Connect to a server and receive its media.
    Stream(NodeArgs),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Serve(_) => "serve",
            Command::Stream(_) => "stream",
        }
    }

    fn options(&self) -> &NodeArgs {
        match self {
            Command::Serve(options) | Command::Stream(options) => options,
        }
    }
}

/// Options shared by both commands. Anything left unset falls back to the
/// config file, then to built-in defaults.
#[derive(Args, Debug)]
struct NodeArgs {
    /// TOML configuration file.
    #[arg(short, long, env = "SHOAL_CONFIG")]
    config: Option<PathBuf>,

    /// Listen (serve) or server (stream) address [default: localhost:4242].
    #[arg(short, long, env = "SHOAL_ADDRESS")]
    address: Option<String>,

    /// Session kind: udp, quic-datagram or quic-stream-per-frame.
    #[arg(short, long)]
    session: Option<String>,

    /// Feedback mode: receive, static-delay, ack-timestamp or rtt. Both ends
    /// must agree.
    #[arg(short, long)]
    feedback: Option<String>,

    /// Engine statistics sink: stdout, off, or a file path.
    #[arg(long = "stats")]
    stats_sink: Option<String>,

    /// Initial target bitrate in kbps.
    #[arg(short, long = "bitrate")]
    bitrate_kbps: Option<u64>,

    /// Synthetic source frame rate [default: 30].
    #[arg(long)]
    frame_rate: Option<u32>,

    /// Media packet size on the wire in bytes [default: 1100].
    #[arg(long)]
    packet_size: Option<usize>,
}

impl NodeArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            address: self.address.clone(),
            session: self.session.clone(),
            feedback: self.feedback.clone(),
            stats_sink: self.stats_sink.clone(),
            initial_bitrate_kbps: self.bitrate_kbps,
            frame_rate: self.frame_rate,
            packet_size: self.packet_size,
        }
    }
}
