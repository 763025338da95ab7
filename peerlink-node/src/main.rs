//! # Peerlink Node CLI
//!
//! - `run`: start a connection manager from configuration and log its
//!   events until Ctrl-C
//! - `simulate`: all-to-all message exchange on the in-process simulator
//! - `config`: print the effective configuration

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peerlink_core::simulator::LatencyModel;
use peerlink_core::{ConfigLoader, ConnectionManager, PeerlinkConfig, TransportEvent};
use tracing::{error, info};

mod simulate;

#[derive(Parser, Debug)]
#[command(name = "peerlink-node")]
#[command(about = "Peerlink - peer-to-peer connection substrate")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to PEERLINK_CONFIG, ./peerlink.toml, then the user config dir)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a node with a WebSocket server
    Run,

    /// Exchange messages between simulated nodes
    Simulate {
        /// Number of nodes
        #[arg(long, default_value_t = 4)]
        nodes: usize,
        /// Messages each node sends to every other node
        #[arg(long, default_value_t = 3)]
        messages: usize,
        /// none | random | real | fixed:<ms>
        #[arg(long, default_value = "fixed:20", value_parser = parse_latency)]
        latency: LatencyModel,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_latency(s: &str) -> Result<LatencyModel, String> {
    LatencyModel::parse(s).ok_or_else(|| format!("unknown latency model '{}'", s))
}

fn load_config(path: Option<&PathBuf>) -> peerlink_core::Result<PeerlinkConfig> {
    match path {
        Some(path) => ConfigLoader::with_path(path).load(),
        None => ConfigLoader::new().load(),
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run => run(cli.config.as_ref()).await,
        Commands::Simulate {
            nodes,
            messages,
            latency,
            timeout,
        } => {
            init_tracing("warn");
            simulate::run(nodes, messages, latency, std::time::Duration::from_secs(timeout)).await
        }
        Commands::Config => print_config(cli.config.as_ref()),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config_path: Option<&PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path).context("loading configuration")?;
    init_tracing(&config.node.log_level);

    let manager = ConnectionManager::from_config(&config, None)?;
    manager.start().await?;
    println!("Node {} running", manager.local_peer_descriptor());

    let mut events = manager.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(TransportEvent::Connected(peer)) => info!("Connected to {}", peer),
                Some(TransportEvent::Disconnected { peer, reason }) => info!("Disconnected from {}: {}", peer, reason),
                Some(TransportEvent::Message(message)) => info!(
                    "Message {} ({}) from {}",
                    message.message_id,
                    message.service_id,
                    message
                        .source_descriptor
                        .map(|peer| peer.node_id.short())
                        .unwrap_or_default()
                ),
                None => break,
            },
        }
    }

    info!("Shutting down");
    manager.stop().await;
    Ok(())
}

fn print_config(config_path: Option<&PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path).context("loading configuration")?;
    print!("{}", config.to_toml()?);
    Ok(())
}
