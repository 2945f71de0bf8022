//! sixtun CLI application

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sixtun::broker::BrokerClient;
use sixtun::device::{memory_pair, InterfaceConfig, InterfaceFactory, MemoryDevice, PacketDevice};
use sixtun::netinfo::{network_channel, NetworkState, TcpProbe};
use sixtun::tunnel::{CatalogStore, JsonFileStore, MemoryStore};
use sixtun::{Config, Orchestrator, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "sixtun")]
#[command(about = "Resilient IPv6-over-IPv4 tunnel client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Keep a tunnel session up until interrupted (default)
    Run,
    /// List the tunnels available to this account
    List,
    /// Show one tunnel description as JSON
    Show { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .ok();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from: {}", cli.config))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::List => list(config).await,
        Command::Show { id } => show(config, &id).await,
    }
}

/// In-process interface factory. Packets stay inside the process; real
/// platform integration supplies its own [`InterfaceFactory`] through the
/// library API.
struct LoopbackFactory {
    // Keeps the current far end alive so the forwarder's reads stay open.
    // Sessions are sequential, so the previous peer can go on reconnect.
    peer: std::sync::Mutex<Option<Arc<MemoryDevice>>>,
}

#[async_trait::async_trait]
impl InterfaceFactory for LoopbackFactory {
    async fn establish(
        &self,
        config: &InterfaceConfig,
    ) -> sixtun::Result<Arc<dyn PacketDevice>> {
        info!(
            address = %config.address,
            prefix_len = config.prefix_len,
            mtu = config.mtu,
            routes = config.routes.len(),
            "established in-process interface"
        );
        let (device, peer) = memory_pair();
        *self.peer.lock().unwrap() = Some(peer);
        Ok(device)
    }
}

async fn run(config: Config) -> Result<()> {
    let store: Arc<dyn CatalogStore> = match &config.cache_file {
        Some(path) => Arc::new(JsonFileStore::new(path.clone())),
        None => Arc::new(MemoryStore::new()),
    };

    // No platform network callbacks on the CLI: assume connectivity and let
    // the reachability probe catch actual outages.
    let (_notifier, network) = network_channel(NetworkState {
        connected: true,
        cellular: false,
        native_ipv6: false,
    });

    let factory = Arc::new(LoopbackFactory {
        peer: std::sync::Mutex::new(None),
    });
    let (orchestrator, mut status, handle) = Orchestrator::new(
        config,
        factory,
        network,
        Arc::new(TcpProbe::default()),
        store,
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.stop();
        }
    });
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snap = status.borrow().clone();
            info!(state = %snap.state, progress = snap.progress, "{}", snap.activity);
        }
    });

    match orchestrator.run().await {
        Ok(()) => {
            info!("tunnel session ended");
            Ok(())
        }
        Err(e) => {
            error!("tunnel session failed: {e}");
            Err(e.into())
        }
    }
}

async fn list(config: Config) -> Result<()> {
    let mut client = BrokerClient::connect(&config.broker).await?;
    let ids = client.list_tunnels().await?;
    if ids.is_empty() {
        warn!("no tunnels on this account");
    }
    for id in ids {
        match client.describe_tunnel(&id).await {
            Ok(spec) => println!(
                "{}  {:5}  {}  mtu {}  {}",
                spec.id,
                spec.kind,
                spec.client_v6,
                spec.mtu,
                if spec.is_suitable() { "usable" } else { "unusable" }
            ),
            Err(e) => println!("{id}  ({e})"),
        }
    }
    client.close().await;
    Ok(())
}

async fn show(config: Config, id: &str) -> Result<()> {
    let mut client = BrokerClient::connect(&config.broker).await?;
    let spec = client.describe_tunnel(id).await?;
    client.close().await;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}
