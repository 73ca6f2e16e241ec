//! WolfConnect - Automatic WireGuard Tunnel Negotiation
//!
//! Runs one negotiation engine per address family, discovers or connects
//! to the configured peers and configures a WireGuard tunnel per peer.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfconnect::config::{DeviceBackend, WolfConnectConfig};
use wolfconnect::device::{DeviceConfig, MemoryDevice, WgDevice};
use wolfconnect::engine::{self, Engine, EngineContext};
use wolfconnect::error::{Error, Result};
use wolfconnect::network::{self, MulticastListener, UdpTransport};
use wolfconnect::protocol::Family;
use wolfconnect::state::{TunnelRegistry, TunnelStore, TunnelTracker};
use wolfconnect::tunnel::TunnelRecord;

/// WolfConnect - Automatic WireGuard Tunnel Negotiation
#[derive(Parser)]
#[command(name = "wolfconnect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wolfconnect/wolfconnect.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start negotiating tunnels
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfconnect.toml")]
        output: PathBuf,

        /// Peer to connect to (repeat for several; none = multicast discovery)
        #[arg(long)]
        peer: Vec<IpAddr>,
    },

    /// Validate configuration file
    Validate,

    /// List tunnels stored by a previous run
    Tunnels {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config problems are reported by the commands themselves
    let config = WolfConnectConfig::from_file(&cli.config).ok();
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = config
        .as_ref()
        .map(|c| c.logging.format.clone())
        .unwrap_or_else(|| "pretty".to_string());
    init_logging(&level, &format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, peer } => run_init(output, peer),
        Commands::Validate => run_validate(cli.config),
        Commands::Tunnels { json } => run_tunnels(cli.config, json).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// A started engine and its multicast listener
struct FamilyRuntime {
    engine: Engine,
    listener: Option<MulticastListener>,
}

/// Start the negotiation engines and run until interrupted
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfConnect...");

    let config = match WolfConnectConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };

    if config.device.backend == DeviceBackend::Wg && !nix::unistd::Uid::effective().is_root() {
        tracing::error!("Configuring WireGuard interfaces requires root");
        tracing::error!("Run as root or set [device] backend = \"memory\" for a dry run");
        return Err(Error::Config("not running as root".into()));
    }

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let tracker = Arc::new(TunnelTracker::new(config.data_dir().clone())?);
    let registry = Arc::new(TunnelRegistry::new());
    match tracker.load_all().await {
        Ok(records) => {
            let restored = registry.restore(records).await;
            tracing::info!("Restored {} tunnels from {:?}", restored, config.data_dir());
        }
        Err(e) => tracing::warn!("Could not load stored tunnels: {}", e),
    }

    let device: Arc<dyn DeviceConfig> = match config.device.backend {
        DeviceBackend::Wg => Arc::new(WgDevice::new(config.key_dir())?),
        DeviceBackend::Memory => {
            tracing::warn!("Using the in-memory device backend, no interfaces will be configured");
            Arc::new(MemoryDevice::new())
        }
    };
    let machine_id = config.node.machine_id.unwrap_or_else(rand::random);
    tracing::info!("Machine id: {}", machine_id);

    let mut runtimes = Vec::new();
    for family in config.enabled_families() {
        match start_family(&config, family, machine_id, &registry, &device, &tracker).await {
            Ok(runtime) => runtimes.push(runtime),
            Err(e) => tracing::error!("{} engine failed to start: {}", family, e),
        }
    }
    if runtimes.is_empty() {
        return Err(Error::Network("no negotiation engine could be started".into()));
    }

    tracing::info!("WolfConnect is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    futures::future::join_all(runtimes.into_iter().map(|runtime| async move {
        if let Some(listener) = &runtime.listener {
            listener.stop().await;
        }
        runtime.engine.shutdown().await;
    }))
    .await;
    Ok(())
}

async fn start_family(
    config: &WolfConnectConfig,
    family: Family,
    machine_id: u32,
    registry: &Arc<TunnelRegistry>,
    device: &Arc<dyn DeviceConfig>,
    tracker: &Arc<TunnelTracker>,
) -> Result<FamilyRuntime> {
    let settings = config.family_settings(family)?;

    let local_addrs = if settings.local_addresses.is_empty() {
        network::local_addresses(family, &settings.interfaces)?
    } else {
        settings.local_addresses.clone()
    };
    if local_addrs.is_empty() {
        return Err(Error::Network(format!("no usable {} address on this host", family)));
    }
    tracing::info!("{} local addresses: {:?}", family, local_addrs);

    let (queue, items) = engine::queue();
    let transport = Arc::new(UdpTransport::new(family, settings.buffer_size, queue.clone()));
    let discovery = settings.remote_addresses.is_empty();

    let listener = MulticastListener::new(&settings, local_addrs.clone(), Arc::clone(registry), queue.clone());
    let ctx = EngineContext::new(settings, transport, Arc::clone(device), tracker.clone())
        .with_machine_id(machine_id)
        .with_local_addresses(local_addrs)
        .with_registry(Arc::clone(registry));
    let engine = Engine::start(ctx, queue, items).await?;

    let listener = match listener.start().await {
        Ok(_) => Some(listener),
        Err(e) => {
            tracing::warn!("{} multicast discovery unavailable: {}", family, e);
            None
        }
    };

    let started = engine.connect_configured().await?;
    if discovery {
        tracing::info!("{} discovering peers by multicast from {} addresses", family, started);
    } else {
        tracing::info!("{} negotiating with {} configured peers", family, started);
    }

    Ok(FamilyRuntime { engine, listener })
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, peers: Vec<IpAddr>) -> Result<()> {
    let (v4_peers, v6_peers): (Vec<IpAddr>, Vec<IpAddr>) = peers.into_iter().partition(|p| p.is_ipv4());
    let list = |addrs: &[IpAddr]| {
        addrs
            .iter()
            .map(|a| format!("\"{}\"", a))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let config_content = format!(
        r#"# WolfConnect Configuration
# Generated configuration file

[node]
data_dir = "/var/lib/wolfconnect"
# machine_id = 1234
interface_prefix = "wolfc"

[v4]
enabled = true
port = 268
multicast_group = "224.0.0.1"
local_addresses = []
# interfaces = ["eth0"]
remote_addresses = [{v4}]
tunnel_network = "10.0.0.0/8"

[v6]
enabled = true
port = 547
multicast_group = "ff7e:230::1234"
local_addresses = []
remote_addresses = [{v6}]
tunnel_network = "fc00::/64"

[session]
reply_timeout_secs = 300
max_sessions = 32
persistent_keepalive = 0
buffer_size = 51200

[device]
backend = "wg"

[logging]
level = "info"
format = "pretty"
"#,
        v4 = list(&v4_peers),
        v6 = list(&v6_peers),
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {:?}", output);
    println!("Edit the file to list peers, then run: wolfconnect start");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfConnectConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Device Backend: {:?}", config.device.backend);
            println!("  Reply Timeout:  {:?}", config.reply_timeout());
            for family in config.enabled_families() {
                let settings = config.family_settings(family)?;
                let peers = if settings.remote_addresses.is_empty() {
                    format!("multicast {}", settings.multicast_group)
                } else {
                    format!("{:?}", settings.remote_addresses)
                };
                println!(
                    "  {}: port {}, network {}, peers {}",
                    family, settings.port, settings.tunnel_network, peers
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// List tunnels stored by a previous run
async fn run_tunnels(config_path: PathBuf, json: bool) -> Result<()> {
    let config = WolfConnectConfig::from_file(&config_path)?;
    let tracker = TunnelTracker::new(config.data_dir().clone())?;
    let mut tunnels = tracker.load_all().await?;
    tunnels.sort_by_key(|t| (t.family == Family::V6, t.local_interface_name.clone()));

    if json {
        let out = serde_json::to_string_pretty(&tunnels)
            .map_err(|e| Error::Internal(format!("Failed to serialize tunnels: {}", e)))?;
        println!("{}", out);
        return Ok(());
    }

    if tunnels.is_empty() {
        println!("No tunnels stored in {}", config.data_dir().display());
        return Ok(());
    }
    print_tunnels(&tunnels);
    Ok(())
}

fn print_tunnels(tunnels: &[TunnelRecord]) {
    println!(
        "{:<10} {:<8} {:<18} {:<26} {:<26} {:<18}",
        "INTERFACE", "ROLE", "STATE", "TUNNEL", "PEER", "UPDATED"
    );
    println!("{}", "-".repeat(110));
    for t in tunnels {
        println!(
            "{:<10} {:<8} {:<18} {:<26} {:<26} {:<18}",
            t.local_interface_name,
            t.local_endpoint_type.label(),
            t.state.label(),
            format!("{} -> {}", t.local_tunnel_addr, t.remote_tunnel_addr),
            t.remote_endpoint().to_string(),
            t.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}
