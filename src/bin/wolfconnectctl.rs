//! WolfConnectCtl - Command line tool for inspecting WolfConnect nodes
//!
//! Usage:
//!   wolfconnectctl status                      - Ask every node on the multicast group
//!   wolfconnectctl status --address 10.0.0.2   - Ask one node
//!   wolfconnectctl status --json               - Print the replies as JSON

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::net::UdpSocket;

use wolfconnect::protocol::{Family, Message, MessageType, OptionCode, Sender, BUFFER_SIZE};

/// WolfConnect Control Tool
#[derive(Parser)]
#[command(name = "wolfconnectctl")]
#[command(about = "Inspect tunnels negotiated by WolfConnect nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the tunnels known to one node or to every node on the segment
    Status {
        /// Node to ask (defaults to the family multicast group)
        #[arg(short, long)]
        address: Option<IpAddr>,

        /// Protocol port (defaults to 268 for v4, 547 for v6)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address family to query: v4 or v6
        #[arg(short, long, default_value = "v4")]
        family: String,

        /// Stop collecting replies after this many quiet seconds
        #[arg(long, default_value_t = 2)]
        timeout_secs: u64,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// One tunnel as reported by a node
#[derive(Debug, Serialize)]
struct TunnelStatus {
    node: String,
    reporter: SocketAddr,
    tunnel_id: String,
    status: String,
    role: String,
    interface: String,
    tunnel_network: String,
    local_tunnel_addr: Option<IpAddr>,
    remote_tunnel_addr: Option<IpAddr>,
    local_phys_addr: Option<IpAddr>,
    remote_phys_addr: Option<IpAddr>,
    local_listen_port: Option<u32>,
    remote_listen_port: Option<u32>,
    keepalive: Option<u32>,
}

impl TunnelStatus {
    fn from_reply(reply: &Message) -> Option<Self> {
        let text = |code| reply.get_str(code).unwrap_or_default().trim().to_string();
        let tunnel_id = reply.get_str(OptionCode::TunnelId)?.trim().to_string();

        Some(Self {
            node: text(OptionCode::GenericId),
            reporter: reply.remote,
            tunnel_id,
            status: text(OptionCode::TunnelStatus),
            role: text(OptionCode::LocalEndpointType),
            interface: text(OptionCode::InterfaceName),
            tunnel_network: text(OptionCode::TunnelNetwork),
            local_tunnel_addr: reply.get_ip(OptionCode::LocalTunnelAddr),
            remote_tunnel_addr: reply.get_ip(OptionCode::RemoteTunnelAddr),
            local_phys_addr: reply.get_ip(OptionCode::LocalPhysAddr),
            remote_phys_addr: reply.get_ip(OptionCode::RemotePhysAddr),
            local_listen_port: reply.get_u32(OptionCode::LocalPhysListenPort),
            remote_listen_port: reply.get_u32(OptionCode::RemotePhysListenPort),
            keepalive: reply.get_u32(OptionCode::KeepalivePolicy),
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Status {
            address,
            port,
            family,
            timeout_secs,
            json,
        } => show_status(address, port, &family, Duration::from_secs(timeout_secs), json).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn parse_family(family: &str) -> Result<Family> {
    match family.to_ascii_lowercase().as_str() {
        "v4" | "4" | "ipv4" => Ok(Family::V4),
        "v6" | "6" | "ipv6" => Ok(Family::V6),
        other => anyhow::bail!("unknown family {:?} (expected v4 or v6)", other),
    }
}

async fn show_status(
    address: Option<IpAddr>,
    port: Option<u16>,
    family: &str,
    quiet: Duration,
    json: bool,
) -> Result<()> {
    let family = parse_family(family)?;
    let target = SocketAddr::new(
        address.unwrap_or_else(|| family.default_multicast_group()),
        port.unwrap_or_else(|| family.default_port()),
    );
    if Family::of(&target.ip()) != family {
        anyhow::bail!("{} is not a {} address", target.ip(), family);
    }

    let socket = UdpSocket::bind(SocketAddr::new(family.unspecified(), 0))
        .await
        .context("Failed to bind a local socket")?;
    let local = socket.local_addr()?;
    let xid: u32 = rand::random();

    let request = Message::new(family, MessageType::InfoRequest, Sender::Client, xid, local, target);
    socket
        .send_to(&request.encode(), target)
        .await
        .with_context(|| format!("Failed to send info request to {}", target))?;

    let mut replies = Vec::new();
    let mut nodes = Vec::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    while let Ok(received) = tokio::time::timeout(quiet, socket.recv_from(&mut buf)).await {
        let (len, src) = received.context("Failed to receive")?;
        let Ok(reply) = Message::decode(family, &buf[..len], local, src) else {
            continue;
        };
        if reply.xid != xid || reply.message_type() != Some(MessageType::InfoRequestReply) {
            continue;
        }
        if !nodes.contains(&src) {
            nodes.push(src);
        }
        if let Some(status) = TunnelStatus::from_reply(&reply) {
            replies.push(status);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&replies)?);
        return Ok(());
    }

    if nodes.is_empty() {
        println!("No reply from {} within {:?}", target, quiet);
        return Ok(());
    }

    println!();
    println!("{} nodes answered, {} tunnels", nodes.len(), replies.len());
    println!();
    if replies.is_empty() {
        return Ok(());
    }
    println!(
        "{:<24} {:<10} {:<8} {:<18} {:<34} {:<18}",
        "NODE", "INTERFACE", "ROLE", "STATUS", "TUNNEL", "PEER"
    );
    println!("{}", "-".repeat(116));
    for t in &replies {
        let tunnel = format!("{} -> {}", display(t.local_tunnel_addr), display(t.remote_tunnel_addr));
        println!(
            "{:<24} {:<10} {:<8} {:<18} {:<34} {:<18}",
            format!("{} ({})", t.reporter.ip(), t.node),
            t.interface,
            t.role,
            t.status,
            tunnel,
            display(t.remote_phys_addr),
        );
    }
    println!();
    Ok(())
}

fn display(addr: Option<IpAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}
