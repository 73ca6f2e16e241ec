//! WolfConnect Configuration
//!
//! This module provides configuration structures for the WolfConnect
//! tunnel negotiation daemon.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{Family, BUFFER_SIZE, MAX_SESSIONS, WAIT_FOR_REPLY_SECS};
use crate::tunnel::TunnelNetwork;

/// Linux limit on interface name length
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Main WolfConnect configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WolfConnectConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// IPv4 negotiation
    #[serde(default)]
    pub v4: FamilyConfig,

    /// IPv6 negotiation
    #[serde(default)]
    pub v6: FamilyConfig,

    /// Handshake timing and limits
    #[serde(default)]
    pub session: SessionConfig,

    /// Tunnel device backend
    #[serde(default)]
    pub device: DeviceSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory for the tunnel database and key files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Identifier announced to peers (random per process when unset)
    #[serde(default)]
    pub machine_id: Option<u32>,

    /// Tunnel interface names are `v4<prefix>N` / `v6<prefix>N`
    #[serde(default = "default_interface_prefix")]
    pub interface_prefix: String,
}

/// Per address family configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// Run a negotiation engine for this family
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// UDP port (268 for V4, 547 for V6 when unset)
    #[serde(default)]
    pub port: Option<u16>,

    /// Multicast group for discovery (224.0.0.1 / ff7e:230::1234 when unset)
    #[serde(default)]
    pub multicast_group: Option<IpAddr>,

    /// Local physical addresses to negotiate from (empty = all host addresses)
    #[serde(default)]
    pub local_addresses: Vec<IpAddr>,

    /// Restrict automatic address discovery to these NICs
    #[serde(default)]
    pub interfaces: Vec<String>,

    /// Peers to connect to (empty = multicast discovery)
    #[serde(default)]
    pub remote_addresses: Vec<IpAddr>,

    /// Tunnel network (10.0.0.0/8 / fc00::/64 when unset)
    #[serde(default)]
    pub tunnel_network: Option<String>,
}

/// Handshake timing and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Wait for each reply before retrying (once) or giving up
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,

    /// Maximum concurrently negotiating sessions per family
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Persistent keepalive programmed on every peer (0 = off)
    #[serde(default)]
    pub persistent_keepalive: u16,

    /// Datagram receive buffer size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Which device backend configures tunnel interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// `ip` and `wg` utilities
    #[default]
    Wg,
    /// In-process only, nothing is configured on the host
    Memory,
}

/// Device backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceSettings {
    #[serde(default)]
    pub backend: DeviceBackend,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Fully resolved settings for one family's engine
#[derive(Debug, Clone)]
pub struct FamilySettings {
    pub family: Family,
    pub port: u16,
    pub multicast_group: IpAddr,
    pub local_addresses: Vec<IpAddr>,
    pub interfaces: Vec<String>,
    pub remote_addresses: Vec<IpAddr>,
    pub tunnel_network: TunnelNetwork,
    pub reply_timeout: Duration,
    pub max_sessions: usize,
    pub keepalive: u16,
    pub buffer_size: usize,
    pub interface_prefix: String,
}

impl FamilySettings {
    /// Settings with every default for `family`
    pub fn defaults(family: Family) -> Self {
        Self {
            family,
            port: family.default_port(),
            multicast_group: family.default_multicast_group(),
            local_addresses: Vec::new(),
            interfaces: Vec::new(),
            remote_addresses: Vec::new(),
            tunnel_network: TunnelNetwork::default_for(family),
            reply_timeout: Duration::from_secs(WAIT_FOR_REPLY_SECS),
            max_sessions: MAX_SESSIONS,
            keepalive: 0,
            buffer_size: BUFFER_SIZE,
            interface_prefix: default_interface_prefix(),
        }
    }

    /// Name of the `index`th tunnel interface of this family
    pub fn interface_name(&self, index: usize) -> String {
        format!("{}{}{}", self.family.interface_tag(), self.interface_prefix, index)
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfconnect")
}

fn default_interface_prefix() -> String {
    "wolfc".to_string()
}

fn default_reply_timeout_secs() -> u64 {
    WAIT_FOR_REPLY_SECS
}

fn default_max_sessions() -> usize {
    MAX_SESSIONS
}

fn default_buffer_size() -> usize {
    BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            machine_id: None,
            interface_prefix: default_interface_prefix(),
        }
    }
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: None,
            multicast_group: None,
            local_addresses: Vec::new(),
            interfaces: Vec::new(),
            remote_addresses: Vec::new(),
            tunnel_network: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: default_reply_timeout_secs(),
            max_sessions: default_max_sessions(),
            persistent_keepalive: 0,
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfConnectConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfConnectConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !self.v4.enabled && !self.v6.enabled {
            return Err(crate::Error::Config("at least one of v4 and v6 must be enabled".into()));
        }

        if self.session.reply_timeout_secs == 0 {
            return Err(crate::Error::Config("session.reply_timeout_secs cannot be 0".into()));
        }

        if self.session.max_sessions == 0 {
            return Err(crate::Error::Config("session.max_sessions cannot be 0".into()));
        }

        // "v4" + prefix + at least two index digits
        if self.node.interface_prefix.is_empty()
            || self.node.interface_prefix.len() + 4 > MAX_INTERFACE_NAME_LEN
        {
            return Err(crate::Error::Config(format!(
                "node.interface_prefix must be 1 to {} characters",
                MAX_INTERFACE_NAME_LEN - 4
            )));
        }

        for family in [Family::V4, Family::V6] {
            if self.family_config(family).enabled {
                self.family_settings(family)?;
            }
        }

        Ok(())
    }

    pub fn family_config(&self, family: Family) -> &FamilyConfig {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    /// Families with an enabled engine
    pub fn enabled_families(&self) -> Vec<Family> {
        [Family::V4, Family::V6]
            .into_iter()
            .filter(|f| self.family_config(*f).enabled)
            .collect()
    }

    /// Resolve defaults and check a family section
    pub fn family_settings(&self, family: Family) -> crate::Result<FamilySettings> {
        let section = self.family_config(family);
        let name = family.interface_tag();
        let mut settings = FamilySettings::defaults(family);

        if let Some(port) = section.port {
            if port == 0 {
                return Err(crate::Error::Config(format!("{}.port cannot be 0", name)));
            }
            settings.port = port;
        }

        if let Some(group) = section.multicast_group {
            if Family::of(&group) != family || !group.is_multicast() {
                return Err(crate::Error::Config(format!(
                    "{}.multicast_group {} is not a {} multicast address",
                    name, group, family
                )));
            }
            settings.multicast_group = group;
        }

        if let Some(net) = &section.tunnel_network {
            let net: TunnelNetwork = net.parse()?;
            if net.family() != family {
                return Err(crate::Error::Config(format!(
                    "{}.tunnel_network {} is not a {} network",
                    name, net, family
                )));
            }
            settings.tunnel_network = net;
        }

        for addr in section.local_addresses.iter().chain(&section.remote_addresses) {
            if Family::of(addr) != family {
                return Err(crate::Error::Config(format!(
                    "{} is listed in [{}] but is not a {} address",
                    addr, name, family
                )));
            }
        }

        settings.local_addresses = section.local_addresses.clone();
        settings.interfaces = section.interfaces.clone();
        settings.remote_addresses = section.remote_addresses.clone();
        settings.reply_timeout = self.reply_timeout();
        settings.max_sessions = self.session.max_sessions;
        settings.keepalive = self.session.persistent_keepalive;
        settings.buffer_size = self.session.buffer_size;
        settings.interface_prefix = self.node.interface_prefix.clone();

        Ok(settings)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the key file directory path
    pub fn key_dir(&self) -> PathBuf {
        self.node.data_dir.join("keys")
    }

    /// Get reply timeout as Duration
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.session.reply_timeout_secs)
    }
}
