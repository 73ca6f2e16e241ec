//! WireGuard device configuration through the `ip` and `wg` utilities

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use super::{DeviceConfig, PeerConfig};
use crate::error::{Error, Result};

/// Drives `ip` and `wg`; private keys are handed over through files in `key_dir`
pub struct WgDevice {
    key_dir: PathBuf,
}

impl WgDevice {
    pub fn new(key_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&key_dir)?;
        Ok(Self { key_dir })
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.key_dir.join(format!("{}.key", name))
    }

    async fn run(&self, interface: &str, program: &str, args: &[&str]) -> Result<String> {
        tracing::debug!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Device {
                interface: interface.to_string(),
                reason: format!("failed to run {}: {}", program, e),
            })?;

        if !output.status.success() {
            return Err(Error::Device {
                interface: interface.to_string(),
                reason: format!(
                    "{} {} exited with {}: {}",
                    program,
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn write_private_key(path: &Path, key: &str) -> Result<()> {
    std::fs::write(path, key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn parse_listen_port(interface: &str, stdout: &str) -> Result<u16> {
    stdout.trim().parse::<u16>().map_err(|_| Error::Device {
        interface: interface.to_string(),
        reason: format!("unexpected listen-port output: {:?}", stdout.trim()),
    })
}

#[async_trait]
impl DeviceConfig for WgDevice {
    async fn create_interface(&self, name: &str) -> Result<()> {
        self.run(name, "ip", &["link", "add", "dev", name, "type", "wireguard"]).await?;
        tracing::info!("Created interface {}", name);
        Ok(())
    }

    async fn delete_interface(&self, name: &str) -> Result<()> {
        self.run(name, "ip", &["link", "delete", "dev", name]).await?;
        if let Err(e) = std::fs::remove_file(self.key_path(name)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove key file of {}: {}", name, e);
            }
        }
        tracing::info!("Deleted interface {}", name);
        Ok(())
    }

    async fn set_interface_address(&self, name: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let cidr = format!("{}/{}", addr, prefix_len);
        let family_flag = match addr {
            IpAddr::V4(_) => "-4",
            IpAddr::V6(_) => "-6",
        };
        self.run(name, "ip", &[family_flag, "addr", "add", &cidr, "dev", name]).await?;
        Ok(())
    }

    async fn set_private_key(&self, name: &str, private_key: &str) -> Result<()> {
        let path = self.key_path(name);
        write_private_key(&path, private_key)?;
        let path = path.to_string_lossy().into_owned();
        self.run(name, "wg", &["set", name, "private-key", &path]).await?;
        Ok(())
    }

    async fn set_peer(&self, name: &str, peer: &PeerConfig) -> Result<()> {
        let allowed = format!("{}/{}", peer.allowed_ip, peer.allowed_prefix_len);
        let endpoint = peer.endpoint.to_string();
        let keepalive = peer.keepalive.to_string();
        self.run(
            name,
            "wg",
            &[
                "set",
                name,
                "peer",
                &peer.public_key,
                "allowed-ips",
                &allowed,
                "endpoint",
                &endpoint,
                "persistent-keepalive",
                &keepalive,
            ],
        )
        .await?;
        tracing::info!("Configured peer {} on {} via {}", peer.allowed_ip, name, endpoint);
        Ok(())
    }

    async fn remove_peer(&self, name: &str, public_key: &str) -> Result<()> {
        self.run(name, "wg", &["set", name, "peer", public_key, "remove"]).await?;
        Ok(())
    }

    async fn bring_up(&self, name: &str) -> Result<()> {
        self.run(name, "ip", &["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn listen_port(&self, name: &str) -> Result<u16> {
        let stdout = self.run(name, "wg", &["show", name, "listen-port"]).await?;
        parse_listen_port(name, &stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_listen_port() {
        assert_eq!(parse_listen_port("v4wolfc0", "51820\n").unwrap(), 51820);
        assert!(parse_listen_port("v4wolfc0", "").is_err());
    }

    #[test]
    fn test_private_key_file_is_owner_only() {
        let dir = tempdir().unwrap();
        let device = WgDevice::new(dir.path().join("keys")).unwrap();
        let path = device.key_path("v4wolfc0");
        write_private_key(&path, "secret").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_failed_command_is_a_device_error() {
        let dir = tempdir().unwrap();
        let device = WgDevice::new(dir.path().to_path_buf()).unwrap();
        let err = device
            .run("v4wolfc0", "wolfconnect-no-such-binary", &[])
            .await
            .unwrap_err();
        assert!(err.is_fatal_to_session());
    }
}
