//! Run configuration: an optional YAML file overridden by command-line flags

use anyhow::{bail, Context, Result};
use clap::Args;
use ipnet::IpNet;
use p2pvpn_device::{InterfaceConfig, LinkMode};
use p2pvpn_transport::PeerAddr;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Listen address used when neither flags nor the file name one
pub const DEFAULT_LISTEN: &str = "0.0.0.0:4001";

/// Flags of the `run` command
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Identity directory (created with `keygen`)
    #[arg(short = 'f', long = "identity", env = "P2PVPN_IDENTITY")]
    pub identity: Option<PathBuf>,

    /// Remote peer as <peer-id>@<host:port>
    #[arg(short = 'p', long = "peer", env = "P2PVPN_PEER")]
    pub peer: Option<String>,

    /// UDP address to listen on
    #[arg(short = 'l', long = "listen", env = "P2PVPN_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Tunnel addresses as <local>[/prefix],<remote>
    #[arg(short = 't', long = "tunnel-ip", env = "P2PVPN_TUNNEL_IP")]
    pub tunnel_ip: Option<String>,

    /// Carry Ethernet frames (TAP) instead of IP packets (TUN)
    #[arg(long)]
    pub tap: bool,

    /// Interface name
    #[arg(long)]
    pub name: Option<String>,

    /// Interface MTU
    #[arg(long)]
    pub mtu: Option<u16>,

    /// Keep the interface after exit (Linux)
    #[arg(long)]
    pub persist: bool,

    /// Create a multiqueue interface (Linux)
    #[arg(long)]
    pub multi_queue: bool,

    /// YAML run configuration
    #[arg(long, env = "P2PVPN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Contents of a YAML run configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub identity: Option<PathBuf>,
    pub peer: Option<String>,
    pub listen: Option<SocketAddr>,
    pub interface: InterfaceConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Everything `run` needs, after merging file and flags
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub identity: PathBuf,
    pub peer: PeerAddr,
    pub listen: SocketAddr,
    pub interface: InterfaceConfig,
}

impl RunSettings {
    /// Merge `args` over `file`; flags win
    pub fn resolve(file: RunConfig, args: &RunArgs) -> Result<Self> {
        let identity = args
            .identity
            .clone()
            .or(file.identity)
            .context("No identity directory given (-f)")?;

        let peer = args
            .peer
            .clone()
            .or(file.peer)
            .context("No peer address given (-p)")?;
        let peer: PeerAddr = peer
            .parse()
            .with_context(|| format!("Invalid peer address {}", peer))?;

        let listen = match args.listen.or(file.listen) {
            Some(listen) => listen,
            None => DEFAULT_LISTEN.parse()?,
        };

        let mut interface = file.interface;
        if args.tap {
            interface.mode = LinkMode::Tap;
        }
        if let Some(name) = &args.name {
            interface.name = Some(name.clone());
        }
        if let Some(mtu) = args.mtu {
            interface.mtu = mtu;
        }
        if args.persist {
            interface.persist = true;
        }
        if args.multi_queue {
            interface.multi_queue = true;
        }
        if let Some(tunnel_ip) = &args.tunnel_ip {
            let (local, remote) = parse_tunnel_ip(tunnel_ip)?;
            interface = interface.with_tunnel_ip(local, Some(remote));
        }

        interface.validate().context("Invalid interface configuration")?;

        Ok(Self {
            identity,
            peer,
            listen,
            interface,
        })
    }
}

/// Parse `<local>[/prefix],<remote>`
///
/// A local address without a prefix is a host route (/32 or /128).
pub fn parse_tunnel_ip(value: &str) -> Result<(IpNet, IpAddr)> {
    let Some((local, remote)) = value.split_once(',') else {
        bail!("Expected <local>,<remote> tunnel addresses, got {}", value);
    };

    let local = local.trim();
    let local: IpNet = match local.parse::<IpNet>() {
        Ok(net) => net,
        Err(_) => local
            .parse::<IpAddr>()
            .map(IpNet::from)
            .with_context(|| format!("Invalid local tunnel address {}", local))?,
    };

    let remote = remote.trim();
    let remote: IpAddr = remote
        .parse()
        .with_context(|| format!("Invalid remote tunnel address {}", remote))?;

    Ok((local, remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "3f2a9c@203.0.113.7:4001";

    #[test]
    fn test_parse_tunnel_ip() {
        let (local, remote) = parse_tunnel_ip("10.0.0.1/24,10.0.0.2").unwrap();
        assert_eq!(local, "10.0.0.1/24".parse::<IpNet>().unwrap());
        assert_eq!(remote, "10.0.0.2".parse::<IpAddr>().unwrap());

        let (local, _) = parse_tunnel_ip("10.0.0.1, 10.0.0.2").unwrap();
        assert_eq!(local.prefix_len(), 32);

        let (local, _) = parse_tunnel_ip("fd00::1,fd00::2").unwrap();
        assert_eq!(local.prefix_len(), 128);
    }

    #[test]
    fn test_parse_tunnel_ip_rejects_garbage() {
        assert!(parse_tunnel_ip("10.0.0.1").is_err());
        assert!(parse_tunnel_ip("nope,10.0.0.2").is_err());
        assert!(parse_tunnel_ip("10.0.0.1,nope").is_err());
    }

    #[test]
    fn test_flags_only() {
        let args = RunArgs {
            identity: Some(PathBuf::from("/etc/p2pvpn")),
            peer: Some(PEER.to_string()),
            tunnel_ip: Some("10.0.0.1/24,10.0.0.2".to_string()),
            tap: true,
            mtu: Some(1400),
            ..Default::default()
        };

        let settings = RunSettings::resolve(RunConfig::default(), &args).unwrap();
        assert_eq!(settings.identity, PathBuf::from("/etc/p2pvpn"));
        assert_eq!(settings.peer.address, "203.0.113.7:4001");
        assert_eq!(settings.listen, DEFAULT_LISTEN.parse().unwrap());
        assert_eq!(settings.interface.mode, LinkMode::Tap);
        assert_eq!(settings.interface.mtu, 1400);
        assert_eq!(
            settings.interface.remote_address,
            Some("10.0.0.2".parse().unwrap())
        );
    }

    #[test]
    fn test_flags_override_file() {
        let yaml = format!(
            r#"
identity: /var/lib/p2pvpn
peer: "{}"
listen: 0.0.0.0:5000
interface:
  name: vpn0
  mtu: 1280
"#,
            PEER
        );
        let file: RunConfig = serde_yaml::from_str(&yaml).unwrap();

        let args = RunArgs {
            listen: Some("127.0.0.1:6000".parse().unwrap()),
            name: Some("vpn1".to_string()),
            ..Default::default()
        };

        let settings = RunSettings::resolve(file, &args).unwrap();
        assert_eq!(settings.identity, PathBuf::from("/var/lib/p2pvpn"));
        assert_eq!(settings.listen, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(settings.interface.name.as_deref(), Some("vpn1"));
        assert_eq!(settings.interface.mtu, 1280);
        assert_eq!(settings.interface.mode, LinkMode::Tun);
    }

    #[test]
    fn test_missing_required_values() {
        let args = RunArgs {
            peer: Some(PEER.to_string()),
            ..Default::default()
        };
        assert!(RunSettings::resolve(RunConfig::default(), &args).is_err());

        let args = RunArgs {
            identity: Some(PathBuf::from("/etc/p2pvpn")),
            ..Default::default()
        };
        assert!(RunSettings::resolve(RunConfig::default(), &args).is_err());
    }

    #[test]
    fn test_invalid_interface_is_rejected() {
        let args = RunArgs {
            identity: Some(PathBuf::from("/etc/p2pvpn")),
            peer: Some(PEER.to_string()),
            mtu: Some(20),
            ..Default::default()
        };
        assert!(RunSettings::resolve(RunConfig::default(), &args).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, "listen: 0.0.0.0:4002\ninterface:\n  mode: tap\n").unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.listen, Some("0.0.0.0:4002".parse().unwrap()));
        assert_eq!(config.interface.mode, LinkMode::Tap);
        assert!(RunConfig::load(&dir.path().join("missing.yaml")).is_err());
    }
}
