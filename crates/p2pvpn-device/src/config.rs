//! Interface configuration

use crate::DeviceError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Layer at which the virtual interface exchanges frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Network layer: bare IP packets
    #[default]
    Tun,
    /// Link layer: full Ethernet frames
    Tap,
}

impl LinkMode {
    pub fn is_link_layer(self) -> bool {
        matches!(self, LinkMode::Tap)
    }
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMode::Tun => f.write_str("tun"),
            LinkMode::Tap => f.write_str("tap"),
        }
    }
}

/// Parameters used once, when the interface is created.
///
/// A default value is a valid configuration: a TUN device with a
/// system-assigned name, MTU 1500 and no addressing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// TUN or TAP
    pub mode: LinkMode,
    /// Interface name; `None` lets the OS pick one (tun0, utun3, ...)
    pub name: Option<String>,
    /// Maximum transmission unit
    pub mtu: u16,
    /// Local tunnel address with prefix; `None` leaves addressing alone
    pub local_address: Option<IpNet>,
    /// Point-to-point peer address
    pub remote_address: Option<IpAddr>,
    /// Keep the device after the process exits (Linux)
    pub persist: bool,
    /// Create the device with multiqueue support (Linux)
    pub multi_queue: bool,
    /// Owning user id (Linux)
    pub owner: Option<u32>,
    /// Owning group id (Linux)
    pub group: Option<u32>,
}

impl InterfaceConfig {
    /// Default MTU for the tunnel interface
    pub const DEFAULT_MTU: u16 = 1500;

    /// Smallest MTU accepted (IPv4 minimum)
    pub const MIN_MTU: u16 = 68;

    /// Largest MTU accepted; larger packets would not fit in a tunnel frame
    pub const MAX_MTU: u16 = 1500;

    /// Longest interface name the kernel accepts (IFNAMSIZ - 1)
    pub const MAX_NAME_LEN: usize = 15;

    pub fn new(mode: LinkMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set point-to-point addressing
    pub fn with_tunnel_ip(mut self, local: IpNet, remote: Option<IpAddr>) -> Self {
        self.local_address = Some(local);
        self.remote_address = remote;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_multi_queue(mut self, multi_queue: bool) -> Self {
        self.multi_queue = multi_queue;
        self
    }

    pub fn with_permissions(mut self, owner: Option<u32>, group: Option<u32>) -> Self {
        self.owner = owner;
        self.group = group;
        self
    }

    /// The subset of the configuration applied by a [`crate::LinkConfigurator`]
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            mtu: self.mtu,
            local_address: self.local_address,
            remote_address: self.remote_address,
        }
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.mtu < Self::MIN_MTU || self.mtu > Self::MAX_MTU {
            return Err(DeviceError::InvalidConfig(format!(
                "MTU {} outside {}..={}",
                self.mtu,
                Self::MIN_MTU,
                Self::MAX_MTU
            )));
        }

        if let Some(name) = &self.name {
            if name.is_empty() || name.len() > Self::MAX_NAME_LEN {
                return Err(DeviceError::InvalidConfig(format!(
                    "interface name {:?} must be 1..={} bytes",
                    name,
                    Self::MAX_NAME_LEN
                )));
            }
            if name.bytes().any(|b| b == 0 || b == b'/' || b.is_ascii_whitespace()) {
                return Err(DeviceError::InvalidConfig(format!(
                    "interface name {:?} contains invalid characters",
                    name
                )));
            }
        }

        match (self.local_address, self.remote_address) {
            (None, Some(_)) => Err(DeviceError::InvalidConfig(
                "remote address requires a local address".to_string(),
            )),
            (Some(local), Some(remote)) if local.addr().is_ipv4() != remote.is_ipv4() => Err(
                DeviceError::InvalidConfig("local and remote addresses differ in family".to_string()),
            ),
            (Some(local), Some(remote)) if local.addr() == remote => Err(
                DeviceError::InvalidConfig("local and remote addresses are identical".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Tun,
            name: None,
            mtu: Self::DEFAULT_MTU,
            local_address: None,
            remote_address: None,
            persist: false,
            multi_queue: false,
            owner: None,
            group: None,
        }
    }
}

/// Link settings applied right after the device is allocated
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOptions {
    pub mtu: u16,
    pub local_address: Option<IpNet>,
    pub remote_address: Option<IpAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_config() -> InterfaceConfig {
        InterfaceConfig::new(LinkMode::Tun).with_tunnel_ip(
            "10.9.0.1/24".parse().unwrap(),
            Some("10.9.0.2".parse().unwrap()),
        )
    }

    #[test]
    fn test_default_is_valid() {
        let config = InterfaceConfig::default();
        assert_eq!(config.mode, LinkMode::Tun);
        assert_eq!(config.mtu, 1500);
        assert!(config.local_address.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = InterfaceConfig::new(LinkMode::Tap)
            .with_name("vpn0")
            .with_mtu(1400)
            .with_persist(true)
            .with_multi_queue(true)
            .with_permissions(Some(1000), None);

        assert!(config.mode.is_link_layer());
        assert_eq!(config.name.as_deref(), Some("vpn0"));
        assert_eq!(config.mtu, 1400);
        assert!(config.persist);
        assert!(config.multi_queue);
        assert_eq!(config.owner, Some(1000));
        assert_eq!(config.group, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_mtu_range() {
        assert!(InterfaceConfig::default().with_mtu(67).validate().is_err());
        assert!(InterfaceConfig::default().with_mtu(1501).validate().is_err());
        assert!(InterfaceConfig::default().with_mtu(68).validate().is_ok());
    }

    #[test]
    fn test_validate_name() {
        assert!(InterfaceConfig::default()
            .with_name("a-very-long-interface")
            .validate()
            .is_err());
        assert!(InterfaceConfig::default().with_name("").validate().is_err());
        assert!(InterfaceConfig::default().with_name("tun 0").validate().is_err());
        assert!(InterfaceConfig::default().with_name("utun7").validate().is_ok());
    }

    #[test]
    fn test_validate_addressing() {
        assert!(tunnel_config().validate().is_ok());

        let mismatch = InterfaceConfig::default().with_tunnel_ip(
            "10.9.0.1/24".parse().unwrap(),
            Some("fd00::2".parse().unwrap()),
        );
        assert!(mismatch.validate().is_err());

        let duplicate = InterfaceConfig::default().with_tunnel_ip(
            "10.9.0.1/24".parse().unwrap(),
            Some("10.9.0.1".parse().unwrap()),
        );
        assert!(duplicate.validate().is_err());

        let remote_only = InterfaceConfig {
            remote_address: Some("10.9.0.2".parse().unwrap()),
            ..InterfaceConfig::default()
        };
        assert!(remote_only.validate().is_err());
    }

    #[test]
    fn test_link_options() {
        let options = tunnel_config().with_mtu(1280).link_options();
        assert_eq!(options.mtu, 1280);
        assert_eq!(options.local_address, Some("10.9.0.1/24".parse().unwrap()));
        assert_eq!(options.remote_address, Some("10.9.0.2".parse().unwrap()));
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: InterfaceConfig =
            serde_json::from_str(r#"{"mode":"tap","local_address":"10.1.0.1/30"}"#).unwrap();
        assert_eq!(config.mode, LinkMode::Tap);
        assert_eq!(config.mtu, InterfaceConfig::DEFAULT_MTU);
        assert_eq!(config.local_address, Some("10.1.0.1/30".parse().unwrap()));
        assert!(!config.persist);
    }
}
