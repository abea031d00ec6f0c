//! Virtual network interfaces for the tunnel
//!
//! A [`VirtualInterface`] is a TUN (IP packets) or TAP (Ethernet frames)
//! device. Each read yields exactly one frame and each write injects exactly
//! one frame. [`create`] allocates the platform device and configures its
//! link (MTU, addresses, up) before handing it out.

pub mod config;
pub mod link;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "linux")]
mod netlink;

pub use config::{InterfaceConfig, LinkMode, LinkOptions};
pub use link::{link_plan, IfconfigConfigurator, LinkCommand, LinkConfigurator, LinkStep};

#[cfg(target_os = "linux")]
pub use linux::LinuxInterface;
#[cfg(target_os = "macos")]
pub use macos::MacosInterface;
#[cfg(target_os = "linux")]
pub use netlink::NetlinkConfigurator;

use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Device-level errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Invalid interface configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to create interface: {0}")]
    Create(String),

    #[error("Failed to configure {device} ({step}): {message}")]
    Configuration {
        device: String,
        step: &'static str,
        message: String,
    },

    #[error("{0} mode is not supported on this platform")]
    UnsupportedMode(LinkMode),

    #[error("Virtual interfaces are not supported on this platform")]
    UnsupportedPlatform,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A frame-oriented virtual network device
#[async_trait]
pub trait VirtualInterface: Send + Sync + Debug {
    /// Read one frame into `buf`, returning its length
    ///
    /// Frames longer than `buf` are truncated by the OS.
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Inject one frame into the host network stack
    async fn write_frame(&self, frame: &[u8]) -> io::Result<()>;

    /// True for TAP (Ethernet) devices, false for TUN (IP) devices
    fn is_link_layer(&self) -> bool;

    /// Name assigned by the OS
    fn name(&self) -> &str;

    fn mtu(&self) -> u16;
}

/// Shared handle to a configured interface
pub type Interface = Arc<dyn VirtualInterface>;

/// Create and configure the platform's virtual interface
pub async fn create(config: &InterfaceConfig) -> Result<Interface, DeviceError> {
    config.validate()?;
    open_platform(config).await
}

#[cfg(target_os = "linux")]
async fn open_platform(config: &InterfaceConfig) -> Result<Interface, DeviceError> {
    let device = LinuxInterface::open(config)?;
    establish(device, &NetlinkConfigurator, config, |device| {
        device.set_persist(true)
    })
    .await
}

#[cfg(target_os = "macos")]
async fn open_platform(config: &InterfaceConfig) -> Result<Interface, DeviceError> {
    let device = MacosInterface::open(config)?;
    establish(device, &IfconfigConfigurator, config, |device| {
        warn!("{} is removed on exit; utun devices cannot persist", device.name());
        Ok(())
    })
    .await
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn open_platform(_config: &InterfaceConfig) -> Result<Interface, DeviceError> {
    Err(DeviceError::UnsupportedPlatform)
}

/// Configure the link, then make the device persistent if asked to
///
/// Persistence is the last step so that a device failing setup is never
/// left behind in the kernel when it is dropped.
async fn establish<D, P>(
    device: D,
    configurator: &dyn LinkConfigurator,
    config: &InterfaceConfig,
    persist: P,
) -> Result<Interface, DeviceError>
where
    D: VirtualInterface + 'static,
    P: FnOnce(&D) -> Result<(), DeviceError>,
{
    let device = configure_link(device, configurator, config).await?;

    if config.persist {
        if let Err(e) = persist(&device) {
            warn!("Closing {}: {}", device.name(), e);
            return Err(e);
        }
    }

    Ok(Arc::new(device))
}

/// Apply link settings to an opened device
///
/// On failure the device is dropped, which closes it, and the error of the
/// first failing step is returned.
pub async fn configure_link<D>(
    device: D,
    configurator: &dyn LinkConfigurator,
    config: &InterfaceConfig,
) -> Result<D, DeviceError>
where
    D: VirtualInterface,
{
    if let Err(e) = configurator
        .configure(device.name(), &config.link_options())
        .await
    {
        warn!("Closing {} after failed link setup: {}", device.name(), e);
        drop(device);
        return Err(e);
    }

    info!(
        "Interface {} up ({}, mtu {})",
        device.name(),
        config.mode,
        config.mtu
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<&'static str>>>;

    fn events() -> Events {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn seen(events: &Events) -> Vec<&'static str> {
        events.lock().unwrap().clone()
    }

    #[derive(Debug)]
    struct RecordingDevice {
        events: Events,
    }

    impl Drop for RecordingDevice {
        fn drop(&mut self) {
            self.events.lock().unwrap().push("closed");
        }
    }

    #[async_trait]
    impl VirtualInterface for RecordingDevice {
        async fn read_frame(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        async fn write_frame(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn is_link_layer(&self) -> bool {
            false
        }

        fn name(&self) -> &str {
            "test0"
        }

        fn mtu(&self) -> u16 {
            1500
        }
    }

    #[derive(Debug)]
    struct FailAt(&'static str);

    #[async_trait]
    impl LinkConfigurator for FailAt {
        async fn configure(&self, name: &str, _options: &LinkOptions) -> Result<(), DeviceError> {
            Err(DeviceError::Configuration {
                device: name.to_string(),
                step: self.0,
                message: "Operation not permitted".to_string(),
            })
        }
    }

    #[derive(Debug)]
    struct NoOp;

    #[async_trait]
    impl LinkConfigurator for NoOp {
        async fn configure(&self, _name: &str, _options: &LinkOptions) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn record_persist(events: &Events) -> impl FnOnce(&RecordingDevice) -> Result<(), DeviceError> {
        let events = events.clone();
        move |_| {
            events.lock().unwrap().push("persist");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_link_setup_closes_device() {
        let events = events();
        let device = RecordingDevice {
            events: events.clone(),
        };

        let err = configure_link(device, &FailAt("address"), &InterfaceConfig::default())
            .await
            .unwrap_err();

        assert_eq!(seen(&events), vec!["closed"]);
        assert_eq!(
            err.to_string(),
            "Failed to configure test0 (address): Operation not permitted"
        );
    }

    #[tokio::test]
    async fn test_successful_link_setup_returns_open_device() {
        let events = events();
        let device = RecordingDevice {
            events: events.clone(),
        };

        let iface = establish(device, &NoOp, &InterfaceConfig::default(), record_persist(&events))
            .await
            .unwrap();
        assert_eq!(iface.name(), "test0");
        assert!(seen(&events).is_empty());

        drop(iface);
        assert_eq!(seen(&events), vec!["closed"]);
    }

    #[tokio::test]
    async fn test_failed_setup_never_makes_device_persistent() {
        let events = events();
        let device = RecordingDevice {
            events: events.clone(),
        };
        let config = InterfaceConfig::default().with_persist(true);

        let err = establish(device, &FailAt("up"), &config, record_persist(&events))
            .await
            .unwrap_err();

        assert!(matches!(err, DeviceError::Configuration { step: "up", .. }));
        assert_eq!(seen(&events), vec!["closed"]);
    }

    #[tokio::test]
    async fn test_persist_runs_after_link_setup() {
        let events = events();
        let device = RecordingDevice {
            events: events.clone(),
        };
        let config = InterfaceConfig::default().with_persist(true);

        let iface = establish(device, &NoOp, &config, record_persist(&events))
            .await
            .unwrap();
        assert_eq!(seen(&events), vec!["persist"]);

        drop(iface);
        assert_eq!(seen(&events), vec!["persist", "closed"]);
    }

    #[tokio::test]
    async fn test_failed_persist_closes_device() {
        let events = events();
        let device = RecordingDevice {
            events: events.clone(),
        };
        let config = InterfaceConfig::default().with_persist(true);

        let result = establish(device, &NoOp, &config, |_| {
            Err(DeviceError::Configuration {
                device: "test0".to_string(),
                step: "persist",
                message: "Operation not permitted".to_string(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(seen(&events), vec!["closed"]);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config_before_touching_the_host() {
        let err = create(&InterfaceConfig::default().with_mtu(9000))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidConfig(_)));
    }
}
