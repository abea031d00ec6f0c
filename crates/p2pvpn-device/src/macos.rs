//! macOS utun devices via the `tun` crate

use crate::{DeviceError, InterfaceConfig, LinkMode, VirtualInterface};
use async_trait::async_trait;
use std::io;
use tracing::debug;
use tun::{AbstractDevice, AsyncDevice, Configuration};

/// utun device; the kernel only offers network-layer (TUN) semantics
pub struct MacosInterface {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl MacosInterface {
    pub fn open(config: &InterfaceConfig) -> Result<Self, DeviceError> {
        if config.mode == LinkMode::Tap {
            return Err(DeviceError::UnsupportedMode(LinkMode::Tap));
        }

        let mut tun_config = Configuration::default();
        if let Some(name) = &config.name {
            tun_config.tun_name(name);
        }
        tun_config.layer(tun::Layer::L3);

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| DeviceError::Create(format!("failed to create utun device: {}", e)))?;

        let name = device
            .tun_name()
            .map_err(|e| DeviceError::Create(format!("failed to get utun name: {}", e)))?;

        debug!("Opened utun device {}", name);

        Ok(Self {
            device,
            name,
            mtu: config.mtu,
        })
    }
}

impl std::fmt::Debug for MacosInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacosInterface")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .finish()
    }
}

#[async_trait]
impl VirtualInterface for MacosInterface {
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.device.send(frame).await?;
        Ok(())
    }

    fn is_link_layer(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}
