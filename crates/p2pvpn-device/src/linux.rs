//! Linux TUN/TAP through /dev/net/tun

use crate::{DeviceError, InterfaceConfig, LinkMode, VirtualInterface};
use async_trait::async_trait;
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use tokio::io::unix::AsyncFd;
use tracing::debug;

const CLONE_DEVICE: &str = "/dev/net/tun";

// _IOW('T', n, int)
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const TUNSETOWNER: libc::c_ulong = 0x4004_54cc;
const TUNSETGROUP: libc::c_ulong = 0x4004_54ce;

const IFF_TUN: libc::c_short = 0x0001;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: Option<&str>, flags: libc::c_short) -> Self {
        let mut req = Self {
            name: [0; libc::IFNAMSIZ],
            flags,
            _pad: [0; 22],
        };
        if let Some(name) = name {
            for (dst, src) in req.name.iter_mut().zip(name.bytes().take(libc::IFNAMSIZ - 1)) {
                *dst = src as libc::c_char;
            }
        }
        req
    }

    fn name(&self) -> String {
        // The kernel always NUL-terminates the name it writes back.
        unsafe { CStr::from_ptr(self.name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

fn ioctl_value(file: &File, request: libc::c_ulong, value: libc::c_ulong) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, value) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Kernel TUN/TAP device opened without packet information headers
#[derive(Debug)]
pub struct LinuxInterface {
    fd: AsyncFd<File>,
    name: String,
    mode: LinkMode,
    mtu: u16,
}

impl LinuxInterface {
    /// Allocate the device described by `config`
    ///
    /// `config.persist` is not applied here; see [`Self::set_persist`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: &InterfaceConfig) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(CLONE_DEVICE)
            .map_err(|e| DeviceError::Create(format!("open {}: {}", CLONE_DEVICE, e)))?;

        let mut flags = IFF_NO_PI;
        flags |= match config.mode {
            LinkMode::Tun => IFF_TUN,
            LinkMode::Tap => IFF_TAP,
        };
        if config.multi_queue {
            flags |= IFF_MULTI_QUEUE;
        }

        let mut req = IfReq::new(config.name.as_deref(), flags);
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
        if rc < 0 {
            return Err(DeviceError::Create(format!(
                "TUNSETIFF: {}",
                io::Error::last_os_error()
            )));
        }
        let name = req.name();

        if let Some(owner) = config.owner {
            ioctl_value(&file, TUNSETOWNER, owner as libc::c_ulong)
                .map_err(|e| DeviceError::Create(format!("TUNSETOWNER on {}: {}", name, e)))?;
        }
        if let Some(group) = config.group {
            ioctl_value(&file, TUNSETGROUP, group as libc::c_ulong)
                .map_err(|e| DeviceError::Create(format!("TUNSETGROUP on {}: {}", name, e)))?;
        }

        debug!("Opened {} device {}", config.mode, name);

        Ok(Self {
            fd: AsyncFd::new(file)?,
            name,
            mode: config.mode,
            mtu: config.mtu,
        })
    }

    /// Keep the device in the kernel after its descriptor is closed
    pub fn set_persist(&self, persist: bool) -> Result<(), DeviceError> {
        ioctl_value(self.fd.get_ref(), TUNSETPERSIST, persist as libc::c_ulong).map_err(|e| {
            DeviceError::Configuration {
                device: self.name.clone(),
                step: "persist",
                message: e.to_string(),
            }
        })?;
        debug!("{} persist={}", self.name, persist);
        Ok(())
    }
}

#[async_trait]
impl VirtualInterface for LinuxInterface {
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(frame)
            }) {
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write to {}: {} of {} bytes", self.name, n, frame.len()),
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    fn is_link_layer(&self) -> bool {
        self.mode.is_link_layer()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}
