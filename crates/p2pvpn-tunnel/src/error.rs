//! Tunnel error taxonomy

use p2pvpn_device::DeviceError;
use p2pvpn_proto::FrameError;
use p2pvpn_transport::{PeerId, TransportError};
use std::io;
use thiserror::Error;

/// Errors raised while setting up or relaying a tunnel
///
/// Only `Configuration` and a device read failure in the outbound loop are
/// fatal to the service; everything else ends a single stream.
#[derive(Debug, Error)]
pub enum VpnError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] DeviceError),

    #[error("Unauthorized peer {actual} (expected {expected})")]
    Authorization { expected: PeerId, actual: PeerId },

    #[error("Framing error: {0}")]
    Framing(FrameError),

    #[error("Device IO error on {device}: {source}")]
    DeviceIo {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("Stream IO error: {0}")]
    StreamIo(#[from] TransportError),

    #[error("Outbound relay to {0} is already running")]
    AlreadyServing(PeerId),
}

impl VpnError {
    pub(crate) fn device_io(device: &str, source: io::Error) -> Self {
        VpnError::DeviceIo {
            device: device.to_string(),
            source,
        }
    }
}

impl From<FrameError> for VpnError {
    fn from(err: FrameError) -> Self {
        match err {
            // A failed read underneath the codec is the transport's fault.
            FrameError::Io(e) => VpnError::StreamIo(TransportError::IoError(e)),
            other => VpnError::Framing(other),
        }
    }
}
