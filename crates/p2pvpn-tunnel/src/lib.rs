//! Point-to-point frame tunnel over authenticated streams
//!
//! A [`TunnelService`] owns one virtual interface and one authorized peer.
//! Frames read from the device are written, length-prefixed, onto a single
//! outbound stream to that peer; frames arriving on inbound streams from that
//! peer are written back into the device.
//!
//! ```text
//!   device ──read──> OutboundRelay ──[len|frame]──> outbound stream ──> peer
//!   device <─write── handle_inbound <─[len|frame]── inbound stream  <── peer
//! ```

pub mod error;
pub mod inbound;
pub mod outbound;
pub mod service;
pub mod stats;

pub use error::VpnError;
pub use inbound::handle_inbound;
pub use outbound::OutboundRelay;
pub use service::TunnelService;
pub use stats::{RelayStats, StatsSnapshot};
