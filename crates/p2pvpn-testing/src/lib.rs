//! p2pvpn-testing: test infrastructure for the tunnel.
//!
//! Provides:
//! - MemoryNetwork / MemoryHost: in-memory stream transport with failure injection
//! - FakeInterface: queue-backed virtual interface that needs no privileges

mod fake_interface;
mod memory;

pub use fake_interface::FakeInterface;
pub use memory::{MemoryHost, MemoryNetwork, MemoryStream, RecordingScope, StreamRecord};
