//! Networking module
//!
//! This module owns the UDP socket, the per-device outbound transports and
//! the protocol orchestrator that dispatches inbound packets.

mod connection;
mod outbound;
mod protocol;

pub use self::connection::{bind_socket, Connection, PacketSink};
pub use self::outbound::Outbound;
pub use self::protocol::{DeviceFactory, Protocol};
