//! MiIO: client for the Xiaomi MiIO UDP device-control protocol
//!
//! This library discovers devices on the local network, resolves their
//! tokens, encrypts JSON-RPC calls to them and correlates the responses.
//! Discovered devices are classified into products with light and power
//! capabilities.

pub mod client;
pub mod core;
pub mod device;
pub mod event;
pub mod network;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used items
pub use crate::client::Client;
pub use crate::core::{DeviceId, DeviceInfo, Error, ProtocolConfig, Result, Token};
pub use crate::device::{Device, Light, Power, PowerState, Product, Rgb};
pub use crate::event::{Event, Subscription};
pub use crate::network::Protocol;
pub use crate::protocol::TokenStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
