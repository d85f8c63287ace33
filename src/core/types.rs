use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// Device identifier carried in every packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Identifier used by the broadcast hello packet
    pub const BROADCAST: DeviceId = DeviceId(0xFFFF_FFFF);

    /// Returns the raw identifier
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        DeviceId(id)
    }
}

/// Size of a device token in bytes
pub const TOKEN_SIZE: usize = 16;

/// Shared secret token of a device
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub [u8; TOKEN_SIZE]);

impl Token {
    /// Returns the raw token bytes
    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }

    /// An all-zero token means the device withheld it
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Builds a token from a byte slice of exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TOKEN_SIZE] = bytes.try_into().ok()?;
        Some(Token(bytes))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// Tokens are secrets; keep them out of debug logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}..)", &hex::encode(&self.0[..2]))
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::config(format!("Invalid token {:?}: {}", s, e)))?;
        Token::from_slice(&bytes).ok_or_else(|| {
            Error::config(format!(
                "Invalid token {:?}: expected {} bytes, got {}",
                s,
                TOKEN_SIZE,
                bytes.len()
            ))
        })
    }
}

/// Device information returned by `miIO.info`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Firmware version
    #[serde(rename = "fw_ver", default)]
    pub firmware_version: String,
    /// Hardware version
    #[serde(rename = "hw_ver", default)]
    pub hardware_version: String,
    /// MAC address
    #[serde(rename = "mac", default)]
    pub mac_address: String,
    /// Product model, e.g. `yeelink.light.color1`
    #[serde(default)]
    pub model: String,
}

/// Configuration for the protocol engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Address hello packets are broadcast to
    pub broadcast_addr: SocketAddr,
    /// Local port to listen on, 0 lets the system pick one
    pub listen_port: u16,
    /// Per-attempt timeout for a call
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub call_timeout: Duration,
    /// Retries after the first attempt of a call
    pub max_retries: usize,
    /// Devices not seen for this long are expired on discovery
    #[serde(serialize_with = "super::serde::serialize_opt_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_opt_duration")]
    #[serde(default)]
    pub expire_after: Option<Duration>,
    /// Interval of the per-device property refresh
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub refresh_interval: Duration,
    /// Token file revealed tokens are persisted to
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                super::DEFAULT_PORT,
            )),
            listen_port: 0,
            call_timeout: super::DEFAULT_CALL_TIMEOUT,
            max_retries: super::DEFAULT_MAX_RETRIES,
            expire_after: None,
            refresh_interval: super::DEFAULT_REFRESH_INTERVAL,
            token_file: None,
        }
    }
}
