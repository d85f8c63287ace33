//! Core types and traits for the MiIO client
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod serde;
pub mod types;

use std::time::Duration;

pub use self::error::{Error, Result};
pub use self::types::{DeviceId, DeviceInfo, ProtocolConfig, Token, TOKEN_SIZE};

/// UDP port devices listen on
pub const DEFAULT_PORT: u16 = 54321;

/// Default per-attempt timeout of a call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(200);

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: usize = 10;

/// Default interval of the per-device property refresh
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
