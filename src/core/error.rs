use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use super::types::DeviceId;

/// Custom error types for the MiIO client
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed packet or RPC envelope
    #[error("Format error: {0}")]
    Format(String),

    /// Checksum mismatch, bad padding or a failed decrypt
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Max retries exceeded whilst sending request to device {dest} ({attempts} attempts)")]
    Timeout {
        /// Destination the request was sent to
        dest: SocketAddr,
        /// Number of send attempts made
        attempts: usize,
    },

    /// Error object returned by the device itself
    #[error("Device returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device {0} is unknown")]
    UnknownDevice(DeviceId),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Closed: {0}")]
    Closed(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new format error
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Creates a new crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        Error::Publish(msg.into())
    }

    /// Creates a new closed error
    pub fn closed(msg: impl Into<String>) -> Self {
        Error::Closed(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Format(format!("JSON envelope: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::crypto("bad padding");
        assert!(matches!(err, Error::Crypto(_)));
        assert_eq!(err.to_string(), "Crypto error: bad padding");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_timeout_names_destination() {
        let err = Error::Timeout {
            dest: "10.0.0.7:54321".parse().unwrap(),
            attempts: 3,
        };
        assert!(err.to_string().contains("10.0.0.7:54321"));
    }
}
