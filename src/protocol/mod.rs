//! Protocol implementation module
//!
//! This module defines the MiIO packet format, its datagram codec, the
//! per-device cryptography, the JSON-RPC envelope and the token store.

pub mod codec;
pub mod crypto;
pub mod message;
pub mod packet;
pub mod tokens;

pub use self::codec::PacketCodec;
pub use self::crypto::Crypto;
pub use self::message::{Request, Response, RpcError};
pub use self::packet::{Header, Packet, PacketMeta, HEADER_LEN, MAGIC};
pub use self::tokens::TokenStore;
