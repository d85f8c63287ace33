//! MiIO packet layout
//!
//! ```text
//! 0       2       4               8               12              16
//! +-------+-------+---------------+---------------+---------------+
//! | magic | length|   reserved    |   device id   |     stamp     |
//! +-------+-------+---------------+---------------+---------------+
//! |                      checksum (16 bytes)                      |
//! +---------------------------------------------------------------+
//! |                     payload (length - 32)                     |
//! +---------------------------------------------------------------+
//! ```
//!
//! All fields are big-endian.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use crate::core::{DeviceId, Error, Result, TOKEN_SIZE};

/// Marker found in the first two bytes of every packet
pub const MAGIC: u16 = 0x2131;

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 32;

/// Size of the checksum field
pub const CHECKSUM_LEN: usize = TOKEN_SIZE;

/// Offset of the checksum field within the header
pub const CHECKSUM_OFFSET: usize = 16;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - HEADER_LEN;

/// Fixed-width packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Magic/version marker
    pub magic: u16,
    /// Total packet length, header included
    pub length: u16,
    /// Reserved field, zero on data packets
    pub reserved: u32,
    /// Device the packet belongs to
    pub device_id: DeviceId,
    /// Replay counter
    pub stamp: u32,
    /// MD5 checksum, or the device token on a hello response
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Header {
    /// Writes the header in wire order
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u16(self.magic);
        dst.put_u16(self.length);
        dst.put_u32(self.reserved);
        dst.put_u32(self.device_id.0);
        dst.put_u32(self.stamp);
        dst.put_slice(&self.checksum);
    }

    fn decode(mut src: &[u8]) -> Self {
        let magic = src.get_u16();
        let length = src.get_u16();
        let reserved = src.get_u32();
        let device_id = DeviceId(src.get_u32());
        let stamp = src.get_u32();
        let mut checksum = [0u8; CHECKSUM_LEN];
        src.copy_to_slice(&mut checksum);
        Header {
            magic,
            length,
            reserved,
            device_id,
            stamp,
            checksum,
        }
    }
}

/// Metadata attached to a packet on receipt
#[derive(Debug, Clone)]
pub struct PacketMeta {
    /// Source address of the datagram
    pub addr: Option<SocketAddr>,
    /// When the packet was decoded
    pub decoded_at: Instant,
}

impl Default for PacketMeta {
    fn default() -> Self {
        PacketMeta {
            addr: None,
            decoded_at: Instant::now(),
        }
    }
}

/// A header plus its opaque payload
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
    pub meta: PacketMeta,
}

impl Packet {
    /// Builds a data packet; the length field is derived from the payload
    pub fn new(
        device_id: DeviceId,
        checksum: [u8; CHECKSUM_LEN],
        stamp: u32,
        payload: Bytes,
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::format(format!(
                "Payload of {} bytes exceeds the maximum of {}",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        Ok(Packet {
            header: Header {
                magic: MAGIC,
                length: (HEADER_LEN + payload.len()) as u16,
                reserved: 0,
                device_id,
                stamp,
                checksum,
            },
            payload,
            meta: PacketMeta::default(),
        })
    }

    /// The broadcast hello packet: every field after the length is 0xFF
    pub fn hello() -> Self {
        Packet {
            header: Header {
                magic: MAGIC,
                length: HEADER_LEN as u16,
                reserved: 0xFFFF_FFFF,
                device_id: DeviceId::BROADCAST,
                stamp: 0xFFFF_FFFF,
                checksum: [0xFF; CHECKSUM_LEN],
            },
            payload: Bytes::new(),
            meta: PacketMeta::default(),
        }
    }

    /// Payload length as declared by the header
    pub fn data_len(&self) -> usize {
        (self.header.length as usize).saturating_sub(HEADER_LEN)
    }

    /// A header-only packet is a discovery hello or its response
    pub fn is_discovery(&self) -> bool {
        self.data_len() == 0
    }

    /// The device withheld its token
    pub fn has_zero_checksum(&self) -> bool {
        self.header.checksum.iter().all(|&b| b == 0)
    }

    /// Writes header and payload into `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        self.header.encode(dst);
        dst.extend_from_slice(&self.payload);
    }

    /// Serializes into a fresh buffer
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parses one datagram
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::format(format!(
                "Packet of {} bytes is shorter than the {} byte header",
                buf.len(),
                HEADER_LEN
            )));
        }

        let header = Header::decode(&buf[..HEADER_LEN]);
        if header.magic != MAGIC {
            return Err(Error::format(format!("Bad magic 0x{:04x}", header.magic)));
        }
        if header.length as usize != buf.len() {
            return Err(Error::format(format!(
                "Declared length {} does not match the {} bytes received",
                header.length,
                buf.len()
            )));
        }

        Ok(Packet {
            header,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
            meta: PacketMeta::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_format() {
        let bytes = Packet::hello().serialize();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..4], &[0x21, 0x31, 0x00, 0x20]);
        assert!(bytes[4..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_serialize_deserialize() {
        let pkt = Packet::new(
            DeviceId(0x0102_0304),
            [7u8; CHECKSUM_LEN],
            42,
            Bytes::from_static(b"0123456789abcdef"),
        )
        .unwrap();

        let bytes = pkt.serialize();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[2..4], &[0x00, 0x30]);
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);

        let decoded = Packet::deserialize(&bytes).unwrap();
        assert_eq!(decoded.header, pkt.header);
        assert_eq!(decoded.payload, pkt.payload);
        assert_eq!(decoded.data_len(), 16);
        assert!(!decoded.is_discovery());
    }

    #[test]
    fn test_short_buffer() {
        let err = Packet::deserialize(&[0x21, 0x31, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_length_mismatch() {
        let pkt = Packet::new(DeviceId(1), [0; CHECKSUM_LEN], 1, Bytes::from_static(b"abcd")).unwrap();
        let bytes = pkt.serialize();

        let err = Packet::deserialize(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        let mut longer = bytes.to_vec();
        longer.push(0);
        assert!(Packet::deserialize(&longer).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Packet::hello().serialize().to_vec();
        bytes[0] = 0x00;
        assert!(matches!(Packet::deserialize(&bytes), Err(Error::Format(_))));
    }

    #[test]
    fn test_zero_checksum_discovery() {
        let pkt = Packet::new(DeviceId(5), [0; CHECKSUM_LEN], 9, Bytes::new()).unwrap();
        assert!(pkt.is_discovery());
        assert!(pkt.has_zero_checksum());
        assert!(!Packet::hello().has_zero_checksum());
    }

    #[test]
    fn test_oversized_payload() {
        let payload = Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(Packet::new(DeviceId(1), [0; CHECKSUM_LEN], 0, payload).is_err());
    }
}
