use bytes::BytesMut;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::Packet;
use crate::core::Error;

/// Datagram codec for MiIO packets
///
/// Each call to `decode` consumes the whole buffer: one datagram is one
/// packet, so a malformed datagram is dropped rather than retried.
#[derive(Clone, Debug, Default)]
pub struct PacketCodec;

impl PacketCodec {
    /// Creates a new packet codec
    pub fn new() -> Self {
        PacketCodec
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split();
        let mut packet = Packet::deserialize(&datagram)?;
        packet.meta.decoded_at = Instant::now();
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DeviceId;
    use bytes::Bytes;

    #[test]
    fn test_codec_hello_packet() {
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::new();

        codec.encode(Packet::hello(), &mut bytes).unwrap();
        let decoded = codec.decode(&mut bytes).unwrap().expect("one packet");

        assert!(decoded.is_discovery());
        assert_eq!(decoded.header.device_id, DeviceId::BROADCAST);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_codec_consumes_malformed_datagram() {
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::from(&b"garbage"[..]);

        assert!(codec.decode(&mut bytes).is_err());
        assert!(bytes.is_empty());
        assert!(codec.decode(&mut bytes).unwrap().is_none());
    }

    #[test]
    fn test_codec_data_packet() {
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::new();
        let pkt = Packet::new(DeviceId(77), [1; 16], 3, Bytes::from_static(&[9; 32])).unwrap();

        codec.encode(pkt.clone(), &mut bytes).unwrap();
        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded.header, pkt.header);
        assert_eq!(decoded.payload.len(), 32);
    }
}
