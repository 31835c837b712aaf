use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::packet::{Packet, PacketType};

/// Wraps whatever was read into packets of a fixed type, no framing involved.
#[derive(Debug, Clone, Copy)]
pub struct RawCodec {
    packet_type: PacketType,
}

impl RawCodec {
    /// Create a codec producing packets of the given type.
    pub fn new(packet_type: PacketType) -> Self {
        Self { packet_type }
    }
}

impl Decoder for RawCodec {
    type Item = Vec<Packet>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        Ok(Some(Packet::create(src.split().freeze(), self.packet_type)))
    }
}
