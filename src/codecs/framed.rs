use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::packet::{resynchronize, Packet};

/// Reads and writes framed [`Packet`]s.
///
/// Bad frames never end the stream: the decoder drops bytes up to the next
/// sync sequence and tries again.
#[derive(Debug, Default, Clone)]
pub struct PacketCodec {
    dropped: usize,
}

impl PacketCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many bytes have been discarded while resynchronising so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match Packet::parse(src) {
                Ok(maybe_packet) => return Ok(maybe_packet),
                Err(e) => {
                    let dropped = resynchronize(src);
                    self.dropped += dropped;
                    warn!(%e, %dropped, "Bad frame, resynchronizing");
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None => {
                if !buf.is_empty() {
                    debug!(bytes = buf.len(), "Stream ended inside a frame");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.serialize());
        Ok(())
    }
}
