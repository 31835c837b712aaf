use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Splits a byte stream on a delimiter.
///
/// The delimiter and a trailing `\r` are not part of the yielded lines.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far we have looked for a delimiter into the buffer
    cursor: usize,

    /// How to delimit incoming byte streams.
    delimiter: u8,

    /// Longest line accepted before giving up on the stream.
    max_length: usize,
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(delimiter: u8, max_length: usize) -> Self {
        Self {
            cursor: 0,
            delimiter,
            max_length,
        }
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', 64 * 1024)
    }
}

impl Decoder for LinesCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        let look_at = &src[self.cursor..read_to];

        if let Some(position) = look_at.iter().position(|&byte| byte == self.delimiter) {
            // The search may have started at the cursor, not the start of the buffer.
            let actual_position = self.cursor + position;
            self.cursor = 0;

            let mut line = src.split_to(actual_position);
            src.advance(1);

            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            Ok(Some(line))
        } else if read_to > self.max_length {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line longer than {} bytes", self.max_length),
            ))
        } else {
            // No need to look at these bytes again when more arrive.
            self.cursor = read_to;
            Ok(None)
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None if buf.is_empty() => Ok(None),
            None => {
                // An unterminated last line still counts.
                self.cursor = 0;
                let mut line = buf.split();
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Ok(Some(line))
            }
        }
    }
}
