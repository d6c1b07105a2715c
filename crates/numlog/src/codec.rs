//! Newline framing for the ingestion protocol.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Splits a byte stream into `\n`-terminated lines.
///
/// A single trailing `\r` before the terminator is stripped. A line is
/// delivered only once its terminator has been observed; whatever
/// unterminated fragment remains at stream end is discarded, not delivered.
/// Lines may be arbitrarily long. The scan position is carried between calls
/// so a long partial line is not rescanned on every new chunk.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// Bytes already scanned for a terminator in the current partial frame.
    scanned: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        match src[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.scanned + offset;
                let mut line = src.split_to(end + 1);
                self.scanned = 0;
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                // A fragment without its terminator is not a line.
                src.clear();
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}
