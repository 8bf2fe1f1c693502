// Stream framing. Encoded messages already carry their payload length in the
// header, so a frame on a byte stream is exactly one encoded message. The
// header is validated before the payload is read so a corrupt length prefix
// can never trigger a large allocation.

use std::io::{self, Read, Write};

use super::protocol::{HEADER_LEN, Message, PacketError, decode, encode, parse_header};
use super::transport::TransportError;

pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), TransportError> {
    let bytes = encode(message)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Blocks until one full frame is read. A clean EOF before the first header
/// byte is reported as `TransportError::Closed`.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, TransportError> {
    let mut frame = vec![0u8; HEADER_LEN];
    match reader.read_exact(&mut frame) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
        Err(e) => return Err(e.into()),
    }

    let len = parse_header(&frame)?;
    frame.resize(HEADER_LEN + len, 0);
    reader.read_exact(&mut frame[HEADER_LEN..])?;
    Ok(decode(&frame)?)
}

/// Reassembles frames from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete message, `Ok(None)` when more bytes are
    /// needed. After an error the stream is out of sync and must be closed.
    pub fn next_message(&mut self) -> Result<Option<Message>, PacketError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = parse_header(&self.buffer[..HEADER_LEN])?;
        let total = HEADER_LEN + len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        decode(&frame).map(Some)
    }
}
