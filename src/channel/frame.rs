//! NUL-terminated framing for the channel socket.

use std::io::{self, BufRead, Write};

/// Result of reading one frame into a caller buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Bytes written to the buffer, terminator included
    pub len: usize,
    /// Payload bytes dropped because the buffer was too small
    pub dropped: usize,
}

impl Frame {
    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }
}

/// Read one frame, keeping at most `buf.len() - 1` payload bytes.
///
/// Surplus payload is consumed and discarded so the stream stays aligned on
/// frame boundaries. Returns `None` on a clean end of stream before any byte
/// of a new frame.
pub fn read_frame<R: BufRead + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<Frame>> {
    if buf.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame buffer must hold at least the terminator",
        ));
    }

    let capacity = buf.len() - 1;
    let mut written = 0;
    let mut dropped = 0;
    let mut started = false;

    loop {
        let chunk = match reader.fill_buf() {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if chunk.is_empty() {
            if !started {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside a frame",
            ));
        }
        started = true;

        let terminator = chunk.iter().position(|&b| b == 0);
        let body = &chunk[..terminator.unwrap_or(chunk.len())];
        let take = body.len().min(capacity - written);
        buf[written..written + take].copy_from_slice(&body[..take]);
        written += take;
        dropped += body.len() - take;

        let consumed = terminator.map(|pos| pos + 1).unwrap_or(chunk.len());
        reader.consume(consumed);

        if terminator.is_some() {
            buf[written] = 0;
            return Ok(Some(Frame {
                len: written + 1,
                dropped,
            }));
        }
    }
}

/// Write `payload` as one frame; a payload already ending in NUL is sent as is.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(payload)?;
    if payload.last() != Some(&0) {
        writer.write_all(&[0])?;
    }
    writer.flush()
}
