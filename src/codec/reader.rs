//! Framed reader: read one complete framed message from a stream,
//! growing a per-connection buffer under a hard cap.

use std::io::Read;

use memchr::memmem;

use crate::codec::{ParseOutcome, MAX_BUF};
use crate::error::{ProtocolError, ReadFrameError};

const INITIAL_CAPACITY: usize = 4096;

/// A per-connection read buffer, doubled on demand up to [`MAX_BUF`].
///
/// Owned exclusively by the session's current worker: no lock is
/// needed to use it, as long as only one worker ever touches a given
/// session's buffer at a time, which the hand-off queue design
/// guarantees.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// A fresh, empty buffer.
    pub fn new() -> Self {
        FrameBuffer {
            data: vec![0; INITIAL_CAPACITY],
            filled: 0,
        }
    }

    fn filled_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Drop the first `n` bytes (a fully parsed frame) from the buffer,
    /// shifting any trailing bytes (the start of the next frame) down.
    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.filled);
        self.data.copy_within(n..self.filled, 0);
        self.filled -= n;
    }

    fn grow(&mut self) -> Result<(), ReadFrameError> {
        if self.data.len() >= MAX_BUF {
            return Err(ReadFrameError::BufferCapExceeded);
        }
        let new_cap = (self.data.len() * 2).min(MAX_BUF);
        self.data.resize(new_cap, 0);
        Ok(())
    }

    /// Only attempt a parse once the buffer plausibly holds a full frame
    /// (ends in `CR LF`, and an earlier `CR LF` exists before the last
    /// two bytes).
    fn looks_complete(&self) -> bool {
        let buf = self.filled_slice();
        if buf.len() < 4 {
            return false;
        }
        if &buf[buf.len() - 2..] != b"\r\n" {
            return false;
        }
        memmem::find(&buf[..buf.len() - 2], b"\r\n").is_some()
    }
}

/// Read one complete framed message of type `T` from `socket` into `buf`,
/// using `parse` to recognize a complete frame. The buffer is reused
/// across frames on the same session (trailing bytes belonging to the
/// next frame are preserved) but is never shared between sessions.
pub fn read_framed<R, T>(
    socket: &mut R,
    buf: &mut FrameBuffer,
    parse: impl Fn(&[u8]) -> Result<ParseOutcome<T>, ProtocolError>,
) -> Result<T, ReadFrameError>
where
    R: Read,
{
    loop {
        if buf.looks_complete() {
            match parse(buf.filled_slice()) {
                Ok(ParseOutcome::Complete(value, consumed)) => {
                    buf.consume(consumed);
                    return Ok(value);
                }
                Ok(ParseOutcome::Incomplete) => {}
                Err(ProtocolError::Syntax(msg)) => return Err(ReadFrameError::Syntax(msg)),
                Err(ProtocolError::BufferCapExceeded) => return Err(ReadFrameError::BufferCapExceeded),
                Err(ProtocolError::OutOfMemory) => return Err(ReadFrameError::OutOfMemory),
            }
        }

        if buf.filled == buf.data.len() {
            buf.grow()?;
        }

        let n = socket.read(&mut buf.data[buf.filled..])?;
        if n == 0 {
            return Err(ReadFrameError::ConnectionClosed);
        }
        buf.filled += n;
    }
}
