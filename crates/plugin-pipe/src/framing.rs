//! Length-prefixed framing.
//!
//! All lengths use big-endian byte order.

use crate::error::{PipeError, PipeResult};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a reader accepts unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a payload as one framed unit (length prefix included).
pub fn encode_frame(payload: &[u8]) -> PipeResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| PipeError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read a length-prefixed frame from a buffer.
///
/// Returns `None` if there isn't enough data for a complete frame.
/// Returns `Some((frame_data, consumed))` with the frame data (excluding length prefix)
/// and the total bytes consumed.
pub fn read_frame(buf: &[u8]) -> Option<(&[u8], usize)> {
    let len = declared_len(buf)?;

    if buf.len() < LENGTH_PREFIX_LEN + len {
        return None;
    }

    Some((
        &buf[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len],
        LENGTH_PREFIX_LEN + len,
    ))
}

fn declared_len(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_LEN] = buf.get(..LENGTH_PREFIX_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Reassembles framed units from bytes that arrive in arbitrary pieces.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a whole frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete payload, if one is buffered.
    ///
    /// A header declaring more than the configured maximum is an error; the
    /// stream cannot be resynchronized after it.
    pub fn next_frame(&mut self) -> PipeResult<Option<Vec<u8>>> {
        if let Some(len) = declared_len(&self.buf) {
            if len > self.max_frame_len {
                return Err(PipeError::FrameTooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }
        }

        let Some((frame, consumed)) = read_frame(&self.buf) else {
            return Ok(None);
        };
        let frame = frame.to_vec();
        self.buf.drain(..consumed);
        Ok(Some(frame))
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
