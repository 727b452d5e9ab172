//! Length-prefixed framing for the milter wire protocol.
//!
//! Every message in either direction is a 4-byte big-endian unsigned length
//! followed by exactly that many payload bytes. The decoder is a pure two
//! state machine with no I/O:
//! - `AwaitingLength`: accumulate 4 bytes, decode the payload length
//! - `AwaitingPayload`: accumulate `len` bytes, emit them as a frame
//!
//! Input may arrive in any chunking, from one byte at a time to many frames
//! per read. [`FrameDecoder::decode`] consumes at most one frame's worth of
//! input per call and reports how much it used, so callers can stop between
//! frames.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Size of the length prefix in bytes (sendmail's `MILTER_LEN_BYTES`).
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload the wire format can describe.
pub const MAX_WIRE_LEN: u64 = u32::MAX as u64;

/// Upper bound on speculative buffer reservation for a declared payload.
const MAX_RESERVE: usize = 64 * 1024;

/// Decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Collecting the 4-byte length prefix.
    AwaitingLength,
    /// Length decoded, collecting `len` payload bytes.
    AwaitingPayload { len: usize },
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    /// Bytes accumulated toward the current length prefix or payload.
    buffer: BytesMut,
    max_frame_len: u32,
}

impl FrameDecoder {
    /// Create a decoder that rejects length prefixes above `max_frame_len`.
    pub fn new(max_frame_len: u32) -> Self {
        Self {
            state: DecodeState::AwaitingLength,
            buffer: BytesMut::with_capacity(LENGTH_PREFIX_LEN),
            max_frame_len,
        }
    }

    /// Feed newly arrived bytes.
    ///
    /// Returns the completed frame, if any, and the number of bytes of
    /// `input` consumed. Unconsumed bytes (`&input[consumed..]`) belong to
    /// the next frame and must be fed again.
    ///
    /// A zero-length frame completes as soon as its length prefix does.
    pub fn decode(&mut self, input: &[u8]) -> Result<(Option<Bytes>, usize), FrameError> {
        match self.state {
            DecodeState::AwaitingLength => {
                let take = (LENGTH_PREFIX_LEN - self.buffer.len()).min(input.len());
                self.buffer.extend_from_slice(&input[..take]);
                if self.buffer.len() < LENGTH_PREFIX_LEN {
                    return Ok((None, take));
                }

                let mut prefix = [0u8; LENGTH_PREFIX_LEN];
                prefix.copy_from_slice(&self.buffer);
                let len = u32::from_be_bytes(prefix);
                self.buffer.clear();

                if len > self.max_frame_len {
                    return Err(FrameError::TooLarge {
                        len: u64::from(len),
                        max: u64::from(self.max_frame_len),
                    });
                }

                if len == 0 {
                    return Ok((Some(Bytes::new()), take));
                }

                let len = len as usize;
                self.buffer.reserve(len.min(MAX_RESERVE));
                self.state = DecodeState::AwaitingPayload { len };
                Ok((None, take))
            }

            DecodeState::AwaitingPayload { len } => {
                let take = (len - self.buffer.len()).min(input.len());
                self.buffer.extend_from_slice(&input[..take]);
                if self.buffer.len() < len {
                    return Ok((None, take));
                }

                let frame = self.buffer.split().freeze();
                self.state = DecodeState::AwaitingLength;
                Ok((Some(frame), take))
            }
        }
    }

    /// Current decoder state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Bytes held toward an incomplete length prefix or payload.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True when the decoder sits exactly on a frame boundary.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitingLength && self.buffer.is_empty()
    }
}

/// Append one frame (length prefix followed by `payload`) to `dst`.
///
/// The prefix and payload are written contiguously so a frame is never
/// interleaved with another on the same buffer.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len() as u64,
        max: MAX_WIRE_LEN,
    })?;
    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32(len);
    dst.extend_from_slice(payload);
    Ok(())
}
