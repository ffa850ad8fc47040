//! Length-prefixed frame codec.
//!
//! Both directions are pure functions of their input so they can be driven
//! from the event loop, the client, or tests without any hidden state.

use crate::error::{FrameError, InvalidFrame};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// Default maximum payload size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Decode result.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameDecodeResult<'a> {
    /// Need more bytes before a frame can be produced.
    Incomplete,
    /// A complete frame is at the front of the buffer.
    Frame {
        /// Payload bytes, borrowed from the input.
        payload: &'a [u8],
        /// Header plus payload length.
        consumed: usize,
    },
    /// Declared length exceeds the maximum. Nothing was consumed.
    Invalid(InvalidFrame),
}

/// Decode one frame from the front of `input`.
///
/// An oversized header is rejected as soon as its four bytes are present,
/// without waiting for the payload to arrive.
pub fn decode(input: &[u8], max_frame_size: usize) -> FrameDecodeResult<'_> {
    let Some(header) = input.get(..HEADER_LEN) else {
        return FrameDecodeResult::Incomplete;
    };

    let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if declared > max_frame_size {
        return FrameDecodeResult::Invalid(InvalidFrame {
            declared,
            max: max_frame_size,
        });
    }

    let consumed = HEADER_LEN + declared;
    match input.get(HEADER_LEN..consumed) {
        Some(payload) => FrameDecodeResult::Frame { payload, consumed },
        None => FrameDecodeResult::Incomplete,
    }
}

/// Encode `payload` into a fresh frame.
pub fn encode(payload: &[u8], max_frame_size: usize) -> Result<Bytes, FrameError> {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(payload, max_frame_size, &mut out)?;
    Ok(out.freeze())
}

/// Append the framed `payload` to `out`.
///
/// `out` is left untouched on error.
pub fn encode_into(
    payload: &[u8],
    max_frame_size: usize,
    out: &mut BytesMut,
) -> Result<(), FrameError> {
    // The wire prefix is 32 bits regardless of the configured maximum.
    if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: max_frame_size,
        });
    }
    out.reserve(HEADER_LEN + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    Ok(())
}
