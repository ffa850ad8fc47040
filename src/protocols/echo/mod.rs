//! Echo protocol implementation.
//!
//! Every request frame is answered with a frame carrying the same payload.
//!
//! ## Protocol Format
//!
//! Binary length-prefixed framing, identical in both directions:
//!
//! ```text
//! byte 0..3  : big-endian u32 payload length N
//! byte 4..4+N: payload (opaque)
//!
//! Example:
//! Request:  00 00 00 04 'p' 'i' 'n' 'g'
//! Response: 00 00 00 04 'p' 'i' 'n' 'g'
//! ```
//!
//! A header declaring more than the configured maximum is a protocol
//! violation. The server closes the connection without a response and
//! discards anything still queued for that peer.

pub mod handler;
pub mod parser;

pub use handler::{Echo, Service};
pub use parser::{decode, encode, encode_into, FrameDecodeResult, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
