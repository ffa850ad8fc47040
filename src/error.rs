//! Error types shared across the runtime, framer and client.
//!
//! `WouldBlock` is deliberately absent: it is a scheduling signal, surfaced as
//! `WriteOutcome::WouldBlock` or by ending a read loop, never as an error.

use crate::runtime::Handle;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failures of the readiness multiplexer.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    /// Handle is unknown, already retired, or the source is already registered.
    #[error("invalid multiplexer handle {0}")]
    InvalidHandle(Handle),
    /// Operation attempted after the multiplexer was torn down.
    #[error("multiplexer is closed")]
    Closed,
    /// The OS readiness primitive failed.
    #[error("multiplexer I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A frame header declared more payload than the configured maximum.
///
/// This is a protocol violation: the connection must be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("declared frame length {declared} exceeds maximum {max}")]
pub struct InvalidFrame {
    pub declared: usize,
    pub max: usize,
}

/// Encode-time framing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds maximum frame size {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Reasons the dispatcher forces a connection straight to `Closed`.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] InvalidFrame),
    #[error("outbound queue overflow: {queued} + {incoming} bytes exceeds {limit}")]
    QueueOverflow {
        queued: usize,
        incoming: usize,
        limit: usize,
    },
    #[error("peer closed the connection during write")]
    PeerClosed,
    #[error("idle for longer than the configured timeout")]
    Idle,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),
}

/// Errors that stop the server as a whole.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{0}'")]
    Address(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors returned by the one-shot client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request rejected: {0}")]
    Frame(#[from] FrameError),
    #[error("response rejected: {0}")]
    Protocol(#[from] InvalidFrame),
    #[error("server closed the connection before a full response arrived")]
    UnexpectedEof,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}
