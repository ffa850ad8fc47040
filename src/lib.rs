//! framed-echo: a single-threaded, readiness-driven TCP echo service.
//!
//! Messages on the wire are length-prefixed frames (4-byte big-endian length,
//! then payload). The server echoes every frame back on the same connection.
//!
//! Features:
//! - mio-based multiplexer (epoll on Linux, kqueue on macOS)
//! - Partial read and write handling across poll cycles
//! - Per-connection outbound cap, idle timeout and accept fairness limit
//! - Graceful shutdown with a bounded drain period
//! - Matching async client

pub mod client;
pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;
