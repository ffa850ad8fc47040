//! Protocol implementations.
//!
//! - `echo`: length-prefixed framing and the echo service driven by the
//!   runtime event loop and the client.

pub mod echo;
