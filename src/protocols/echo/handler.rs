//! Echo service: every decoded payload is answered with itself.

use bytes::Bytes;

/// Request/response hook invoked by the event loop for each decoded frame.
///
/// Returning `None` sends nothing back for that frame.
pub trait Service {
    fn call(&mut self, request: Bytes) -> Option<Bytes>;
}

/// Echoes each payload back unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Service for Echo {
    fn call(&mut self, request: Bytes) -> Option<Bytes> {
        Some(request)
    }
}
