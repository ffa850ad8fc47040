//! Per-connection state for the event loop.
//!
//! A `Connection` is a passive record: the event loop owns it, performs the
//! socket syscalls and calls into it to buffer input, extract frames, queue
//! output and drain that output into a writer.

use crate::error::{ConnectionError, InvalidFrame};
use crate::protocols::echo::parser::{self, FrameDecodeResult, HEADER_LEN};
use crate::runtime::Handle;
use bytes::{Buf, Bytes, BytesMut};
use mio::Interest;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Lifecycle stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading and writing.
    Open,
    /// Peer sent EOF. No more reads; queued output is still written.
    HalfClosed,
    /// Local shutdown requested. No more reads; flush then close.
    Draining,
    /// Terminal.
    Closed,
}

/// Result of one `drain_writable` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Outbound queue is empty.
    FullyDrained,
    /// Stopped early (short write or budget spent) with this many bytes left.
    /// The sink did not report blocking, so the caller should retry soon.
    PartiallyDrained(usize),
    /// The sink refused more bytes; wait for the next writable event.
    WouldBlock,
    /// The peer is gone.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    read_buf: BytesMut,
    /// Fully framed messages, front partially written.
    outbound: VecDeque<Bytes>,
    queued_bytes: usize,
    /// Outbound cap in bytes. Zero disables the cap.
    max_queued_bytes: usize,
    half_closed: bool,
    closing: bool,
    closed: bool,
    /// Interest currently registered with the multiplexer.
    interest: Option<Interest>,
    last_activity: Instant,
}

impl Connection {
    /// Create a new open connection.
    pub fn new(peer: SocketAddr, max_queued_bytes: usize, now: Instant) -> Self {
        Self {
            peer,
            read_buf: BytesMut::new(),
            outbound: VecDeque::new(),
            queued_bytes: 0,
            max_queued_bytes,
            half_closed: false,
            closing: false,
            closed: false,
            interest: None,
            last_activity: now,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        if self.closed {
            ConnState::Closed
        } else if self.closing {
            ConnState::Draining
        } else if self.half_closed {
            ConnState::HalfClosed
        } else {
            ConnState::Open
        }
    }

    /// Append received bytes. Frame size limits are enforced on extraction.
    pub fn append_read_bytes(&mut self, bytes: &[u8]) -> usize {
        self.read_buf.extend_from_slice(bytes);
        bytes.len()
    }

    /// Bytes received but not yet part of an extracted frame.
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Pop the next complete frame payload off the read buffer.
    ///
    /// On `Err` the buffer is left untouched; the caller must close.
    pub fn try_extract_frame(&mut self, max_frame_size: usize) -> Result<Option<Bytes>, InvalidFrame> {
        let consumed = match parser::decode(&self.read_buf, max_frame_size) {
            FrameDecodeResult::Incomplete => return Ok(None),
            FrameDecodeResult::Frame { consumed, .. } => consumed,
            FrameDecodeResult::Invalid(invalid) => return Err(invalid),
        };

        let mut frame = self.read_buf.split_to(consumed);
        frame.advance(HEADER_LEN);
        Ok(Some(frame.freeze()))
    }

    /// Queue an already framed message for writing.
    pub fn enqueue_write(&mut self, bytes: Bytes) -> Result<(), ConnectionError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.max_queued_bytes > 0 && self.queued_bytes + bytes.len() > self.max_queued_bytes {
            return Err(ConnectionError::QueueOverflow {
                queued: self.queued_bytes,
                incoming: bytes.len(),
                limit: self.max_queued_bytes,
            });
        }
        self.queued_bytes += bytes.len();
        self.outbound.push_back(bytes);
        Ok(())
    }

    /// Bytes queued and not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Write queued bytes into `sink` until the queue empties, the sink
    /// blocks, or `budget` bytes have been written.
    pub fn drain_writable<W>(&mut self, sink: &mut W, budget: Option<usize>) -> io::Result<WriteOutcome>
    where
        W: Write + ?Sized,
    {
        let mut budget = budget.unwrap_or(usize::MAX);

        while let Some(front) = self.outbound.front_mut() {
            if budget == 0 {
                return Ok(WriteOutcome::PartiallyDrained(self.queued_bytes));
            }

            let want = front.len().min(budget);
            match sink.write(&front[..want]) {
                Ok(0) => return Ok(WriteOutcome::Closed),
                Ok(n) => {
                    front.advance(n);
                    if front.is_empty() {
                        self.outbound.pop_front();
                    }
                    self.queued_bytes -= n;
                    budget -= n;

                    if n < want {
                        return Ok(WriteOutcome::PartiallyDrained(self.queued_bytes));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::WouldBlock);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    return Ok(WriteOutcome::Closed);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(WriteOutcome::FullyDrained)
    }

    /// Drop everything queued for the peer.
    pub fn discard_output(&mut self) {
        self.outbound.clear();
        self.queued_bytes = 0;
    }

    /// Peer sent EOF.
    pub fn mark_half_closed(&mut self) {
        self.half_closed = true;
    }

    /// Local shutdown requested.
    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Whether further reads should be attempted.
    pub fn wants_read(&self) -> bool {
        !self.half_closed && !self.closing && !self.closed
    }

    /// No more input expected and nothing left to write.
    pub fn is_finished(&self) -> bool {
        (self.half_closed || self.closing) && self.outbound.is_empty()
    }

    /// Interest this connection should have registered right now.
    ///
    /// Writable tracks "queue non-empty"; readable is dropped once reads stop.
    pub fn desired_interest(&self) -> Option<Interest> {
        match (self.wants_read(), self.has_pending_output()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Interest last registered with the multiplexer.
    pub fn interest(&self) -> Option<Interest> {
        self.interest
    }

    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = Some(interest);
    }

    /// Record I/O progress.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Table of live connections keyed by their multiplexer handle.
///
/// Holds whatever per-connection entry the event loop needs (socket plus
/// `Connection`). Capacity is enforced on insert.
pub struct ConnectionRegistry<T> {
    connections: HashMap<Handle, T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Whether another connection can be admitted.
    pub fn has_capacity(&self) -> bool {
        self.connections.len() < self.max_connections
    }

    /// Insert a connection under its handle.
    ///
    /// Returns the entry back if the registry is at capacity.
    pub fn insert(&mut self, handle: Handle, entry: T) -> Result<(), T> {
        if !self.has_capacity() {
            return Err(entry);
        }
        self.connections.insert(handle, entry);
        Ok(())
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.connections.get(&handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.connections.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.connections.remove(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.connections.contains_key(&handle)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Handles of all live connections, in no particular order.
    pub fn handles(&self) -> Vec<Handle> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.connections.iter().map(|(h, t)| (*h, t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::echo::parser::encode;

    const MAX: usize = 1024;

    fn conn() -> Connection {
        Connection::new("127.0.0.1:9".parse().unwrap(), 0, Instant::now())
    }

    /// Accepts one byte per call, then reports `WouldBlock` on the next call.
    struct Trickle {
        out: Vec<u8>,
        blocked: bool,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.blocked {
                self.blocked = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.blocked = true;
            self.out.push(buf[0]);
            Ok(1)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Gone;

    impl Write for Gone {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_connection_state_transitions() {
        let mut c = conn();
        assert_eq!(c.state(), ConnState::Open);
        assert_eq!(c.desired_interest(), Some(Interest::READABLE));

        c.mark_half_closed();
        assert_eq!(c.state(), ConnState::HalfClosed);
        assert!(!c.wants_read());
        assert!(c.is_finished());

        c.mark_closing();
        assert_eq!(c.state(), ConnState::Draining);

        c.mark_closed();
        assert_eq!(c.state(), ConnState::Closed);
    }

    #[test]
    fn test_extract_frames_across_appends() {
        let mut c = conn();
        let frame = encode(b"hello", MAX).unwrap();

        assert_eq!(c.append_read_bytes(&frame[..3]), 3);
        assert_eq!(c.try_extract_frame(MAX), Ok(None));

        c.append_read_bytes(&frame[3..]);
        c.append_read_bytes(&frame[..2]);
        assert_eq!(c.try_extract_frame(MAX), Ok(Some(Bytes::from_static(b"hello"))));
        assert_eq!(c.try_extract_frame(MAX), Ok(None));
        assert_eq!(c.buffered(), 2);
    }

    #[test]
    fn test_extract_invalid_leaves_buffer() {
        let mut c = conn();
        c.append_read_bytes(&((MAX + 1) as u32).to_be_bytes());
        assert!(c.try_extract_frame(MAX).is_err());
        assert_eq!(c.buffered(), 4);
    }

    #[test]
    fn test_writable_interest_tracks_queue() {
        let mut c = conn();
        c.enqueue_write(encode(b"x", MAX).unwrap()).unwrap();
        assert_eq!(
            c.desired_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        let mut out = Vec::new();
        assert_eq!(c.drain_writable(&mut out, None).unwrap(), WriteOutcome::FullyDrained);
        assert_eq!(out, b"\x00\x00\x00\x01x");
        assert_eq!(c.desired_interest(), Some(Interest::READABLE));

        c.mark_half_closed();
        c.enqueue_write(encode(b"y", MAX).unwrap()).unwrap();
        assert_eq!(c.desired_interest(), Some(Interest::WRITABLE));
    }

    #[test]
    fn test_one_byte_writer_drains_over_many_passes() {
        let mut c = conn();
        let frame = encode(b"ping", MAX).unwrap();
        c.enqueue_write(frame.clone()).unwrap();

        let mut sink = Trickle {
            out: Vec::new(),
            blocked: false,
        };
        let mut passes = 0;
        loop {
            passes += 1;
            match c.drain_writable(&mut sink, None).unwrap() {
                WriteOutcome::FullyDrained => break,
                WriteOutcome::WouldBlock | WriteOutcome::PartiallyDrained(_) => {
                    assert!(c.has_pending_output());
                    assert!(c.desired_interest().unwrap().is_writable());
                }
                WriteOutcome::Closed => panic!("unexpected close"),
            }
        }

        assert_eq!(sink.out, frame.to_vec());
        assert!(passes > frame.len());
        assert_eq!(c.queued_bytes(), 0);
    }

    #[test]
    fn test_budget_limits_bytes_per_pass() {
        let mut c = conn();
        c.enqueue_write(encode(b"abc", MAX).unwrap()).unwrap();

        let mut out = Vec::new();
        assert_eq!(
            c.drain_writable(&mut out, Some(1)).unwrap(),
            WriteOutcome::PartiallyDrained(6)
        );
        assert_eq!(out.len(), 1);
        assert_eq!(
            c.drain_writable(&mut out, Some(100)).unwrap(),
            WriteOutcome::FullyDrained
        );
        assert_eq!(out, b"\x00\x00\x00\x03abc");
    }

    #[test]
    fn test_broken_pipe_reports_closed() {
        let mut c = conn();
        c.enqueue_write(encode(b"x", MAX).unwrap()).unwrap();
        assert_eq!(c.drain_writable(&mut Gone, None).unwrap(), WriteOutcome::Closed);
    }

    #[test]
    fn test_queue_overflow() {
        let mut c = Connection::new("127.0.0.1:9".parse().unwrap(), 10, Instant::now());
        c.enqueue_write(encode(b"abc", MAX).unwrap()).unwrap();
        let err = c.enqueue_write(encode(b"abc", MAX).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::QueueOverflow {
                queued: 7,
                incoming: 7,
                limit: 10
            }
        ));
        assert_eq!(c.queued_bytes(), 7);

        c.discard_output();
        assert!(!c.has_pending_output());
    }

    #[test]
    fn test_idle_tracking() {
        let start = Instant::now();
        let mut c = Connection::new("127.0.0.1:9".parse().unwrap(), 0, start);
        let later = start + Duration::from_secs(3);
        assert_eq!(c.idle_for(later), Duration::from_secs(3));
        c.touch(later);
        assert_eq!(c.idle_for(later), Duration::ZERO);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry: ConnectionRegistry<&str> = ConnectionRegistry::new(2);
        let h1 = Handle::from(mio::Token(1));
        let h2 = Handle::from(mio::Token(2));
        let h3 = Handle::from(mio::Token(3));

        registry.insert(h1, "a").unwrap();
        registry.insert(h2, "b").unwrap();

        // At capacity
        assert_eq!(registry.insert(h3, "c"), Err("c"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(h2), Some(&"b"));

        registry.remove(h1);
        assert!(!registry.contains(h1));
        assert_eq!(registry.len(), 1);
        assert!(registry.has_capacity());
    }
}
