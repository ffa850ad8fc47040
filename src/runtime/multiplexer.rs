//! Readiness multiplexer over mio (epoll on Linux, kqueue on macOS).
//!
//! Thin layer that owns the `Poll`, hands out `Handle`s for registered
//! sources and turns raw mio events into `ReadyEvent`s. It tracks which
//! handles are live so the event loop can check its connection table
//! against the set of registrations.

use crate::error::MultiplexerError;
use crate::runtime::token::{Handle, HandleAllocator};
use mio::event::Source;
use mio::{Events, Interest, Poll, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Readiness reported for one handle in a poll batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub handle: Handle,
    pub readable: bool,
    pub writable: bool,
    /// Peer shut down its write side (or the socket hung up).
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl ReadyEvent {
    fn from_mio(event: &mio::event::Event) -> Self {
        Self {
            handle: event.token().into(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

pub struct Multiplexer {
    poll: Option<Poll>,
    events: Events,
    handles: HandleAllocator,
}

impl Multiplexer {
    /// Create a multiplexer returning at most `events_capacity` events per poll.
    pub fn new(events_capacity: usize) -> Result<Self, MultiplexerError> {
        Ok(Self {
            poll: Some(Poll::new()?),
            events: Events::with_capacity(events_capacity.max(1)),
            handles: HandleAllocator::new(events_capacity),
        })
    }

    /// Register `source` for `interest` and return its handle.
    ///
    /// Fails with `InvalidHandle` if the OS reports the source as already
    /// registered.
    pub fn register<S>(&mut self, source: &mut S, interest: Interest) -> Result<Handle, MultiplexerError>
    where
        S: Source + ?Sized,
    {
        let poll = self.poll.as_ref().ok_or(MultiplexerError::Closed)?;
        let handle = self.handles.alloc(interest);

        if let Err(e) = poll.registry().register(source, handle.into(), interest) {
            self.handles.cancel(handle);
            return Err(match e.kind() {
                io::ErrorKind::AlreadyExists => MultiplexerError::InvalidHandle(handle),
                _ => MultiplexerError::Io(e),
            });
        }
        Ok(handle)
    }

    /// Change the interest set of a registered source.
    pub fn modify<S>(&mut self, source: &mut S, handle: Handle, interest: Interest) -> Result<(), MultiplexerError>
    where
        S: Source + ?Sized,
    {
        let poll = self.poll.as_ref().ok_or(MultiplexerError::Closed)?;
        let current = self
            .handles
            .get(handle)
            .ok_or(MultiplexerError::InvalidHandle(handle))?;
        if current == interest {
            return Ok(());
        }

        poll.registry().reregister(source, handle.into(), interest)?;
        self.handles.set(handle, interest);
        Ok(())
    }

    /// Remove a source. The handle is retired until the next `poll`.
    ///
    /// The handle is retired even if the OS call fails: the caller is about
    /// to drop the source and must not see it as registered any more.
    pub fn deregister<S>(&mut self, source: &mut S, handle: Handle) -> Result<(), MultiplexerError>
    where
        S: Source + ?Sized,
    {
        let poll = self.poll.as_ref().ok_or(MultiplexerError::Closed)?;
        if !self.handles.retire(handle) {
            return Err(MultiplexerError::InvalidHandle(handle));
        }
        poll.registry().deregister(source)?;
        Ok(())
    }

    /// Create a waker bound to its own handle.
    pub fn waker(&mut self) -> Result<(Handle, Arc<Waker>), MultiplexerError> {
        let poll = self.poll.as_ref().ok_or(MultiplexerError::Closed)?;
        let handle = self.handles.alloc(Interest::READABLE);
        match Waker::new(poll.registry(), handle.into()) {
            Ok(waker) => Ok((handle, Arc::new(waker))),
            Err(e) => {
                self.handles.cancel(handle);
                Err(e.into())
            }
        }
    }

    /// Block until a registered source is ready or `timeout` elapses.
    ///
    /// Returns an empty batch on timeout or when interrupted by a signal.
    /// Events come back in the order the OS delivered them.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>, MultiplexerError> {
        let poll = self.poll.as_mut().ok_or(MultiplexerError::Closed)?;

        // The previous batch is fully processed; retired slots may be reused now.
        self.handles.release_retired();

        match poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        Ok(self.events.iter().map(ReadyEvent::from_mio).collect())
    }

    /// Tear down the OS primitive. Every later call fails with `Closed`.
    pub fn close(&mut self) {
        self.poll = None;
    }

    pub fn is_closed(&self) -> bool {
        self.poll.is_none()
    }

    /// Current interest of a live handle.
    pub fn interest(&self, handle: Handle) -> Option<Interest> {
        self.handles.get(handle)
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        self.handles.get(handle).is_some()
    }

    /// Live handles, including the listener and waker.
    pub fn registered(&self) -> impl Iterator<Item = Handle> + '_ {
        self.handles.active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::net::TcpStream as StdTcpStream;

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_poll_timeout_returns_empty() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut l = listener();
        mux.register(&mut l, Interest::READABLE).unwrap();

        let events = mux.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_listener_becomes_readable() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut l = listener();
        let handle = mux.register(&mut l, Interest::READABLE).unwrap();

        let _client = StdTcpStream::connect(l.local_addr().unwrap()).unwrap();

        let events = mux.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].handle, handle);
        assert!(events[0].readable);
    }

    #[test]
    fn test_unknown_handle_rejected() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut l = listener();
        let handle = mux.register(&mut l, Interest::READABLE).unwrap();

        mux.deregister(&mut l, handle).unwrap();
        assert!(!mux.is_registered(handle));

        assert!(matches!(
            mux.modify(&mut l, handle, Interest::WRITABLE),
            Err(MultiplexerError::InvalidHandle(h)) if h == handle
        ));
        assert!(matches!(
            mux.deregister(&mut l, handle),
            Err(MultiplexerError::InvalidHandle(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_double_register_rejected() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut l = listener();
        mux.register(&mut l, Interest::READABLE).unwrap();

        assert!(matches!(
            mux.register(&mut l, Interest::READABLE),
            Err(MultiplexerError::InvalidHandle(_))
        ));
        assert_eq!(mux.registered().count(), 1);
    }

    #[test]
    fn test_modify_tracks_interest() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut l = listener();
        let handle = mux.register(&mut l, Interest::READABLE).unwrap();

        mux.modify(&mut l, handle, Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        assert_eq!(
            mux.interest(handle),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn test_retired_handle_not_reused_within_batch() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut a = listener();
        let mut b = listener();

        let ha = mux.register(&mut a, Interest::READABLE).unwrap();
        mux.deregister(&mut a, ha).unwrap();
        let hb = mux.register(&mut b, Interest::READABLE).unwrap();
        assert_ne!(ha, hb);
    }

    #[test]
    fn test_waker_wakes_poll() {
        let mut mux = Multiplexer::new(8).unwrap();
        let (handle, waker) = mux.waker().unwrap();

        waker.wake().unwrap();
        let events = mux.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].handle, handle);
    }

    #[test]
    fn test_closed_multiplexer() {
        let mut mux = Multiplexer::new(8).unwrap();
        mux.close();
        assert!(mux.is_closed());

        assert!(matches!(mux.poll(None), Err(MultiplexerError::Closed)));
        let mut l = listener();
        assert!(matches!(
            mux.register(&mut l, Interest::READABLE),
            Err(MultiplexerError::Closed)
        ));
    }
}
