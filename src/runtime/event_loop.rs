//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Connection lifecycle
//!
//! ```text
//! accept ──▶ Open ──EOF──▶ HalfClosed ──drained──▶ Closed
//!             │                │
//!             └──shutdown──▶ Draining ──drained/grace──▶ Closed
//! ```
//!
//! Protocol violations, queue overflow and socket errors go straight to
//! `Closed`, discarding anything still queued.
//!
//! mio notifications are edge-triggered. Reads always continue until
//! `WouldBlock`. A write pass that stops for any other reason (write budget,
//! short write) leaves the connection on a retry list that is serviced on the
//! next cycle, with a zero poll timeout so the retry is not delayed.

use crate::config::Config;
use crate::error::{ConnectionError, MultiplexerError, ServerError};
use crate::protocols::echo::{parser, Echo, Service};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry, WriteOutcome};
use crate::runtime::multiplexer::{Multiplexer, ReadyEvent};
use crate::runtime::shutdown::ShutdownHandle;
use crate::runtime::{listener, Handle};
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use std::collections::HashSet;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Socket plus its connection record.
struct Entry {
    stream: TcpStream,
    conn: Connection,
}

/// Single-threaded dispatcher owning the multiplexer and every connection.
pub struct EventLoop<S = Echo> {
    mux: Multiplexer,
    listener: Option<(Handle, TcpListener)>,
    local_addr: SocketAddr,
    waker: Handle,
    shutdown: ShutdownHandle,
    connections: ConnectionRegistry<Entry>,
    service: S,
    config: Config,
    read_buf: Vec<u8>,
    /// Connections whose last write pass stopped without the socket blocking.
    retry: Vec<Handle>,
    /// The accept cap was hit with connections possibly still in the backlog.
    accept_pending: bool,
    drain_deadline: Option<Instant>,
}

impl<S: Service> EventLoop<S> {
    /// Bind the configured listen address and build a loop around it.
    pub fn bind(config: &Config, service: S) -> Result<Self, ServerError> {
        let addr = listener::resolve(&config.listen)?;
        let listener = listener::bind(addr, config.backlog)?;
        Self::new(listener, config, service)
    }

    /// Build a loop around an already bound non-blocking listener.
    pub fn new(mut listener: TcpListener, config: &Config, service: S) -> Result<Self, ServerError> {
        let local_addr = listener.local_addr()?;
        let mut mux = Multiplexer::new(config.events_capacity)?;
        let (waker, waker_fd) = mux.waker()?;
        let listener_handle = mux.register(&mut listener, Interest::READABLE)?;

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            max_frame_size = config.max_frame_size,
            max_queued_bytes = config.max_queued_bytes,
            "Event loop listening"
        );

        Ok(Self {
            mux,
            listener: Some((listener_handle, listener)),
            local_addr,
            waker,
            shutdown: ShutdownHandle::new(waker_fd),
            connections: ConnectionRegistry::new(config.max_connections),
            service,
            config: config.clone(),
            read_buf: vec![0u8; config.read_buffer_size.max(1)],
            retry: Vec::new(),
            accept_pending: false,
            drain_deadline: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops this loop from any thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested and the connections drain, or until
    /// the multiplexer fails.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let result = self.run_cycles();
        self.close_all();
        self.mux.close();
        info!("Event loop stopped");
        result
    }

    fn run_cycles(&mut self) -> Result<(), ServerError> {
        loop {
            if self.shutdown.is_requested() && self.drain_deadline.is_none() {
                self.begin_shutdown();
            }

            if let Some(deadline) = self.drain_deadline {
                if self.connections.is_empty() {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    warn!(
                        remaining = self.connections.len(),
                        "Grace period elapsed, closing remaining connections"
                    );
                    return Ok(());
                }
            }

            let timeout = self.next_timeout(Instant::now());
            if let Err(e) = self.turn(Some(timeout)) {
                error!(error = %e, "Multiplexer failed");
                return Err(e.into());
            }
        }
    }

    /// Run exactly one poll cycle: poll, dispatch the batch in delivery
    /// order, service retries, sweep idle connections.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), MultiplexerError> {
        let events = self.mux.poll(timeout)?;
        let retry = std::mem::take(&mut self.retry);
        let accept_pending = std::mem::take(&mut self.accept_pending);

        for event in &events {
            self.dispatch(event);
        }

        if accept_pending {
            self.accept_connections();
        }

        for handle in retry {
            if self.connections.contains(handle) {
                self.drive(handle, false, true);
            }
        }

        self.sweep_idle(Instant::now());
        Ok(())
    }

    fn next_timeout(&self, now: Instant) -> Duration {
        if !self.retry.is_empty() || self.accept_pending {
            return Duration::ZERO;
        }
        match self.drain_deadline {
            Some(deadline) => self.config.tick.min(deadline.saturating_duration_since(now)),
            None => self.config.tick,
        }
    }

    fn dispatch(&mut self, event: &ReadyEvent) {
        if self.listener.as_ref().is_some_and(|(h, _)| *h == event.handle) {
            self.accept_connections();
        } else if event.handle == self.waker {
            trace!("Woken");
        } else {
            let readable = event.readable || event.read_closed || event.error;
            let writable = event.writable || event.write_closed;
            self.drive(event.handle, readable, writable);
        }
    }

    /// Handle readiness for one connection, then settle its interest or
    /// close it. Stale handles are ignored.
    fn drive(&mut self, handle: Handle, readable: bool, writable: bool) {
        if !self.connections.contains(handle) {
            trace!(conn = %handle, "Event for closed connection");
            return;
        }

        let result = self.process(handle, readable, writable);
        match result {
            Ok(()) => {}
            Err(e) => {
                debug!(conn = %handle, error = %e, "Connection error");
                self.abort_connection(handle);
            }
        }
    }

    fn process(&mut self, handle: Handle, readable: bool, writable: bool) -> Result<(), ConnectionError> {
        if readable {
            self.handle_readable(handle)?;
        }
        // Replies produced by the read are written straight away; the socket
        // is usually writable and this saves a poll round trip.
        if writable || readable {
            self.handle_writable(handle)?;
        }
        self.settle(handle)
    }

    fn handle_readable(&mut self, handle: Handle) -> Result<(), ConnectionError> {
        let Some(entry) = self.connections.get_mut(handle) else {
            return Ok(());
        };
        if !entry.conn.wants_read() {
            return Ok(());
        }

        let max_frame_size = self.config.max_frame_size;
        let budget = self.config.write_budget();
        loop {
            let n = match entry.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    debug!(conn = %handle, queued = entry.conn.queued_bytes(), "Peer half-closed");
                    entry.conn.mark_half_closed();
                    break;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            entry.conn.append_read_bytes(&self.read_buf[..n]);
            entry.conn.touch(Instant::now());

            // Extract as we go so the read buffer never holds much more than
            // one maximum-size frame.
            while let Some(payload) = entry.conn.try_extract_frame(max_frame_size)? {
                trace!(conn = %handle, len = payload.len(), "Frame received");
                let Some(reply) = self.service.call(payload) else {
                    continue;
                };
                match parser::encode(&reply, max_frame_size) {
                    Ok(frame) => entry.conn.enqueue_write(frame)?,
                    Err(e) => warn!(conn = %handle, error = %e, "Dropping reply"),
                }
            }

            // Write between reads so a pipelining peer that keeps reading its
            // replies never pushes the queue past its cap.
            if entry.conn.has_pending_output() {
                flush(handle, entry, budget, &mut self.retry)?;
            }
        }

        Ok(())
    }

    fn handle_writable(&mut self, handle: Handle) -> Result<(), ConnectionError> {
        let Some(entry) = self.connections.get_mut(handle) else {
            return Ok(());
        };
        if !entry.conn.has_pending_output() {
            return Ok(());
        }

        flush(handle, entry, self.config.write_budget(), &mut self.retry)
    }

    /// Close a finished connection, or bring its registered interest in line
    /// with its state.
    fn settle(&mut self, handle: Handle) -> Result<(), ConnectionError> {
        let desired = match self.connections.get(handle) {
            None => return Ok(()),
            Some(entry) if entry.conn.is_finished() => None,
            Some(entry) => entry.conn.desired_interest(),
        };
        let Some(desired) = desired else {
            self.close_connection(handle);
            return Ok(());
        };

        let Some(entry) = self.connections.get_mut(handle) else {
            return Ok(());
        };
        if entry.conn.interest() != Some(desired) {
            self.mux.modify(&mut entry.stream, handle, desired)?;
            entry.conn.set_interest(desired);
        }
        Ok(())
    }

    fn accept_connections(&mut self) {
        let Some((_, listener)) = self.listener.as_ref() else {
            return;
        };
        let limit = self.config.accept_limit();
        let mut accepted = 0usize;

        loop {
            if limit.is_some_and(|limit| accepted >= limit) {
                trace!(accepted, "Accept limit reached for this cycle");
                self.accept_pending = true;
                break;
            }

            match listener.accept() {
                Ok((mut stream, peer)) => {
                    accepted += 1;

                    if !self.connections.has_capacity() {
                        warn!(peer = %peer, max = self.connections.capacity(), "Connection limit reached");
                        continue;
                    }

                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let handle = match self.mux.register(&mut stream, Interest::READABLE) {
                        Ok(handle) => handle,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Failed to register connection");
                            continue;
                        }
                    };

                    let mut conn = Connection::new(peer, self.config.max_queued_bytes, Instant::now());
                    conn.set_interest(Interest::READABLE);

                    if let Err(mut rejected) = self.connections.insert(handle, Entry { stream, conn }) {
                        let _ = self.mux.deregister(&mut rejected.stream, handle);
                        continue;
                    }

                    debug!(conn = %handle, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Deregister and drop a connection. Table removal and deregistration
    /// always happen together.
    fn close_connection(&mut self, handle: Handle) {
        if let Some(mut entry) = self.connections.remove(handle) {
            entry.conn.mark_closed();
            if let Err(e) = self.mux.deregister(&mut entry.stream, handle) {
                debug!(conn = %handle, error = %e, "Deregister failed");
            }
            self.retry.retain(|h| *h != handle);
            debug!(conn = %handle, peer = %entry.conn.peer(), "Connection closed");
        }
    }

    /// Close without flushing.
    fn abort_connection(&mut self, handle: Handle) {
        if let Some(entry) = self.connections.get_mut(handle) {
            let dropped = entry.conn.queued_bytes();
            if dropped > 0 {
                trace!(conn = %handle, dropped, "Discarding queued output");
            }
            entry.conn.discard_output();
        }
        self.close_connection(handle);
    }

    fn sweep_idle(&mut self, now: Instant) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };

        let idle: Vec<Handle> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.conn.idle_for(now) >= timeout)
            .map(|(handle, _)| handle)
            .collect();

        for handle in idle {
            let reason = ConnectionError::Idle;
            debug!(conn = %handle, error = %reason, "Closing idle connection");
            self.abort_connection(handle);
        }
    }

    /// Stop accepting, stop reading, and start the grace period.
    fn begin_shutdown(&mut self) {
        info!(
            connections = self.connections.len(),
            grace_ms = self.config.grace_period.as_millis() as u64,
            "Shutdown requested, draining connections"
        );

        if let Some((handle, mut listener)) = self.listener.take() {
            if let Err(e) = self.mux.deregister(&mut listener, handle) {
                debug!(error = %e, "Listener deregister failed");
            }
        }
        self.accept_pending = false;

        for handle in self.connections.handles() {
            if let Some(entry) = self.connections.get_mut(handle) {
                entry.conn.mark_closing();
            }
            if let Err(e) = self.settle(handle) {
                debug!(conn = %handle, error = %e, "Connection error");
                self.abort_connection(handle);
            }
        }

        self.drain_deadline = Some(Instant::now() + self.config.grace_period);
    }

    fn close_all(&mut self) {
        for handle in self.connections.handles() {
            self.close_connection(handle);
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Handles of live connections.
    pub fn connection_handles(&self) -> Vec<Handle> {
        let mut handles = self.connections.handles();
        handles.sort();
        handles
    }

    pub fn connection_state(&self, handle: Handle) -> Option<ConnState> {
        self.connections.get(handle).map(|entry| entry.conn.state())
    }

    /// Interest registered with the multiplexer for a connection.
    pub fn connection_interest(&self, handle: Handle) -> Option<Interest> {
        self.connections.get(handle)?;
        self.mux.interest(handle)
    }

    pub fn queued_bytes(&self, handle: Handle) -> Option<usize> {
        self.connections.get(handle).map(|entry| entry.conn.queued_bytes())
    }

    /// Whether the connection table and the multiplexer registrations agree:
    /// same handle set and same interest for every connection.
    pub fn is_consistent(&self) -> bool {
        let listener = self.listener.as_ref().map(|(h, _)| *h);
        let registered: HashSet<Handle> = self
            .mux
            .registered()
            .filter(|h| Some(*h) != listener && *h != self.waker)
            .collect();
        let table: HashSet<Handle> = self.connections.iter().map(|(h, _)| h).collect();

        self.mux.is_registered(self.waker)
            && listener.map_or(true, |h| self.mux.is_registered(h))
            && registered == table
            && self
                .connections
                .iter()
                .all(|(h, entry)| entry.conn.interest() == self.mux.interest(h))
    }
}

/// One write pass for a connection. A pass that stops before the socket
/// blocks queues the connection for another pass next cycle.
fn flush(
    handle: Handle,
    entry: &mut Entry,
    budget: Option<usize>,
    retry: &mut Vec<Handle>,
) -> Result<(), ConnectionError> {
    let outcome = entry.conn.drain_writable(&mut entry.stream, budget)?;

    match outcome {
        WriteOutcome::FullyDrained => {
            entry.conn.touch(Instant::now());
            trace!(conn = %handle, "Output drained");
        }
        WriteOutcome::PartiallyDrained(remaining) => {
            entry.conn.touch(Instant::now());
            trace!(conn = %handle, remaining, "Partial write");
            if !retry.contains(&handle) {
                retry.push(handle);
            }
        }
        WriteOutcome::WouldBlock => {
            trace!(conn = %handle, queued = entry.conn.queued_bytes(), "Write would block");
        }
        WriteOutcome::Closed => return Err(ConnectionError::PeerClosed),
    }
    Ok(())
}
