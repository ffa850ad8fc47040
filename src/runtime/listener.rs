//! Listener setup.

use crate::error::ServerError;
use mio::net::TcpListener;
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolve `listen` to the first usable socket address.
pub fn resolve(listen: &str) -> Result<SocketAddr, ServerError> {
    listen
        .to_socket_addrs()
        .map_err(|_| ServerError::Address(listen.to_string()))?
        .next()
        .ok_or_else(|| ServerError::Address(listen.to_string()))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
pub fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    create_listener(addr, backlog).map_err(|source| ServerError::Bind { addr, source })
}

fn create_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}
