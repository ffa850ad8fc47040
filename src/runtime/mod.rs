//! Readiness-driven runtime.
//!
//! One thread owns everything:
//! - `Multiplexer`: mio `Poll` wrapper handing out `Handle`s
//! - `Connection`: per-socket buffers, outbound queue and lifecycle flags
//! - `EventLoop`: accepts, reads, frames, echoes and writes
//!
//! `ShutdownHandle` is the only piece shared with other threads.

mod connection;
mod event_loop;
mod listener;
mod multiplexer;
mod shutdown;
mod token;

pub use connection::{ConnState, Connection, ConnectionRegistry, WriteOutcome};
pub use event_loop::EventLoop;
pub use listener::{bind, resolve};
pub use multiplexer::{Multiplexer, ReadyEvent};
pub use shutdown::{spawn_signal_listener, ShutdownHandle};
pub use token::Handle;

use crate::config::Config;
use crate::error::ServerError;
use crate::protocols::echo::Echo;
use tracing::info;

/// Run the echo server until Ctrl-C, then drain and return.
pub fn run(config: &Config) -> Result<(), ServerError> {
    let mut event_loop = EventLoop::bind(config, Echo)?;
    spawn_signal_listener(event_loop.shutdown_handle())?;

    info!(addr = %event_loop.local_addr(), "Server ready");
    event_loop.run()
}
