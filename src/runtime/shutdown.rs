//! Cooperative shutdown signalling.
//!
//! The event loop checks the flag once per cycle; the waker interrupts a
//! blocking poll so the check happens promptly.

use mio::Waker;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Cloneable trigger for stopping an event loop from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    /// Ask the loop to drain and exit. Repeated calls are no-ops.
    pub fn shutdown(&self) {
        if self.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop for shutdown");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("requested", &self.is_requested())
            .finish()
    }
}

/// Trigger `handle` on Ctrl-C.
///
/// Runs a single-threaded tokio runtime on a helper thread that only waits
/// for the signal. The thread is detached.
pub fn spawn_signal_listener(handle: ShutdownHandle) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Interrupt received, shutting down");
                        handle.shutdown();
                    }
                    Err(e) => debug!(error = %e, "Signal listener unavailable"),
                }
            });
        })?;

    Ok(())
}
