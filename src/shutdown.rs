//! The single-producer "quit" broadcast.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A monotonic shutdown flag: once set it is never cleared.
///
/// Read by the accept loop (to stop accepting), by worker dequeue (to
/// return without a request) and by every supervisor (to escalate its
/// child straight to SIGKILL). The flag itself is an atomic because the
/// producer is a signal handler; blocked waiters are woken by the
/// request queue's condvar broadcast, which the accept loop performs
/// once after observing the flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        ShutdownToken::default()
    }

    /// Ask every subsystem to wind down.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Arrange for SIGINT to set this token.
    pub fn install_sigint_handler(&self) -> io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.flag))?;
        Ok(())
    }
}
