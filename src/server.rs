//! The overseer's accept loop and lifecycle: bind, pool up workers,
//! feed them connections, and tear everything down in order when the
//! shutdown token fires.

use std::io;
use std::net::TcpListener;
use std::os::unix::io::FromRawFd;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn,
};

use crate::context::OverseerContext;
use crate::dispatch;
use crate::error::Fatal;
use crate::request_queue::Request;
use crate::shutdown::ShutdownToken;

/// Fixed size of the worker pool. Part of the observable contract: it
/// caps how many children can be supervised concurrently.
pub const WORKER_COUNT: usize = 5;
/// Listen backlog.
pub const ACCEPT_BACKLOG: usize = 10;
/// Dampener between polls of the non-blocking listener.
pub const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// A bound, not-yet-running overseer.
pub struct Overseer {
    ctx: Arc<OverseerContext>,
    listener: TcpListener,
    port: u16,
}

impl Overseer {
    /// Bind the listening socket with address and port reuse and set it
    /// non-blocking. Port 0 asks the kernel for an ephemeral port; see
    /// [`Overseer::local_port`].
    pub fn bind(port: u16) -> Result<Overseer, Fatal> {
        let ctx = OverseerContext::new();
        let listener = listen_socket(port)?;
        let port = listener.local_addr().map_err(Fatal::Accept)?.port();
        Ok(Overseer {
            ctx,
            listener,
            port,
        })
    }

    /// The port actually bound.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// A handle that stops this overseer when set.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.ctx.shutdown.clone()
    }

    /// Serve until the shutdown token is set, then quiesce: close the
    /// listener, wake and join every worker, and close whatever is
    /// still queued without processing it.
    pub fn run(self) -> Result<(), Fatal> {
        let Overseer {
            ctx,
            listener,
            port,
        } = self;

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for id in 0..WORKER_COUNT {
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker_loop(&ctx))
                .map_err(Fatal::Thread)?;
            workers.push(handle);
        }
        info!("overseer listening on port {} with {} workers", port, WORKER_COUNT);

        while !ctx.shutdown.is_set() {
            match listener.accept() {
                Ok((conn, peer)) => {
                    debug!("accepted connection from {}", peer);
                    ctx.queue.enqueue(Request { peer, conn });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_RETRY);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Fatal::Accept(err)),
            }
        }

        info!("shutdown requested; quiescing");
        drop(listener);
        ctx.queue.notify_all();
        for handle in workers {
            handle.join().map_err(|_| Fatal::WorkerPanic)?;
        }
        ctx.queue.drain_and_close();
        Ok(())
    }
}

/// Consume requests until shutdown. A structural failure has no
/// recovery path, so it tears the whole overseer down.
fn worker_loop(ctx: &OverseerContext) {
    while let Some(request) = ctx.queue.dequeue_blocking(&ctx.shutdown) {
        if let Err(err) = dispatch::handle(request, ctx) {
            error!("fatal: {}", err);
            process::exit(1);
        }
    }
    debug!("worker exiting");
}

fn listen_socket(port: u16) -> Result<TcpListener, Fatal> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(Fatal::Listen)?;
    setsockopt(fd, sockopt::ReuseAddr, &true).map_err(Fatal::Listen)?;
    setsockopt(fd, sockopt::ReusePort, &true).map_err(Fatal::Listen)?;
    bind(fd, &SockaddrIn::new(0, 0, 0, 0, port)).map_err(Fatal::Listen)?;
    listen(fd, ACCEPT_BACKLOG).map_err(Fatal::Listen)?;

    // From here the listener is driven through std; accept reports
    // WouldBlock instead of blocking, which the run loop dampens.
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true).map_err(Fatal::Accept)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_on_ephemeral_port_reports_it() {
        let overseer = Overseer::bind(0).unwrap();
        assert_ne!(overseer.local_port(), 0);
    }

    #[test]
    fn run_returns_cleanly_after_shutdown() {
        let overseer = Overseer::bind(0).unwrap();
        let token = overseer.shutdown_token();
        let handle = thread::spawn(move || overseer.run());
        thread::sleep(Duration::from_millis(50));
        token.request();
        handle.join().unwrap().unwrap();
    }
}
