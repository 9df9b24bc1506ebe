//! The shared queue of accepted connections.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Condvar, Mutex};

use log::debug;

use crate::shutdown::ShutdownToken;

/// One accepted connection, owned by exactly one worker once claimed.
#[derive(Debug)]
pub struct Request {
    pub peer: SocketAddr,
    pub conn: TcpStream,
}

/// Strictly-FIFO handoff from the accept loop to the worker pool, one
/// mutex and one condition variable.
///
/// Every connection pushed here is eventually either claimed by a
/// worker (which closes it before or during processing) or dropped by
/// [`RequestQueue::drain_and_close`] during shutdown — never both,
/// never neither.
#[derive(Debug, Default)]
pub struct RequestQueue {
    inner: Mutex<VecDeque<Request>>,
    available: Condvar,
}

impl RequestQueue {
    pub fn new() -> RequestQueue {
        RequestQueue::default()
    }

    pub fn enqueue(&self, request: Request) {
        self.inner
            .lock()
            .expect("request queue poisoned")
            .push_back(request);
        self.available.notify_one();
    }

    /// Block until a request is available or shutdown is requested.
    ///
    /// Shutdown wins over a non-empty queue: workers stop processing
    /// the moment the token is set, and whatever is still queued is
    /// closed unprocessed by the accept-loop owner.
    pub fn dequeue_blocking(&self, shutdown: &ShutdownToken) -> Option<Request> {
        let mut queue = self.inner.lock().expect("request queue poisoned");
        loop {
            if shutdown.is_set() {
                return None;
            }
            if let Some(request) = queue.pop_front() {
                return Some(request);
            }
            queue = self
                .available
                .wait(queue)
                .expect("request queue poisoned");
        }
    }

    /// Wake every blocked worker; used once at shutdown.
    pub fn notify_all(&self) {
        self.available.notify_all();
    }

    /// Close and discard whatever is still queued. Only the accept-loop
    /// owner calls this, after all workers have joined.
    pub fn drain_and_close(&self) {
        let mut queue = self.inner.lock().expect("request queue poisoned");
        for request in queue.drain(..) {
            debug!("closing unhandled connection from {}", request.peer);
            // dropping the TcpStream closes it
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    // Queue entries own real sockets, so tests mint them from a
    // loopback listener.
    fn socket_pair(listener: &TcpListener) -> Request {
        let addr = listener.local_addr().unwrap();
        let conn = TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        drop(conn);
        Request {
            peer,
            conn: accepted,
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let queue = RequestQueue::new();
        let shutdown = ShutdownToken::new();
        let first = socket_pair(&listener);
        let second = socket_pair(&listener);
        let first_peer = first.peer;
        let second_peer = second.peer;
        queue.enqueue(first);
        queue.enqueue(second);
        assert_eq!(queue.dequeue_blocking(&shutdown).unwrap().peer, first_peer);
        assert_eq!(queue.dequeue_blocking(&shutdown).unwrap().peer, second_peer);
    }

    #[test]
    fn shutdown_wins_over_pending_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let queue = RequestQueue::new();
        let shutdown = ShutdownToken::new();
        queue.enqueue(socket_pair(&listener));
        shutdown.request();
        assert!(queue.dequeue_blocking(&shutdown).is_none());
        queue.drain_and_close();
    }

    #[test]
    fn blocked_worker_wakes_on_shutdown_broadcast() {
        let queue = std::sync::Arc::new(RequestQueue::new());
        let shutdown = ShutdownToken::new();
        let worker = {
            let queue = std::sync::Arc::clone(&queue);
            let shutdown = shutdown.clone();
            thread::spawn(move || queue.dequeue_blocking(&shutdown))
        };
        thread::sleep(std::time::Duration::from_millis(50));
        shutdown.request();
        queue.notify_all();
        assert!(worker.join().unwrap().is_none());
    }

    #[test]
    fn blocked_worker_receives_enqueued_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let queue = std::sync::Arc::new(RequestQueue::new());
        let shutdown = ShutdownToken::new();
        let worker = {
            let queue = std::sync::Arc::clone(&queue);
            let shutdown = shutdown.clone();
            thread::spawn(move || queue.dequeue_blocking(&shutdown))
        };
        thread::sleep(std::time::Duration::from_millis(50));
        let request = socket_pair(&listener);
        let peer = request.peer;
        queue.enqueue(request);
        assert_eq!(worker.join().unwrap().unwrap().peer, peer);
    }
}
