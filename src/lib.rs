//! A remote process supervisor.
//!
//! The overseer daemon accepts short-lived TCP connections from
//! controller clients, executes child programs on their behalf,
//! samples each child's anonymous-region memory usage over its life,
//! enforces a graceful-then-forceful termination ladder, and answers
//! queries and policy actions against the in-memory monitoring
//! history. One SIGINT winds the whole thing down: the accept loop
//! stops, workers drain, and every still-running child is SIGKILLed
//! within a tick.

pub mod clock;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event_log;
pub mod memprobe;
pub mod monitor;
pub mod request_queue;
pub mod server;
pub mod shutdown;
pub mod supervisor;
pub mod wire;
