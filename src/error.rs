use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::memprobe::ProbeError;

/// Failures the overseer cannot recover from.
///
/// A broken socket, pipe, fork or wait leaves the process without a
/// trustworthy view of its children, so these are never caught or
/// retried: they propagate with `?` to the process boundary (the main
/// thread or a worker loop) which logs them and exits non-zero. A bad
/// request, by contrast, is not an error at all — it just produces no
/// work.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("could not create listening socket: {0}")]
    Listen(#[source] nix::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("could not start worker thread: {0}")]
    Thread(#[source] io::Error),

    #[error("worker thread panicked")]
    WorkerPanic,

    #[error("could not read request frame: {0}")]
    Recv(#[source] io::Error),

    #[error("could not send response: {0}")]
    Send(#[source] io::Error),

    #[error("could not open log file {path:?}: {source}")]
    LogSink { path: PathBuf, source: io::Error },

    #[error("log write failed: {0}")]
    LogWrite(#[source] io::Error),

    #[error("could not spawn child: {0}")]
    Spawn(#[source] nix::Error),

    #[error("{op} failed for child {pid}: {source}")]
    Child {
        op: &'static str,
        pid: libc::pid_t,
        #[source]
        source: nix::Error,
    },

    #[error(transparent)]
    Probe(#[from] ProbeError),
}
