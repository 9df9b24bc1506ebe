//! The per-child supervision state machine.
//!
//! A worker that claims an exec request becomes the supervisor for that
//! child: it owns the child from fork through reap. The child's life is
//! paced in 250 ms ticks. While it runs inside its SIGTERM grace the
//! supervisor probes its memory once per wall-clock second and appends
//! a sample to the shared monitoring history; at the end of the grace
//! it sends SIGTERM, and five seconds later SIGKILL. A shutdown request
//! short-circuits all of that: the next tick sends SIGKILL outright.
//!
//! Exec success is signalled with a close-on-exec pipe: the child holds
//! the write end, so a successful exec closes it and the parent reads
//! EOF. If the exec fails the child writes a sentinel through the pipe
//! before exiting, which is how the parent tells "child running" from
//! "nothing to supervise" without waiting.

use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use log::debug;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup, dup2, execv, fork, pipe, read, write, ForkResult, Pid};

use crate::clock;
use crate::context::OverseerContext;
use crate::error::Fatal;
use crate::event_log::EventLog;
use crate::memprobe;
use crate::monitor::Sample;
use crate::wire::ExecSpec;

/// Supervision granularity.
pub const TICK: Duration = Duration::from_millis(250);
/// Ticks per monitored second; also the sampling cadence.
pub const TICKS_PER_SECOND: u64 = 4;
/// Fixed wait between SIGTERM and SIGKILL.
pub const SIGKILL_GRACE_SECS: u64 = 5;

/// Sentinel the child writes when exec fails; EOF means success.
const EXEC_FAILED_SENTINEL: &[u8] = b"Failed\0";

enum SpawnOutcome {
    Running(Pid),
    ExecFailed,
}

/// Execute one request: spawn the child and supervise it to the grave.
/// Runs synchronously on the calling worker.
pub fn run(spec: &ExecSpec, ctx: &OverseerContext) -> Result<(), Fatal> {
    let mut log = EventLog::open(spec.log_file.as_deref()).map_err(|source| Fatal::LogSink {
        path: spec.log_file.clone().unwrap_or_default().into(),
        source,
    })?;
    let joined = spec.argv_joined();

    log.line(&format!("{} - attempting to execute {}", clock::now(), joined))
        .map_err(Fatal::LogWrite)?;

    match spawn(spec)? {
        SpawnOutcome::ExecFailed => {
            log.line(&format!("{} - could not execute {}", clock::now(), joined))
                .map_err(Fatal::LogWrite)?;
            Ok(())
        }
        SpawnOutcome::Running(pid) => {
            log.line(&format!(
                "{} - {} has been executed with pid {}",
                clock::now(),
                joined,
                pid
            ))
            .map_err(Fatal::LogWrite)?;
            debug!("supervising {} ({})", pid, joined);
            supervise(pid, spec.grace_secs, &joined, ctx, &mut log)
        }
    }
}

/// Fork and exec the target, distinguishing exec success from failure
/// via the close-on-exec pipe.
fn spawn(spec: &ExecSpec) -> Result<SpawnOutcome, Fatal> {
    // Everything the child needs must be materialized before the fork:
    // the child of a multi-threaded process must not allocate.
    let path = cstr(spec.file());
    let argv: Vec<CString> = spec.argv.iter().map(|arg| cstr(arg)).collect();
    let argv_refs: Vec<&CStr> = argv.iter().map(CString::as_c_str).collect();
    let out_file = spec.out_file.as_deref().map(cstr);

    let (pipe_read, pipe_write) = pipe().map_err(Fatal::Spawn)?;

    match unsafe { fork() }.map_err(Fatal::Spawn)? {
        ForkResult::Child => {
            if close(pipe_read).is_err()
                || fcntl(pipe_write, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).is_err()
            {
                unsafe { libc::_exit(1) }
            }
            run_child(&path, &argv_refs, out_file.as_deref(), pipe_write)
        }
        ForkResult::Parent { child } => {
            close(pipe_write).map_err(Fatal::Spawn)?;
            let mut sentinel = [0u8; EXEC_FAILED_SENTINEL.len()];
            let received = read(pipe_read, &mut sentinel).map_err(Fatal::Spawn)?;
            close(pipe_read).map_err(Fatal::Spawn)?;
            if received == 0 {
                Ok(SpawnOutcome::Running(child))
            } else {
                Ok(SpawnOutcome::ExecFailed)
            }
        }
    }
}

/// Child side of the fork. Redirect stdout/stderr if asked, then exec;
/// on failure restore the streams, push the sentinel through the pipe
/// and die.
fn run_child(path: &CStr, argv: &[&CStr], out_file: Option<&CStr>, pipe_write: RawFd) -> ! {
    let mut saved: Option<(RawFd, RawFd, RawFd)> = None;

    if let Some(out) = out_file {
        let mode = Mode::S_IRWXU | Mode::S_IRWXG | Mode::S_IRWXO;
        let out_fd = match open(out, OFlag::O_APPEND | OFlag::O_CREAT | OFlag::O_WRONLY, mode) {
            Ok(fd) => fd,
            Err(_) => unsafe { libc::_exit(1) },
        };
        let old_stdout = dup(libc::STDOUT_FILENO).unwrap_or(-1);
        let _ = dup2(out_fd, libc::STDOUT_FILENO);
        let old_stderr = dup(libc::STDERR_FILENO).unwrap_or(-1);
        let _ = dup2(out_fd, libc::STDERR_FILENO);
        if fcntl(out_fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).is_err() {
            unsafe { libc::_exit(1) }
        }
        saved = Some((old_stdout, old_stderr, out_fd));
    }

    let _ = execv(path, argv);

    // exec failed; put the real stdout/stderr back before reporting
    if let Some((old_stdout, old_stderr, out_fd)) = saved {
        let _ = dup2(old_stdout, libc::STDOUT_FILENO);
        let _ = close(old_stdout);
        let _ = dup2(old_stderr, libc::STDERR_FILENO);
        let _ = close(old_stderr);
        let _ = close(out_fd);
    }
    let _ = write(pipe_write, EXEC_FAILED_SENTINEL);
    unsafe { libc::_exit(1) }
}

/// The supervision loop proper. See the module docs for the ladder; the
/// tick counter only advances inside a grace window, so each deadline
/// comparison is against the number of 250 ms slices actually slept.
fn supervise(
    pid: Pid,
    grace_secs: u64,
    argv: &str,
    ctx: &OverseerContext,
    log: &mut EventLog,
) -> Result<(), Fatal> {
    let sigterm_deadline = grace_secs * TICKS_PER_SECOND;
    let sigkill_deadline = (grace_secs + SIGKILL_GRACE_SECS) * TICKS_PER_SECOND;
    let mut exec_ticks: u64 = 0;
    let mut sigterm_sent = false;
    let mut sigkill_sent = false;

    loop {
        let status = waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(|source| Fatal::Child {
            op: "waitpid",
            pid: pid.as_raw(),
            source,
        })?;

        match status {
            WaitStatus::StillAlive if !sigterm_sent => {
                if ctx.shutdown.is_set() && !sigkill_sent {
                    send_signal(pid, Signal::SIGKILL)?;
                    sigkill_sent = true;
                } else if exec_ticks < sigterm_deadline {
                    exec_ticks += 1;
                    if exec_ticks % TICKS_PER_SECOND == 0 {
                        // The child can exit between the reap above and
                        // the probe; a vanished maps file is a skipped
                        // sample, not an error.
                        if let Ok(bytes) = memprobe::mem_used(pid) {
                            ctx.store.append(Sample {
                                pid: pid.as_raw(),
                                when: clock::now(),
                                argv: argv.to_string(),
                                bytes,
                            });
                        }
                    }
                    thread::sleep(TICK);
                } else {
                    send_signal(pid, Signal::SIGTERM)?;
                    sigterm_sent = true;
                    log.line(&format!("{} - sent SIGTERM to {}", clock::now(), pid))
                        .map_err(Fatal::LogWrite)?;
                }
            }

            WaitStatus::Exited(_, code) => {
                ctx.store.purge(pid.as_raw());
                log.line(&format!(
                    "{} - {} has terminated with status code {}",
                    clock::now(),
                    pid,
                    code
                ))
                .map_err(Fatal::LogWrite)?;
                return Ok(());
            }

            WaitStatus::Signaled(_, signal, _)
                if matches!(signal, Signal::SIGTERM | Signal::SIGKILL | Signal::SIGINT) =>
            {
                ctx.store.purge(pid.as_raw());
                // Death by an expected signal reports the exit-status
                // byte of the wait status, which is 0.
                log.line(&format!(
                    "{} - {} has terminated with status code 0",
                    clock::now(),
                    pid
                ))
                .map_err(Fatal::LogWrite)?;
                return Ok(());
            }

            // Still running after SIGTERM, or brought down by a signal
            // we did not send: pace out the fixed grace, then escalate.
            _ => {
                if ctx.shutdown.is_set() && !sigkill_sent {
                    send_signal(pid, Signal::SIGKILL)?;
                    sigkill_sent = true;
                } else if exec_ticks < sigkill_deadline {
                    exec_ticks += 1;
                    thread::sleep(TICK);
                } else if !sigkill_sent {
                    send_signal(pid, Signal::SIGKILL)?;
                    sigkill_sent = true;
                    log.line(&format!("{} - sent SIGKILL to {}", clock::now(), pid))
                        .map_err(Fatal::LogWrite)?;
                } else {
                    // SIGKILL is on its way; wait out the final reap.
                    thread::sleep(TICK);
                }
            }
        }
    }
}

fn send_signal(pid: Pid, signal: Signal) -> Result<(), Fatal> {
    kill(pid, signal).map_err(|source| Fatal::Child {
        op: "kill",
        pid: pid.as_raw(),
        source,
    })
}

fn cstr(token: &str) -> CString {
    // request tokens come from whitespace-splitting a NUL-trimmed
    // frame, so an interior NUL cannot occur
    CString::new(token).expect("request token contains NUL")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ExecSpec;
    use std::fs;

    fn spec(argv: &[&str], out: Option<&str>, log: Option<&str>, grace: u64) -> ExecSpec {
        ExecSpec {
            argv: argv.iter().map(|arg| arg.to_string()).collect(),
            out_file: out.map(str::to_string),
            log_file: log.map(str::to_string),
            grace_secs: grace,
        }
    }

    #[test]
    fn fast_child_leaves_no_samples_and_one_termination_line() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("events.log");
        let ctx = OverseerContext::new();

        run(
            &spec(&["/bin/true"], None, log_path.to_str(), 2),
            &ctx,
        )
        .unwrap();

        let text = fs::read_to_string(&log_path).unwrap();
        assert!(text.contains("attempting to execute /bin/true"), "{}", text);
        assert!(text.contains("/bin/true has been executed with pid"), "{}", text);
        assert!(text.contains("has terminated with status code 0"), "{}", text);
        assert!(!text.contains("SIGTERM"), "{}", text);
        assert!(ctx.store.aggregates().is_empty());
    }

    #[test]
    fn exec_failure_logs_could_not_execute() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("events.log");
        let ctx = OverseerContext::new();

        run(
            &spec(&["/no/such/file"], None, log_path.to_str(), 2),
            &ctx,
        )
        .unwrap();

        let text = fs::read_to_string(&log_path).unwrap();
        assert!(text.contains("attempting to execute /no/such/file"), "{}", text);
        assert!(text.contains("could not execute /no/such/file"), "{}", text);
        assert!(!text.contains("has been executed with pid"), "{}", text);
    }

    #[test]
    fn nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("events.log");
        let ctx = OverseerContext::new();

        run(
            &spec(&["/bin/false"], None, log_path.to_str(), 2),
            &ctx,
        )
        .unwrap();

        let text = fs::read_to_string(&log_path).unwrap();
        assert!(text.contains("has terminated with status code 1"), "{}", text);
    }

    #[test]
    fn output_redirection_appends_child_output() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("child.out");
        let log_path = dir.path().join("events.log");
        let ctx = OverseerContext::new();

        run(
            &spec(
                &["/bin/echo", "redirected"],
                out_path.to_str(),
                log_path.to_str(),
                2,
            ),
            &ctx,
        )
        .unwrap();

        let out = fs::read_to_string(&out_path).unwrap();
        assert_eq!(out, "redirected\n");
    }

    #[test]
    fn zero_grace_sends_sigterm_before_any_sample() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("events.log");
        let ctx = OverseerContext::new();

        run(
            &spec(&["/bin/sleep", "5"], None, log_path.to_str(), 0),
            &ctx,
        )
        .unwrap();

        let text = fs::read_to_string(&log_path).unwrap();
        assert!(text.contains("sent SIGTERM to"), "{}", text);
        assert!(text.contains("has terminated with status code 0"), "{}", text);
        assert!(ctx.store.aggregates().is_empty());
    }

    #[test]
    fn shutdown_escalates_straight_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("events.log");
        let ctx = OverseerContext::new();
        ctx.shutdown.request();

        let start = std::time::Instant::now();
        run(
            &spec(&["/bin/sleep", "30"], None, log_path.to_str(), 10),
            &ctx,
        )
        .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        let text = fs::read_to_string(&log_path).unwrap();
        assert!(text.contains("has terminated with status code 0"), "{}", text);
        assert!(!text.contains("sent SIGTERM"), "{}", text);
    }
}
