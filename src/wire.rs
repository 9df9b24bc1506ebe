//! The wire format spoken between controller and overseer.
//!
//! A request is a single fixed-size frame: the command tokens joined by
//! single spaces, NUL-terminated, padded out to [`FRAME_LEN`] bytes and
//! written in one call. Responses are plain `\n`-terminated text lines;
//! the overseer closing the connection marks the end of a response.
//!
//! The overseer-side parser is deliberately permissive: an empty frame,
//! a flag with no value, or an operand that does not parse simply
//! produces no work. The strict checks live on the controller side,
//! where a violation is a usage error.

use crate::monitor::Aggregate;

/// Size of a request frame. The frame is path-sized because the longest
/// sensible payload is an executable path plus its arguments.
pub const FRAME_LEN: usize = 4096;

/// SIGTERM grace applied when the request carries no `-t` flag.
pub const DEFAULT_GRACE_SECS: u64 = 10;

/// A parsed request frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Exec(ExecSpec),
    /// `mem [PID]`; no pid means "all known pids".
    Query { pid: Option<libc::pid_t> },
    /// `memkill PERCENT` of total physical memory.
    Memkill { percent: f64 },
}

/// Everything the supervisor needs to run one child.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    /// Target and its arguments; `argv[0]` is the executable path.
    pub argv: Vec<String>,
    /// `-o`: append-mode redirection of the child's stdout and stderr.
    pub out_file: Option<String>,
    /// `-log`: append-mode sink for the supervision log lines.
    pub log_file: Option<String>,
    /// `-t`: seconds the child may run before SIGTERM.
    pub grace_secs: u64,
}

impl ExecSpec {
    pub fn file(&self) -> &str {
        &self.argv[0]
    }

    /// The space-joined command line recorded in every memory sample.
    pub fn argv_joined(&self) -> String {
        self.argv.join(" ")
    }
}

/// Parse one request frame. `None` means the request produces no work.
pub fn parse_request(frame: &[u8]) -> Option<Command> {
    let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
    let text = String::from_utf8_lossy(&frame[..end]);
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let first = *tokens.first()?;

    match first {
        "mem" => {
            // A non-numeric operand degenerates to "all pids", the same
            // way atoi degenerates to 0.
            let pid = tokens
                .get(1)
                .and_then(|tok| tok.parse::<libc::pid_t>().ok())
                .filter(|&pid| pid != 0);
            Some(Command::Query { pid })
        }
        "memkill" => {
            let percent = tokens.get(1)?.parse::<f64>().unwrap_or(0.0);
            Some(Command::Memkill { percent })
        }
        _ => parse_exec(&tokens),
    }
}

fn parse_exec(tokens: &[&str]) -> Option<Command> {
    let mut at = 0;
    let mut out_file = None;
    let mut log_file = None;
    let mut grace_secs = DEFAULT_GRACE_SECS;

    // Flag prefix, in exactly this order, each at most once.
    if tokens.get(at) == Some(&"-o") {
        out_file = Some(tokens.get(at + 1)?.to_string());
        at += 2;
    }
    if tokens.get(at) == Some(&"-log") {
        log_file = Some(tokens.get(at + 1)?.to_string());
        at += 2;
    }
    if tokens.get(at) == Some(&"-t") {
        grace_secs = tokens.get(at + 1)?.parse().unwrap_or(0);
        at += 2;
    }

    let argv: Vec<String> = tokens[at..].iter().map(|tok| tok.to_string()).collect();
    if argv.is_empty() {
        return None;
    }
    Some(Command::Exec(ExecSpec {
        argv,
        out_file,
        log_file,
        grace_secs,
    }))
}

/// `TIMESTAMP BYTES` per sample, append order.
pub fn encode_samples(samples: &[(String, u64)]) -> String {
    let mut body = String::new();
    for (when, bytes) in samples {
        body.push_str(&format!("{} {}\n", when, bytes));
    }
    body
}

/// `PID BYTES ARGV` per known pid, first-seen order.
pub fn encode_aggregates(aggregates: &[Aggregate]) -> String {
    let mut body = String::new();
    for agg in aggregates {
        body.push_str(&format!("{} {} {}\n", agg.pid, agg.bytes, agg.argv));
    }
    body
}

/// Build the fixed-size frame the controller transmits. `None` when the
/// payload (plus its NUL) does not fit.
pub fn frame(payload: &str) -> Option<[u8; FRAME_LEN]> {
    let bytes = payload.as_bytes();
    if bytes.len() >= FRAME_LEN {
        return None;
    }
    let mut frame = [0u8; FRAME_LEN];
    frame[..bytes.len()].copy_from_slice(bytes);
    Some(frame)
}

/// The controller's CLI was not a well-formed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageError;

/// Which of the three request shapes the controller is sending; `Mem`
/// is the only one that reads a response body back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Exec,
    Mem,
    Memkill,
}

/// Strict validation of the controller's command tokens: flag order
/// enforced, `-o` and `-log` at most once, `-t` a non-negative integer,
/// `memkill` a non-negative percentage.
pub fn validate_controller_tokens(tokens: &[String]) -> Result<RequestKind, UsageError> {
    let first = tokens.first().ok_or(UsageError)?;
    match first.as_str() {
        "mem" => {
            if tokens.len() > 2 {
                return Err(UsageError);
            }
            Ok(RequestKind::Mem)
        }
        "memkill" => {
            let percent = tokens.get(1).ok_or(UsageError)?;
            match percent.parse::<f64>() {
                Ok(p) if p >= 0.0 && tokens.len() == 2 => Ok(RequestKind::Memkill),
                _ => Err(UsageError),
            }
        }
        _ => {
            let mut at = 0;
            for flag in &["-o", "-log", "-t"] {
                if tokens.get(at).map(String::as_str) == Some(*flag) {
                    let value = tokens.get(at + 1).ok_or(UsageError)?;
                    if *flag == "-t" && value.parse::<u64>().is_err() {
                        return Err(UsageError);
                    }
                    at += 2;
                }
            }
            // Out-of-order or repeated flags surface here: the tail
            // must start with the executable, not another flag token.
            match tokens.get(at).map(String::as_str) {
                None | Some("-o") | Some("-log") | Some("-t") => Err(UsageError),
                Some(_) => Ok(RequestKind::Exec),
            }
        }
    }
}
