//! Per-request dispatch: read one frame, pick an execution mode,
//! produce the response.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use log::{debug, info};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::clock;
use crate::context::OverseerContext;
use crate::error::Fatal;
use crate::event_log::EventLog;
use crate::memprobe;
use crate::request_queue::Request;
use crate::supervisor;
use crate::wire::{self, Command};

/// Handle one accepted connection to completion. Queries answer over
/// the connection; exec and memkill close it first and do their work
/// afterwards, so by the time a child runs the controller is long gone.
pub fn handle(request: Request, ctx: &OverseerContext) -> Result<(), Fatal> {
    let Request { peer, mut conn } = request;

    let mut frame = [0u8; wire::FRAME_LEN];
    read_frame(&mut conn, &mut frame).map_err(Fatal::Recv)?;
    let command = wire::parse_request(&frame);

    EventLog::stdout()
        .line(&format!(
            "{} - connection received from {}",
            clock::now(),
            peer.ip()
        ))
        .map_err(Fatal::LogWrite)?;

    match command {
        None => {
            // lenient parse: nothing recognizable means no work
            debug!("unparseable request from {}; dropping", peer);
            Ok(())
        }
        Some(Command::Query { pid }) => {
            let body = match pid {
                Some(pid) => wire::encode_samples(&ctx.store.samples_for(pid)),
                None => wire::encode_aggregates(&ctx.store.aggregates()),
            };
            conn.write_all(body.as_bytes()).map_err(Fatal::Send)?;
            Ok(())
        }
        Some(Command::Memkill { percent }) => {
            drop(conn);
            memkill(percent, ctx)
        }
        Some(Command::Exec(spec)) => {
            drop(conn);
            supervisor::run(&spec, ctx)
        }
    }
}

/// Read one fixed-size request frame: until the frame is full or the
/// peer half-closes.
fn read_frame(conn: &mut TcpStream, frame: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < frame.len() {
        match conn.read(&mut frame[filled..]) {
            Ok(0) => break,
            Ok(received) => filled += received,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// SIGKILL every monitored process whose most recent sample meets the
/// threshold. The sample can be up to a second stale and the pid can be
/// gone entirely, so delivery failures are ignored.
fn memkill(percent: f64, ctx: &OverseerContext) -> Result<(), Fatal> {
    let total = memprobe::total_physical_ram()?;
    let threshold = percent / 100.0 * total as f64;
    for agg in ctx.store.aggregates() {
        if agg.bytes as f64 >= threshold {
            info!(
                "memkill: {} ({} bytes) over {:.0}-byte threshold",
                agg.pid, agg.bytes, threshold
            );
            let _ = kill(Pid::from_raw(agg.pid), Signal::SIGKILL);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_at_one_hundred_percent_spares_everything_real() {
        // no process uses >= 100% of physical RAM, so the comparison
        // must come out false for any achievable sample
        let total = memprobe::total_physical_ram().unwrap();
        let threshold = 100.0 / 100.0 * total as f64;
        assert!(((total / 2) as f64) < threshold);
    }

    #[test]
    fn threshold_at_zero_percent_matches_every_sample() {
        assert!(0u64 as f64 >= 0.0 / 100.0 * 1u64 as f64);
    }
}
