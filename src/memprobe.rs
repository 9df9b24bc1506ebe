//! The memory-usage probe: how much memory a child is "using".
//!
//! The definition used throughout the system is the sum of the sizes of
//! the child's anonymous virtual memory regions — every region of
//! `/proc/<pid>/maps` whose inode field is 0, i.e. with no backing file.
//! File-backed regions (the executable's code, shared libraries) are
//! excluded.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::mem;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The per-process memory map could not be read, most commonly
    /// because the child has already exited.
    #[error("could not read memory map for pid {pid}: {source}")]
    Maps {
        pid: libc::pid_t,
        #[source]
        source: io::Error,
    },

    #[error("sysinfo failed: {0}")]
    Sysinfo(#[source] Errno),
}

/// Anonymous-region byte usage of `pid`.
pub fn mem_used(pid: Pid) -> Result<u64, ProbeError> {
    let path = format!("/proc/{}/maps", pid);
    let file = File::open(&path).map_err(|source| ProbeError::Maps {
        pid: pid.as_raw(),
        source,
    })?;
    Ok(anonymous_bytes(BufReader::new(file)))
}

/// Total physical memory in bytes, the base of memkill's percentage
/// threshold.
pub fn total_physical_ram() -> Result<u64, ProbeError> {
    let mut info: libc::sysinfo = unsafe { mem::zeroed() };
    let rc = unsafe { libc::sysinfo(&mut info) };
    if rc != 0 {
        return Err(ProbeError::Sysinfo(Errno::last()));
    }
    Ok(info.totalram as u64 * info.mem_unit as u64)
}

/// Sum `end - start` over every maps line whose inode field is 0.
///
/// A maps line is `START-END PERMS OFFSET DEV INODE [PATH]`. Lines that
/// do not parse are skipped; the kernel may rewrite the file under us
/// while the child runs.
fn anonymous_bytes(reader: impl BufRead) -> u64 {
    let mut total = 0u64;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let mut fields = line.split_whitespace();
        let range = match fields.next() {
            Some(range) => range,
            None => continue,
        };
        // perms, offset, dev, then the inode
        let inode = match fields.nth(3) {
            Some(inode) => inode,
            None => continue,
        };
        if inode != "0" {
            continue;
        }
        let mut bounds = range.splitn(2, '-');
        let start = bounds.next().and_then(|s| u64::from_str_radix(s, 16).ok());
        let end = bounds.next().and_then(|s| u64::from_str_radix(s, 16).ok());
        if let (Some(start), Some(end)) = (start, end) {
            total += end.saturating_sub(start);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/dbus-daemon
00651000-00652000 r--p 00051000 08:02 173521 /usr/bin/dbus-daemon
00e03000-00e24000 rw-p 00000000 00:00 0 [heap]
7f3b85e00000-7f3b85e21000 rw-p 00000000 00:00 0
7f3b86000000-7f3b861c0000 r-xp 00000000 08:02 135522 /usr/lib/libc-2.31.so
7ffc22aa0000-7ffc22ac1000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn sums_only_inode_zero_regions() {
        // heap 0x21000 + anon 0x21000 + stack 0x21000
        assert_eq!(anonymous_bytes(MAPS.as_bytes()), 3 * 0x21000);
    }

    #[test]
    fn empty_map_is_zero() {
        assert_eq!(anonymous_bytes("".as_bytes()), 0);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let text = "garbage\n00e03000-00e24000 rw-p 00000000 00:00 0\n";
        assert_eq!(anonymous_bytes(text.as_bytes()), 0x21000);
    }

    #[test]
    fn probe_of_dead_pid_fails() {
        // pid 0 never has a maps file of its own
        assert!(mem_used(Pid::from_raw(0)).is_err());
    }

    #[test]
    fn total_ram_is_positive() {
        assert!(total_physical_ram().unwrap() > 0);
    }
}
