//! The supervision event log: the externally-observable lines test
//! harnesses assert on, byte for byte. Distinct from the `log` crate's
//! diagnostics, which are free-form and go wherever `env_logger` points
//! them.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

/// Sink for supervision lines: an append-only file when the request
/// carried `-log`, the overseer's stdout otherwise.
#[derive(Debug)]
pub enum EventLog {
    Stdout,
    File(File),
}

impl EventLog {
    /// Open the sink a request asked for.
    pub fn open(path: Option<&str>) -> io::Result<EventLog> {
        match path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(EventLog::File(file))
            }
            None => Ok(EventLog::Stdout),
        }
    }

    pub fn stdout() -> EventLog {
        EventLog::Stdout
    }

    /// Write one `\n`-terminated line and flush it, so lines land in
    /// the order events happen even across processes tailing the file.
    pub fn line(&mut self, message: &str) -> io::Result<()> {
        match self {
            EventLog::Stdout => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                writeln!(handle, "{}", message)?;
                handle.flush()
            }
            EventLog::File(file) => {
                writeln!(file, "{}", message)?;
                file.flush()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let path_str = path.to_str().unwrap();
        {
            let mut log = EventLog::open(Some(path_str)).unwrap();
            log.line("first").unwrap();
        }
        {
            // reopening must append, not truncate
            let mut log = EventLog::open(Some(path_str)).unwrap();
            log.line("second").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(EventLog::open(Some("/no/such/dir/events.log")).is_err());
    }
}
