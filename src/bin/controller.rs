use std::io::{self, Write};
use std::net::TcpStream;
use std::process;

use structopt::clap::AppSettings;
use structopt::StructOpt;

use overseer::wire::{self, RequestKind};

const USAGE: &str = "controller <address> <port> {[-o out_file] [-log log_file] [-t seconds] <file> [arg...] | mem [pid] | memkill <percent>}";

/// The short-lived client: validates one command, ships it to the
/// overseer in a single frame, and prints the response if the command
/// has one.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "controller",
    usage = USAGE,
    setting = AppSettings::AllowLeadingHyphen,
    setting = AppSettings::TrailingVarArg
)]
struct Opts {
    /// Overseer host name or IPv4 address.
    address: String,
    /// Overseer TCP port.
    port: u16,
    /// The command: an executable with optional flags, `mem [pid]`, or
    /// `memkill <percent>`.
    #[structopt(required = true)]
    command: Vec<String>,
}

fn main() {
    env_logger::init();
    let opts = Opts::from_args();

    let kind = match wire::validate_controller_tokens(&opts.command) {
        Ok(kind) => kind,
        Err(_) => usage_exit(),
    };

    let payload = opts.command.join(" ");
    let frame = match wire::frame(&payload) {
        Some(frame) => frame,
        None => usage_exit(),
    };

    let mut conn = match TcpStream::connect((opts.address.as_str(), opts.port)) {
        Ok(conn) => conn,
        Err(_) => {
            eprintln!(
                "Could not connect to overseer at {} {}",
                opts.address, opts.port
            );
            process::exit(1);
        }
    };

    if let Err(err) = conn.write_all(&frame) {
        eprintln!("controller: could not send request: {}", err);
        process::exit(1);
    }

    // Only mem answers over the wire; the overseer closing the
    // connection is the end of the response.
    if kind == RequestKind::Mem {
        let stdout = io::stdout();
        if let Err(err) = io::copy(&mut conn, &mut stdout.lock()) {
            eprintln!("controller: could not read response: {}", err);
            process::exit(1);
        }
    }
}

fn usage_exit() -> ! {
    eprintln!("Usage: {}", USAGE);
    process::exit(1);
}
