use anyhow::Context;
use log::info;
use structopt::StructOpt;

use overseer::server::Overseer;

/// The supervising daemon: listens for controller connections and
/// executes, monitors and terminates child programs on their behalf.
#[derive(Debug, StructOpt)]
#[structopt(name = "overseer")]
struct Opts {
    /// TCP port to listen on.
    port: u16,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::from_args();

    let overseer = Overseer::bind(opts.port)
        .with_context(|| format!("could not bind port {}", opts.port))?;
    overseer
        .shutdown_token()
        .install_sigint_handler()
        .context("could not install SIGINT handler")?;

    info!("overseer starting on port {}", overseer.local_port());
    overseer.run().context("overseer failed")?;
    Ok(())
}
