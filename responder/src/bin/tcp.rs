use std::io::BufReader;
use std::net::{Ipv4Addr, TcpListener};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use shmem::stream::{announce_ready, serve_lines};

#[derive(clap::Parser)]
#[clap(about = "Answers ping requests from a single loopback TCP connection")]
struct Opts {
    port: u16,
}

fn main() -> ExitCode {
    responder::init_tracing();
    responder::exit_code(run(Opts::parse()))
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, opts.port))
        .with_context(|| format!("failed to listen on port {}", opts.port))?;
    announce_ready()?;

    let (stream, peer) = listener.accept().context("failed to accept connection")?;
    stream.set_nodelay(true)?;
    debug!(%peer, "connection accepted");
    let reader = BufReader::new(stream.try_clone()?);
    let shutdown = serve_lines(reader, stream).context("error reading connection")?;
    debug!(?shutdown, "tcp responder finished");
    Ok(())
}
