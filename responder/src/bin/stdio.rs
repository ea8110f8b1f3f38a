use std::io;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use shmem::stream::serve_lines;

#[derive(clap::Parser)]
#[clap(about = "Answers ping requests read line by line from stdin")]
struct Opts {}

fn main() -> ExitCode {
    responder::init_tracing();
    let _opts = Opts::parse();
    responder::exit_code(run())
}

fn run() -> anyhow::Result<()> {
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    let shutdown = serve_lines(stdin, stdout).context("error reading stdin")?;
    debug!(?shutdown, "stdio responder finished");
    Ok(())
}
