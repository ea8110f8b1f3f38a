use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::info;

use shmem::core::ShmemConfig;
use shmem::responder::Responder;

#[derive(clap::Parser)]
#[clap(about = "Answers ping requests through a file-backed shared memory page")]
struct Opts {
    /// File backing the shared page, created and sized by the driver.
    segment: PathBuf,
    #[clap(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    responder::init_tracing();
    responder::exit_code(run(Opts::parse()))
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let cfg: ShmemConfig = match &opts.config {
        Some(path) => confy::load_path(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => ShmemConfig::default(),
    };

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .context("cannot install signal handler")?;
    }

    let mut responder = Responder::attach(&opts.segment, &cfg)
        .with_context(|| format!("cannot map segment {}", opts.segment.display()))?;
    let shutdown = responder.run(&stop)?;
    info!(?shutdown, handled = responder.handled(), "responder finished");
    Ok(())
}
