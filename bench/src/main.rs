use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shmem::core::ShmemConfig;
use shmem::driver::{DriverConfig, MmapSession, PingPong};
use shmem::stream::{StdioSession, TcpSession};

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ArgEnum)]
enum Transport {
    Mmap,
    Stdio,
    Tcp,
    Unix,
    All,
}

impl Transport {
    fn expand(self) -> Vec<Transport> {
        match self {
            Transport::All => vec![Transport::Mmap, Transport::Stdio, Transport::Tcp, Transport::Unix],
            one => vec![one],
        }
    }

    fn responder_name(self) -> &'static str {
        match self {
            Transport::Mmap => "mmap-responder",
            Transport::Stdio => "stdio-responder",
            Transport::Tcp => "tcp-responder",
            Transport::Unix => "unix-responder",
            Transport::All => unreachable!("expanded before use"),
        }
    }
}

#[derive(clap::Parser)]
#[clap(about = "Measures ping/pong round-trip latency across IPC transports")]
struct Opts {
    #[clap(short = 'c', long = "config")]
    config: Option<PathBuf>,
    #[clap(short = 't', long = "transport", arg_enum, default_value = "all")]
    transport: Transport,
    #[clap(short = 'n', long = "iterations")]
    iterations: Option<u64>,
    /// Directory holding the responder binaries; defaults to this executable's directory.
    #[clap(long = "bin-dir")]
    bin_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    shmem: ShmemConfig,
    driver: DriverConfig,
    iterations: u64,
    bin_dir: Option<String>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            shmem: ShmemConfig::default(),
            driver: DriverConfig::default(),
            iterations: 100_000,
            bin_dir: None,
        }
    }
}

struct Report {
    transport: &'static str,
    iterations: u64,
    elapsed: Duration,
}

impl Report {
    fn print(&self) {
        let nanos_per_op = self.elapsed.as_nanos() as f64 / self.iterations.max(1) as f64;
        let ops = self.iterations as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "{:<6} {:>10} round trips  {:>10.0} ns/op  {:>8}K ops/s  total {:#?}",
            self.transport,
            self.iterations,
            nanos_per_op,
            (ops / 1000f64) as u64,
            self.elapsed
        );
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(Opts::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let mut cfg: BenchConfig = match &opts.config {
        Some(path) => confy::load_path(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => BenchConfig::default(),
    };
    if let Some(iterations) = opts.iterations {
        cfg.iterations = iterations;
    }
    cfg.shmem.validate()?;

    let bin_dir = match opts.bin_dir.clone().or_else(|| cfg.bin_dir.clone().map(PathBuf::from)) {
        Some(dir) => dir,
        None => env::current_exe()?
            .parent()
            .map(Path::to_path_buf)
            .context("cannot locate the benchmark executable directory")?,
    };

    let mut failures = 0;
    for transport in opts.transport.expand() {
        match bench(transport, &bin_dir, &cfg) {
            Ok(report) => report.print(),
            Err(e) => {
                error!(?transport, "benchmark failed: {:#}", e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{} transport(s) failed", failures);
    }
    Ok(())
}

fn spawn(transport: Transport, program: &Path, cfg: &BenchConfig) -> shmem::Result<Box<dyn PingPong>> {
    let session: Box<dyn PingPong> = match transport {
        Transport::Mmap => Box::new(MmapSession::spawn(program, &cfg.shmem, &cfg.driver)?),
        Transport::Stdio => Box::new(StdioSession::spawn(program, &cfg.driver)?),
        Transport::Tcp => Box::new(TcpSession::spawn(program, &cfg.driver)?),
        #[cfg(unix)]
        Transport::Unix => Box::new(shmem::stream::UnixSession::spawn(program, &cfg.driver)?),
        #[cfg(not(unix))]
        Transport::Unix => {
            return Err(shmem::ShmemLibError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix domain sockets are not available",
            )))
        }
        Transport::All => unreachable!("expanded before use"),
    };
    Ok(session)
}

fn bench(transport: Transport, bin_dir: &Path, cfg: &BenchConfig) -> anyhow::Result<Report> {
    let program = bin_dir.join(format!("{}{}", transport.responder_name(), env::consts::EXE_SUFFIX));
    let mut session = spawn(transport, &program, cfg)
        .with_context(|| format!("cannot start {}", program.display()))?;
    info!(transport = session.transport(), iterations = cfg.iterations, "session ready");

    let start = Instant::now();
    for i in 0..cfg.iterations {
        session
            .ping()
            .with_context(|| format!("round trip {} failed", i))?;
    }
    let elapsed = start.elapsed();

    let name = session.transport();
    session.shutdown().context("responder teardown failed")?;
    Ok(Report {
        transport: name,
        iterations: cfg.iterations,
        elapsed,
    })
}
