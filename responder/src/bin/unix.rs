use std::process::ExitCode;

use clap::Parser;

#[derive(clap::Parser)]
#[clap(about = "Answers ping requests from a single Unix domain socket connection")]
struct Opts {
    socket: std::path::PathBuf,
}

fn main() -> ExitCode {
    responder::init_tracing();
    responder::exit_code(run(Opts::parse()))
}

#[cfg(unix)]
fn run(opts: Opts) -> anyhow::Result<()> {
    use std::fs;
    use std::io::BufReader;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;

    use anyhow::Context;
    use tracing::{debug, warn};

    use shmem::stream::{announce_ready, serve_lines};

    /// Removes the socket file however the session ends.
    struct SocketGuard(PathBuf);

    impl Drop for SocketGuard {
        fn drop(&mut self) {
            if let Err(e) = fs::remove_file(&self.0) {
                warn!("Failed to remove socket {}: {}", self.0.display(), e);
            }
        }
    }

    let listener = UnixListener::bind(&opts.socket)
        .with_context(|| format!("failed to listen on socket {}", opts.socket.display()))?;
    let _guard = SocketGuard(opts.socket.clone());
    announce_ready()?;

    let (stream, _) = listener.accept().context("failed to accept connection")?;
    let reader = BufReader::new(stream.try_clone()?);
    let shutdown = serve_lines(reader, stream).context("error reading connection")?;
    debug!(?shutdown, "unix responder finished");
    Ok(())
}

#[cfg(not(unix))]
fn run(opts: Opts) -> anyhow::Result<()> {
    anyhow::bail!("unix domain sockets are not available ({})", opts.socket.display())
}
