//! Line-oriented transports: standard streams, loopback TCP and Unix sockets.
//!
//! The kernel's stream semantics do all the synchronisation here, so both the
//! server loop and the client are plain blocking reads and writes of
//! newline-terminated ASCII.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

#[cfg(unix)]
use tempfile::TempDir;
use tracing::{debug, warn};

#[cfg(unix)]
use crate::driver::session_dir;
use crate::driver::{expect_reply, DriverConfig, PingPong};
use crate::errors::{Result, ShmemLibError};
use crate::process::ResponderProcess;
use crate::protocol::{self, Shutdown, QUIT, READY};

pub const SOCKET_FILE_NAME: &str = "plugin.sock";

/// Answers newline-terminated commands read from `reader` on `writer`.
///
/// Surrounding whitespace is trimmed. Unknown commands are logged and get no
/// reply at all on a stream transport.
pub fn serve_lines<R: BufRead, W: Write>(reader: R, mut writer: W) -> io::Result<Shutdown> {
    for line in reader.lines() {
        let line = line?;
        let request = line.trim();
        match protocol::Command::parse(request) {
            protocol::Command::Quit => return Ok(Shutdown::Quit),
            protocol::Command::Ping => {
                writeln!(writer, "{}", protocol::PONG)?;
                writer.flush()?;
            }
            protocol::Command::Unknown(other) => warn!("Unknown command: {}", other),
        }
    }
    Ok(Shutdown::EndOfInput)
}

/// Prints the readiness token on stdout for the socket responders.
pub fn announce_ready() -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", READY)?;
    stdout.flush()
}

/// Client half of the line protocol.
pub struct LineClient<R, W> {
    reader: R,
    writer: W,
    line: String,
}

impl<R: BufRead, W: Write> LineClient<R, W> {
    pub fn new(reader: R, writer: W) -> LineClient<R, W> {
        LineClient {
            reader,
            writer,
            line: String::with_capacity(16),
        }
    }

    pub fn send(&mut self, request: &str) -> Result<()> {
        writeln!(self.writer, "{}", request)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn receive(&mut self) -> Result<String> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Err(ShmemLibError::Disconnected);
        }
        Ok(self.line.trim_end().to_string())
    }

    pub fn round_trip(&mut self, request: &str) -> Result<String> {
        self.send(request)?;
        self.receive()
    }
}

fn wait_ready(process: &mut ResponderProcess) -> Result<()> {
    let stdout = process.take_stdout().ok_or(ShmemLibError::Disconnected)?;
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line)?;
    expect_reply(READY, line.trim_end().to_string())
}

fn finish<R: BufRead, W: Write>(
    client: &mut LineClient<R, W>,
    process: &mut ResponderProcess,
    timeout: Duration,
) -> Result<ExitStatus> {
    client.send(QUIT)?;
    process.wait_timeout(timeout)
}

/// Responder driven over its own stdin/stdout.
pub struct StdioSession {
    process: ResponderProcess,
    client: LineClient<BufReader<ChildStdout>, ChildStdin>,
    exit_timeout: Duration,
}

impl StdioSession {
    pub fn spawn(program: &Path, driver: &DriverConfig) -> Result<StdioSession> {
        let mut process = ResponderProcess::spawn(
            program,
            Command::new(program)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit()),
        )?;
        let stdin = process.take_stdin().ok_or(ShmemLibError::Disconnected)?;
        let stdout = process.take_stdout().ok_or(ShmemLibError::Disconnected)?;
        Ok(StdioSession {
            process,
            client: LineClient::new(BufReader::new(stdout), stdin),
            exit_timeout: driver.exit_timeout(),
        })
    }
}

impl PingPong for StdioSession {
    fn transport(&self) -> &'static str {
        "stdio"
    }

    fn round_trip(&mut self, request: &str) -> Result<String> {
        self.client.round_trip(request)
    }

    fn shutdown(mut self: Box<Self>) -> Result<ExitStatus> {
        let timeout = self.exit_timeout;
        let session = &mut *self;
        finish(&mut session.client, &mut session.process, timeout)
    }
}

/// Asks the kernel for a free loopback port.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Responder listening on a loopback TCP port passed as its only argument.
pub struct TcpSession {
    process: ResponderProcess,
    client: LineClient<BufReader<TcpStream>, TcpStream>,
    exit_timeout: Duration,
}

impl TcpSession {
    pub fn spawn(program: &Path, driver: &DriverConfig) -> Result<TcpSession> {
        let port = free_port()?;
        let mut process = ResponderProcess::spawn(
            program,
            Command::new(program)
                .arg(port.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit()),
        )?;
        wait_ready(&mut process)?;

        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        debug!(port, "connected to tcp responder");
        Ok(TcpSession {
            process,
            client: LineClient::new(reader, stream),
            exit_timeout: driver.exit_timeout(),
        })
    }
}

impl PingPong for TcpSession {
    fn transport(&self) -> &'static str {
        "tcp"
    }

    fn round_trip(&mut self, request: &str) -> Result<String> {
        self.client.round_trip(request)
    }

    fn shutdown(mut self: Box<Self>) -> Result<ExitStatus> {
        let timeout = self.exit_timeout;
        let session = &mut *self;
        finish(&mut session.client, &mut session.process, timeout)
    }
}

/// Responder listening on a Unix domain socket inside a private temp dir.
#[cfg(unix)]
pub struct UnixSession {
    process: ResponderProcess,
    client: LineClient<BufReader<UnixStream>, UnixStream>,
    exit_timeout: Duration,
    dir: TempDir,
}

#[cfg(unix)]
impl UnixSession {
    pub fn spawn(program: &Path, driver: &DriverConfig) -> Result<UnixSession> {
        let dir = session_dir()?;
        let socket_path = dir.path().join(SOCKET_FILE_NAME);
        let mut process = ResponderProcess::spawn(
            program,
            Command::new(program)
                .arg(&socket_path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit()),
        )?;
        wait_ready(&mut process)?;

        let stream = UnixStream::connect(&socket_path)?;
        let reader = BufReader::new(stream.try_clone()?);
        debug!(path = %socket_path.display(), "connected to unix responder");
        Ok(UnixSession {
            process,
            client: LineClient::new(reader, stream),
            exit_timeout: driver.exit_timeout(),
            dir,
        })
    }

    pub fn socket_path(&self) -> std::path::PathBuf {
        self.dir.path().join(SOCKET_FILE_NAME)
    }
}

#[cfg(unix)]
impl PingPong for UnixSession {
    fn transport(&self) -> &'static str {
        "unix"
    }

    fn round_trip(&mut self, request: &str) -> Result<String> {
        self.client.round_trip(request)
    }

    fn shutdown(mut self: Box<Self>) -> Result<ExitStatus> {
        let timeout = self.exit_timeout;
        let session = &mut *self;
        finish(&mut session.client, &mut session.process, timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn answers_pings_and_skips_unknown() -> io::Result<()> {
        let input = Cursor::new("ping\n  ping  \nhello\nping\nquit\nping\n");
        let mut output = Vec::new();
        let shutdown = serve_lines(input, &mut output)?;
        assert_eq!(shutdown, Shutdown::Quit);
        assert_eq!(String::from_utf8_lossy(&output), "pong\npong\npong\n");
        Ok(())
    }

    #[test]
    fn end_of_input_ends_the_session() -> io::Result<()> {
        let mut output = Vec::new();
        assert_eq!(serve_lines(Cursor::new("ping"), &mut output)?, Shutdown::EndOfInput);
        assert_eq!(output, b"pong\n");
        Ok(())
    }

    #[test]
    fn client_reports_disconnect() {
        let mut client = LineClient::new(Cursor::new(""), Vec::new());
        assert!(matches!(client.round_trip("ping"), Err(ShmemLibError::Disconnected)));
        assert_eq!(client.writer, b"ping\n");
    }

    #[test]
    fn client_trims_line_endings() -> Result<()> {
        let mut client = LineClient::new(Cursor::new("pong\r\npong\n"), Vec::new());
        assert_eq!(client.round_trip("ping")?, "pong");
        assert_eq!(client.round_trip("ping")?, "pong");
        Ok(())
    }

    #[test]
    fn free_port_is_bindable() -> Result<()> {
        let port = free_port()?;
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        Ok(())
    }
}
