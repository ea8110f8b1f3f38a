use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tempfile::{Builder, TempDir};
use tracing::debug;

use crate::channel::{DriverSide, Endpoint, Turn};
use crate::core::{OwnershipFlag, ShmemConfig};
use crate::errors::{Result, ShmemLibError};
use crate::process::ResponderProcess;
use crate::protocol::{PING, PONG, QUIT, READY};

pub const SEGMENT_FILE_NAME: &str = "shared.mem";

/// Idle polls between two checks that the responder process is still running.
const LIVENESS_CHECK_POLLS: u32 = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
    pub exit_timeout_ms: u64,
    /// Extra arguments for the shared-memory responder, placed before the segment path.
    pub responder_args: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            ready_attempts: 100,
            ready_interval_ms: 10,
            exit_timeout_ms: 2000,
            responder_args: Vec::new(),
        }
    }
}

impl DriverConfig {
    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }
}

/// Driver-side view of one request/response session, whatever the transport.
pub trait PingPong {
    fn transport(&self) -> &'static str;

    /// Sends `request` and returns the responder's reply.
    fn round_trip(&mut self, request: &str) -> Result<String>;

    /// One `ping`; anything but `pong` is a hard failure.
    fn ping(&mut self) -> Result<()> {
        expect_reply(PONG, self.round_trip(PING)?)
    }

    /// Sends `quit` and waits for the responder to exit.
    fn shutdown(self: Box<Self>) -> Result<ExitStatus>;
}

pub(crate) fn expect_reply(expected: &str, actual: String) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(ShmemLibError::UnexpectedReply {
            expected: expected.to_string(),
            actual,
        })
    }
}

pub(crate) fn session_dir() -> Result<TempDir> {
    Ok(Builder::new().prefix("ipcbench").tempdir()?)
}

/// Shared-memory session: owns the responder process, the mapping and the
/// temporary directory holding the backing file.
///
/// Field order is drop order: the responder is reaped before the segment is
/// unmapped and the directory removed.
pub struct MmapSession {
    process: ResponderProcess,
    endpoint: Endpoint<DriverSide>,
    exit_timeout: Duration,
    _dir: TempDir,
}

impl MmapSession {
    /// Creates the segment, starts `program <segment-file>` and completes the
    /// readiness handshake.
    pub fn spawn(program: &Path, shmem: &ShmemConfig, driver: &DriverConfig) -> Result<MmapSession> {
        let dir = session_dir()?;
        let path = dir.path().join(SEGMENT_FILE_NAME);
        let endpoint = Endpoint::<DriverSide>::create(&path, shmem)?;

        let process = ResponderProcess::spawn(
            program,
            Command::new(program)
                .args(&driver.responder_args)
                .arg(&path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit()),
        )?;

        let mut session = MmapSession {
            process,
            endpoint,
            exit_timeout: driver.exit_timeout(),
            _dir: dir,
        };
        session.handshake(driver)?;
        Ok(session)
    }

    fn handshake(&mut self, driver: &DriverConfig) -> Result<()> {
        for attempt in 0..driver.ready_attempts {
            if self.endpoint.flag() == Some(OwnershipFlag::ResponderOwnsBuffer) {
                debug!(attempt, "responder signalled readiness");
                break;
            }
            thread::sleep(driver.ready_interval());
        }
        let token = match self.endpoint.try_turn() {
            Some(turn) => turn.message(),
            None => {
                return Err(ShmemLibError::NotReady {
                    attempts: driver.ready_attempts,
                })
            }
        };
        if token != READY {
            return Err(ShmemLibError::UnexpectedReply {
                expected: READY.to_string(),
                actual: token,
            });
        }
        Ok(())
    }

    pub fn segment_path(&self) -> &Path {
        self.endpoint.path()
    }

    pub fn flag(&self) -> Option<OwnershipFlag> {
        self.endpoint.flag()
    }

    pub fn responder_pid(&self) -> u32 {
        self.process.pid()
    }

    /// Publishes `quit`. The responder exits without handing the buffer back.
    pub fn send_quit(&mut self) -> Result<()> {
        self.await_turn()?.publish(QUIT);
        Ok(())
    }

    /// Waits for the buffer, failing once the responder process is gone.
    fn await_turn(&mut self) -> Result<Turn<'_, DriverSide>> {
        let process = &mut self.process;
        match self
            .endpoint
            .wait_turn_while(LIVENESS_CHECK_POLLS, || process.is_alive())
        {
            Some(turn) => Ok(turn),
            None => Err(self.process.departure()),
        }
    }

    pub fn wait_for_exit(&mut self, timeout: Duration) -> Result<ExitStatus> {
        self.process.wait_timeout(timeout)
    }
}

impl PingPong for MmapSession {
    fn transport(&self) -> &'static str {
        "mmap"
    }

    fn round_trip(&mut self, request: &str) -> Result<String> {
        self.await_turn()?.publish(request);
        Ok(self.await_turn()?.message())
    }

    fn shutdown(mut self: Box<Self>) -> Result<ExitStatus> {
        self.send_quit()?;
        let timeout = self.exit_timeout;
        self.wait_for_exit(timeout)
    }
}
