use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{Result, ShmemLibError};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A spawned responder. Killed and reaped on drop if it is still running.
pub struct ResponderProcess {
    child: Child,
    program: PathBuf,
    exited: bool,
}

impl ResponderProcess {
    pub fn spawn(program: &Path, command: &mut Command) -> Result<ResponderProcess> {
        let child = command.spawn().map_err(|source| ShmemLibError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
        debug!(program = %program.display(), pid = child.id(), "responder spawned");
        Ok(ResponderProcess {
            child,
            program: program.to_path_buf(),
            exited: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_alive(&mut self) -> bool {
        !self.exited && matches!(self.child.try_wait(), Ok(None))
    }

    /// Error for a responder that went away in the middle of a session.
    pub(crate) fn departure(&mut self) -> ShmemLibError {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exited = true;
                warn!(program = %self.program.display(), %status, "responder exited mid-session");
                if status.success() {
                    ShmemLibError::Disconnected
                } else {
                    ShmemLibError::ResponderFailed(status)
                }
            }
            Ok(None) => ShmemLibError::Disconnected,
            Err(e) => ShmemLibError::Io(e),
        }
    }

    pub(crate) fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub(crate) fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Waits up to `timeout` for the responder to exit on its own.
    ///
    /// On expiry the process is killed and `ExitTimeout` returned; a non-zero
    /// exit is reported as `ResponderFailed`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.exited = true;
                debug!(program = %self.program.display(), %status, "responder exited");
                return if status.success() {
                    Ok(status)
                } else {
                    Err(ShmemLibError::ResponderFailed(status))
                };
            }
            if Instant::now() >= deadline {
                warn!(
                    program = %self.program.display(),
                    pid = self.child.id(),
                    "responder did not exit in time, killing it"
                );
                self.kill();
                return Err(ShmemLibError::ExitTimeout(timeout));
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    pub fn kill(&mut self) {
        if self.exited {
            return;
        }
        if let Err(e) = self.child.kill() {
            // InvalidInput means the process was already reaped.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("Failed to kill responder: {}", e);
            }
        }
        let _ = self.child.wait();
        self.exited = true;
    }
}

impl Drop for ResponderProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
        }
    }
}
