use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShmemLibError>;

#[derive(Debug, Error)]
pub enum ShmemLibError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The segment backing file could not be created or opened.
    #[error("cannot open segment file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("cannot map segment file {}: {source}", path.display())]
    Map { path: PathBuf, source: io::Error },

    #[error("segment file {} is {actual} bytes, need at least {expected}", path.display())]
    SegmentTooSmall {
        path: PathBuf,
        actual: u64,
        expected: usize,
    },

    #[error("invalid segment layout: {0}")]
    Layout(String),

    /// The responder found the ownership flag already set when attaching.
    #[error("segment already in use (ownership flag = {0})")]
    SegmentInUse(u32),

    #[error("responder did not signal ready after {attempts} attempts")]
    NotReady { attempts: u32 },

    #[error("unexpected reply: expected {expected:?}, got {actual:?}")]
    UnexpectedReply { expected: String, actual: String },

    #[error("responder closed the connection")]
    Disconnected,

    #[error("cannot spawn responder {}: {source}", program.display())]
    Spawn { program: PathBuf, source: io::Error },

    #[error("responder did not exit within {0:?}")]
    ExitTimeout(Duration),

    #[error("responder exited with {0}")]
    ResponderFailed(ExitStatus),
}
