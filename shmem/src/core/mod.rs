use std::fs::{File, OpenOptions};
use std::hint;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, ShmemLibError};

pub const PAGE_SIZE: usize = 4096;
pub const FLAG_OFFSET: usize = 0;
pub const FLAG_SIZE: usize = 4;
pub const MESSAGE_OFFSET: usize = 64;
pub const MESSAGE_LEN: usize = 32;

/// Value of the ownership flag word at `flag_offset`.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OwnershipFlag {
    Uninitialized = 0,
    ResponderOwnsBuffer = 1,
    RequestPending = 2,
}

impl OwnershipFlag {
    pub fn from_raw(raw: u32) -> Option<OwnershipFlag> {
        match raw {
            0 => Some(OwnershipFlag::Uninitialized),
            1 => Some(OwnershipFlag::ResponderOwnsBuffer),
            2 => Some(OwnershipFlag::RequestPending),
            _ => None,
        }
    }
}

/// How a waiting side burns time between two flag checks.
///
/// The first `spin_iterations` polls only issue a spin-loop hint. Every poll after
/// that sleeps for `yield_interval_ns`, or yields the time slice when it is zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinPolicy {
    pub spin_iterations: u32,
    pub yield_interval_ns: u64,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        SpinPolicy {
            spin_iterations: 64,
            yield_interval_ns: 100,
        }
    }
}

impl SpinPolicy {
    /// Pure busy-waiting, never leaves the CPU.
    pub fn busy() -> SpinPolicy {
        SpinPolicy {
            spin_iterations: u32::MAX,
            yield_interval_ns: 0,
        }
    }

    #[inline]
    pub(crate) fn idle(&self, round: &mut u32) {
        if *round < self.spin_iterations {
            *round += 1;
            hint::spin_loop();
        } else if self.yield_interval_ns == 0 {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_nanos(self.yield_interval_ns));
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub page_size: usize,
    pub flag_offset: usize,
    pub message_offset: usize,
    pub message_len: usize,
    pub spin: SpinPolicy,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            page_size: PAGE_SIZE,
            flag_offset: FLAG_OFFSET,
            message_offset: MESSAGE_OFFSET,
            message_len: MESSAGE_LEN,
            spin: SpinPolicy::default(),
        }
    }
}

impl ShmemConfig {
    /// Longest message that fits in the field next to its terminator.
    pub fn max_message_len(&self) -> usize {
        self.message_len.saturating_sub(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flag_offset % FLAG_SIZE != 0 {
            return Err(ShmemLibError::Layout(format!(
                "flag offset {} is not {}-byte aligned",
                self.flag_offset, FLAG_SIZE
            )));
        }
        if self.flag_offset + FLAG_SIZE > self.page_size {
            return Err(ShmemLibError::Layout(format!(
                "flag at {} does not fit in a {} byte page",
                self.flag_offset, self.page_size
            )));
        }
        if self.message_len < 2 {
            return Err(ShmemLibError::Layout(format!(
                "message field of {} bytes cannot hold a message and its terminator",
                self.message_len
            )));
        }
        if self.message_offset + self.message_len > self.page_size {
            return Err(ShmemLibError::Layout(format!(
                "message field {}..{} does not fit in a {} byte page",
                self.message_offset,
                self.message_offset + self.message_len,
                self.page_size
            )));
        }
        let flag_end = self.flag_offset + FLAG_SIZE;
        let message_end = self.message_offset + self.message_len;
        if self.flag_offset < message_end && self.message_offset < flag_end {
            return Err(ShmemLibError::Layout(
                "ownership flag overlaps the message field".to_string(),
            ));
        }
        Ok(())
    }
}

/// Zero-fills `field` and copies in as much of `message` as fits before the terminator.
///
/// Truncation never splits a UTF-8 character.
pub fn encode_message(field: &mut [u8], message: &str) -> usize {
    field.fill(0);
    let mut length = message.len().min(field.len().saturating_sub(1));
    while !message.is_char_boundary(length) {
        length -= 1;
    }
    field[..length].copy_from_slice(&message.as_bytes()[..length]);
    length
}

/// Bytes up to the first zero. A field without a terminator yields all but its last byte.
pub fn decode_message(field: &[u8]) -> String {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or_else(|| field.len().saturating_sub(1));
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// A mapped page laid out according to a [`ShmemConfig`].
pub(crate) struct Segment {
    mmap: MmapMut,
    cfg: ShmemConfig,
    path: PathBuf,
}

impl Segment {
    /// Creates (or truncates) the backing file, sizes it to one page and zero-fills it.
    pub(crate) fn create(path: &Path, cfg: &ShmemConfig) -> Result<Segment> {
        cfg.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| ShmemLibError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        file.set_len(cfg.page_size as u64)?;
        let mut segment = Segment::map(&file, path, cfg)?;
        segment.mmap.fill(0);
        Ok(segment)
    }

    /// Maps an existing backing file that is at least one page long.
    pub(crate) fn open(path: &Path, cfg: &ShmemConfig) -> Result<Segment> {
        cfg.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ShmemLibError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let actual = file.metadata()?.len();
        if actual < cfg.page_size as u64 {
            return Err(ShmemLibError::SegmentTooSmall {
                path: path.to_path_buf(),
                actual,
                expected: cfg.page_size,
            });
        }
        Segment::map(&file, path, cfg)
    }

    fn map(file: &File, path: &Path, cfg: &ShmemConfig) -> Result<Segment> {
        // The mapping stays valid after `file` is closed.
        let mmap = unsafe { MmapOptions::new().len(cfg.page_size).map_mut(file) }.map_err(
            |source| ShmemLibError::Map {
                path: path.to_path_buf(),
                source,
            },
        )?;
        Ok(Segment {
            mmap,
            cfg: cfg.clone(),
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn config(&self) -> &ShmemConfig {
        &self.cfg
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn flag_cell(&self) -> &AtomicU32 {
        // validate() guarantees an aligned word inside the page; mmap is page aligned.
        unsafe { &*(self.mmap.as_ptr().add(self.cfg.flag_offset) as *const AtomicU32) }
    }

    #[inline]
    pub(crate) fn load_flag(&self) -> u32 {
        self.flag_cell().load(Ordering::Acquire)
    }

    /// Spins until the flag equals `expected`. Never times out.
    pub(crate) fn wait_for(&self, expected: OwnershipFlag) {
        let mut round = 0;
        while self.load_flag() != expected as u32 {
            self.cfg.spin.idle(&mut round);
        }
    }

    /// Writes the message field, then releases it to the peer by storing `next`.
    pub(crate) fn publish(&mut self, message: &str, next: OwnershipFlag) -> usize {
        let field = unsafe {
            slice::from_raw_parts_mut(
                self.mmap.as_mut_ptr().add(self.cfg.message_offset),
                self.cfg.message_len,
            )
        };
        let written = encode_message(field, message);
        self.flag_cell().store(next as u32, Ordering::Release);
        written
    }

    pub(crate) fn read_message(&self) -> String {
        let field = unsafe {
            slice::from_raw_parts(
                self.mmap.as_ptr().add(self.cfg.message_offset),
                self.cfg.message_len,
            )
        };
        decode_message(field)
    }
}
