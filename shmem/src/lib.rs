pub mod channel;
pub mod core;
pub mod driver;
mod errors;
pub mod process;
pub mod protocol;
pub mod responder;
pub mod stream;

pub use errors::{Result, ShmemLibError};

pub const PAGE_SIZE: usize = core::PAGE_SIZE;
pub const MESSAGE_LEN: usize = core::MESSAGE_LEN;
