//! NBD (Network Block Device) wire protocol types.
//!
//! Constants and fixed-layout frame codecs shared by NBD clients and
//! servers. Everything here is pure: no I/O, no state.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod consts;
mod error;
mod frame;

pub use consts::*;
pub use error::FrameError;
pub use frame::{NbdCommand, Request, SimpleReply};
