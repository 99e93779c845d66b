//! Codec errors.

use thiserror::Error;

/// Errors produced while encoding or decoding wire frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("unknown command: {command}")]
    UnknownCommand { command: u16 },

    #[error("length too large: {length_bytes} bytes (max: {max_bytes})")]
    LengthTooLarge { length_bytes: u32, max_bytes: u32 },
}
