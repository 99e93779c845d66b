//! Error types for the client engine.

use std::io;
use thiserror::Error;

pub use nbd_proto::FrameError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level engine error.
///
/// Variants other than `Remote` and `Config` are fatal to the connection
/// that produced them: the connection transitions to its dead state and
/// every outstanding command fails.
#[derive(Debug, Error)]
pub enum Error {
    #[error("frame codec error: {0}")]
    Frame(#[from] FrameError),

    #[error("negotiation failed: {reason}")]
    NegotiationFailed { reason: &'static str },

    #[error("export is read-only")]
    ReadOnlyExport,

    #[error("reply handle {handle} matches no in-flight command")]
    UnexpectedHandle { handle: u64 },

    #[error("peer closed the connection mid-transfer")]
    UnexpectedEof,

    #[error("connection is dead: {reason}")]
    ConnectionDead { reason: String },

    #[error("connection is shut down")]
    ConnectionClosed,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("export mismatch across connections: {reason}")]
    ExportMismatch { reason: &'static str },

    #[error("server does not advertise multi-conn but {requested} connections requested")]
    MultiConnUnsupported { requested: usize },
}
