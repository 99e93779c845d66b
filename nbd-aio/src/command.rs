//! Command records.
//!
//! One `Command` is one unit of work submitted by the caller. It lives in
//! exactly one place at a time: the pending queue (accepted, not yet fully
//! transmitted), the in-flight map (transmitted, awaiting its reply), or
//! the completed map (finished, awaiting retirement by the caller).

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use nbd_proto::NbdCommand;

/// Operation kind, a thin alias over the wire command set.
pub type Kind = NbdCommand;

/// Why a command finished unsuccessfully.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The server reported an error for this command; the connection is
    /// still usable.
    #[error("server returned errno {errno}")]
    Remote { errno: u32 },

    /// The connection died while this command was pending or in flight.
    #[error("connection died: {reason}")]
    Disconnected { reason: String },

    /// The connection was shut down by a disconnect request before this
    /// command completed.
    #[error("connection shut down before completion")]
    Closed,
}

/// Final outcome of a command. Reads carry their filled buffer.
pub type CommandResult = std::result::Result<Bytes, CommandError>;

/// An accepted unit of work.
#[derive(Debug)]
pub struct Command {
    pub kind: Kind,
    pub flags: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    /// Write source data; empty for other kinds.
    pub payload: Bytes,
    /// Read destination, sized on submission, filled by the reply machine.
    pub data: BytesMut,
}

impl Command {
    pub fn new(kind: Kind, flags: u16, handle: u64, offset: u64, length: u32) -> Self {
        let data = if kind.has_read_payload() {
            BytesMut::zeroed(length as usize)
        } else {
            BytesMut::new()
        };
        Self {
            kind,
            flags,
            handle,
            offset,
            length,
            payload: Bytes::new(),
            data,
        }
    }

    pub fn with_payload(kind: Kind, flags: u16, handle: u64, offset: u64, payload: Bytes) -> Self {
        let length = payload.len() as u32;
        Self {
            kind,
            flags,
            handle,
            offset,
            length,
            payload,
            data: BytesMut::new(),
        }
    }

    /// Consume the record into its success result.
    pub fn into_result(self) -> CommandResult {
        Ok(if self.kind.has_read_payload() {
            self.data.freeze()
        } else {
            Bytes::new()
        })
    }
}
