//! A single NBD connection.
//!
//! `Connection` pairs one nonblocking transport with one protocol state
//! machine. It is single-owner: exactly one task drives it, which is what
//! makes the engine safe without locks. The notify entry points and the
//! submit methods below are the only paths that mutate connection state.

use std::sync::Arc;

use bytes::Bytes;

use nbd_proto::NBD_CMD_FLAG_FUA;

use crate::command::{CommandResult, Kind};
use crate::error::{Error, Result};
use crate::handshake::ExportInfo;
use crate::machine::Machine;
use crate::transport::{Direction, Transport};

/// One connection to an export.
pub struct Connection<T> {
    transport: T,
    machine: Machine,
    export: Arc<ExportInfo>,
}

impl<T: Transport> Connection<T> {
    /// Wrap an already negotiated transport. The stream must be positioned
    /// at the start of the transmission phase.
    pub fn new(transport: T, export: ExportInfo) -> Self {
        Self {
            transport,
            machine: Machine::new(),
            export: Arc::new(export),
        }
    }

    /// Export metadata negotiated at connect time; immutable.
    pub fn export(&self) -> &Arc<ExportInfo> {
        &self.export
    }

    /// The underlying transport, for readiness polling by the driving
    /// task. State is only ever mutated through the notify entry points.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Queue a read of `length` bytes at `offset`. Returns the handle used
    /// to retire the command via [`Connection::command_completed`].
    pub fn read(&mut self, offset: u64, length: u32) -> Result<u64> {
        self.machine.enqueue(Kind::Read, 0, offset, length, None)
    }

    /// Queue a write of `data` at `offset`.
    pub fn write(&mut self, offset: u64, data: Bytes) -> Result<u64> {
        self.check_writable()?;
        self.machine.enqueue(Kind::Write, 0, offset, 0, Some(data))
    }

    /// Queue a write with force-unit-access semantics.
    pub fn write_fua(&mut self, offset: u64, data: Bytes) -> Result<u64> {
        self.check_writable()?;
        self.machine
            .enqueue(Kind::Write, NBD_CMD_FLAG_FUA, offset, 0, Some(data))
    }

    /// Queue a flush of all completed writes to stable storage.
    pub fn flush(&mut self) -> Result<u64> {
        self.machine.enqueue(Kind::Flush, 0, 0, 0, None)
    }

    /// Queue a trim (discard) of a byte range.
    pub fn trim(&mut self, offset: u64, length: u32) -> Result<u64> {
        self.check_writable()?;
        self.machine.enqueue(Kind::Trim, 0, offset, length, None)
    }

    /// Queue a write of zeroes over a byte range.
    pub fn write_zeroes(&mut self, offset: u64, length: u32) -> Result<u64> {
        self.check_writable()?;
        self.machine.enqueue(Kind::WriteZeroes, 0, offset, length, None)
    }

    /// Queue a disconnect request. Once it is transmitted the connection
    /// closes and anything still outstanding fails.
    pub fn disconnect(&mut self) -> Result<u64> {
        self.machine.enqueue(Kind::Disconnect, 0, 0, 0, None)
    }

    /// Which readiness to poll the transport for.
    pub fn direction(&self) -> Direction {
        self.machine.direction()
    }

    /// The transport became readable.
    pub fn notify_readable(&mut self) -> Result<()> {
        self.machine.notify_readable(&mut self.transport)
    }

    /// The transport became writable.
    pub fn notify_writable(&mut self) -> Result<()> {
        self.machine.notify_writable(&mut self.transport)
    }

    /// Retire a finished command; `None` until it completes, and at most
    /// one `Some` per handle.
    pub fn command_completed(&mut self, handle: u64) -> Option<CommandResult> {
        self.machine.command_completed(handle)
    }

    /// Permanently failed; all outstanding commands have been completed
    /// with an error.
    pub fn is_dead(&self) -> bool {
        self.machine.is_dead()
    }

    /// Cleanly shut down after a disconnect request.
    pub fn is_closed(&self) -> bool {
        self.machine.is_closed()
    }

    /// Idle: no transmission in progress, able to issue a new command.
    pub fn is_ready(&self) -> bool {
        self.machine.is_ready()
    }

    pub fn pending_len(&self) -> usize {
        self.machine.pending_len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.machine.in_flight_len()
    }

    pub fn dead_reason(&self) -> Option<&str> {
        self.machine.dead_reason()
    }

    /// Wire bytes transmitted (request frames plus write payloads).
    pub fn bytes_sent(&self) -> u64 {
        self.machine.bytes_sent()
    }

    /// Wire bytes received (reply headers plus read payloads).
    pub fn bytes_received(&self) -> u64 {
        self.machine.bytes_received()
    }

    /// Reject writes up front when the export is read-only.
    fn check_writable(&self) -> Result<()> {
        if self.export.read_only() {
            return Err(Error::ReadOnlyExport);
        }
        Ok(())
    }
}
