//! Partial transfer cursor.
//!
//! Tracks how many bytes of the current frame or payload have crossed the
//! transport across repeated nonblocking attempts. A transfer interrupted
//! by `WouldBlock` resumes from the exact byte it stopped at; calling again
//! while the transport is still not ready is safe and makes no progress.

use std::io;

use crate::error::Error;
use crate::transport::Transport;

/// Outcome of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The whole buffer has been transferred.
    Complete,
    /// The transport would block; retry after the next readiness
    /// notification.
    Blocked,
}

/// Resumable position within one outbound or inbound buffer.
///
/// `0 <= pos <= len` always holds; the cursor is reset only when a new
/// transfer begins.
#[derive(Debug, Default)]
pub struct Cursor {
    pos: usize,
    len: usize,
}

impl Cursor {
    /// Begin a new transfer of `len` bytes.
    pub fn begin(&mut self, len: usize) {
        self.pos = 0;
        self.len = len;
    }

    /// Bytes not yet transferred.
    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// Bytes already transferred in the current transfer.
    pub fn transferred(&self) -> usize {
        self.pos
    }

    /// Whether a transfer is underway (begun but not complete).
    pub fn in_progress(&self) -> bool {
        self.remaining() > 0
    }

    /// Push remaining bytes of `buf` to the transport.
    ///
    /// `buf` must be the same buffer across resumed attempts; its length
    /// must equal the `len` passed to [`Cursor::begin`].
    pub fn send<T: Transport>(&mut self, transport: &mut T, buf: &[u8]) -> Result<Progress, Error> {
        debug_assert_eq!(buf.len(), self.len);
        while self.pos < self.len {
            match transport.try_write(&buf[self.pos..]) {
                Ok(0) => return Err(Error::UnexpectedEof),
                Ok(n) => self.pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Progress::Complete)
    }

    /// Pull remaining bytes from the transport into `buf`.
    pub fn recv<T: Transport>(
        &mut self,
        transport: &mut T,
        buf: &mut [u8],
    ) -> Result<Progress, Error> {
        debug_assert_eq!(buf.len(), self.len);
        while self.pos < self.len {
            match transport.try_read(&mut buf[self.pos..]) {
                Ok(0) => return Err(Error::UnexpectedEof),
                Ok(n) => self.pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Progress::Complete)
    }
}
