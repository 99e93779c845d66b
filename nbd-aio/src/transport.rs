//! Nonblocking transport seam.
//!
//! The state machine performs all I/O through [`Transport`], a pair of
//! nonblocking read/write attempts. `io::ErrorKind::WouldBlock` is the
//! suspension signal: it is not an error, it means "yield to the driving
//! task and retry after the next readiness notification". Any other I/O
//! error is fatal to the connection.
//!
//! Implementations are provided for tokio's `TcpStream` and `UnixStream`,
//! whose `try_read`/`try_write` have exactly these semantics; the driving
//! task pairs them with `ready(Interest)`.

use std::io;

use tokio::io::Interest;

/// A nonblocking byte-stream endpoint.
pub trait Transport {
    /// Attempt to read into `buf` without blocking.
    ///
    /// `Ok(0)` on a non-empty `buf` means the peer closed the stream.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Attempt to write from `buf` without blocking.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Coalescing hint: `true` means more output follows immediately, so
    /// the transport may batch it with the next write (MSG_MORE on Linux).
    /// Purely a performance hint; the default does nothing.
    fn hint_more(&mut self, _more: bool) {}
}

impl Transport for tokio::net::TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_read(self, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_write(self, buf)
    }
}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::UnixStream::try_read(self, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::UnixStream::try_write(self, buf)
    }
}

/// Which readiness directions the connection currently requires.
///
/// An output of the state machine and an input to the driving task's
/// readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    Read,
    Write,
    Both,
}

impl Direction {
    pub fn wants_read(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }

    /// Convert to a tokio readiness interest.
    ///
    /// `want_send` adds write interest on top of what the machine requires,
    /// the way a driver asks for writability when it has a new command to
    /// submit. Returns `None` when there is nothing to wait for.
    pub fn interest(self, want_send: bool) -> Option<Interest> {
        let read = self.wants_read();
        let write = self.wants_write() || want_send;
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}
