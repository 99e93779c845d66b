//! Readiness-poll driver loops.
//!
//! The engine core treats the driving loop as an external collaborator;
//! these are the loops the harness and integration tests use: poll the
//! transport for the readiness the connection asks for, invoke the notify
//! entry points, repeat.

use std::io;

use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

use nbd_aio::{Connection, Error, Transport};

/// Awaitable readiness, implemented by tokio's socket types.
pub trait AsyncReadiness {
    fn ready(&self, interest: Interest) -> impl std::future::Future<Output = io::Result<Ready>>;
}

impl AsyncReadiness for TcpStream {
    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        TcpStream::ready(self, interest).await
    }
}

#[cfg(unix)]
impl AsyncReadiness for tokio::net::UnixStream {
    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        tokio::net::UnixStream::ready(self, interest).await
    }
}

/// Drive `conn` until `done` says so: wait for the readiness the machine
/// requires (plus write readiness while commands are queued), then notify.
///
/// Returns the connection's fatal error if it dies while driving.
pub async fn drive<T, F>(conn: &mut Connection<T>, mut done: F) -> Result<(), Error>
where
    T: Transport + AsyncReadiness,
    F: FnMut(&mut Connection<T>) -> bool,
{
    while !done(conn) {
        if conn.is_dead() {
            return Err(Error::ConnectionDead {
                reason: conn.dead_reason().unwrap_or("unknown").to_string(),
            });
        }
        let direction = conn.direction();
        let Some(interest) = direction.interest(conn.pending_len() > 0) else {
            // Terminal state with nothing to wait for.
            return Ok(());
        };

        let ready = conn.transport().ready(interest).await?;
        if direction.wants_read() && ready.is_readable() {
            conn.notify_readable()?;
        } else if ready.is_writable() {
            conn.notify_writable()?;
        }
    }
    Ok(())
}

/// Drive `conn` until the command identified by `handle` completes, and
/// retire it.
pub async fn drive_to_completion<T>(
    conn: &mut Connection<T>,
    handle: u64,
) -> Result<nbd_aio::CommandResult, Error>
where
    T: Transport + AsyncReadiness,
{
    let mut result = None;
    drive(conn, |c| {
        result = c.command_completed(handle);
        result.is_some()
    })
    .await?;
    result.ok_or(Error::ConnectionClosed)
}
