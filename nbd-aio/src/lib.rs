//! Asynchronous NBD client engine.
//!
//! This crate issues read/write/flush commands over a byte stream to an NBD
//! server, pipelines multiple outstanding commands per connection, and
//! correlates out-of-order replies back to their originating commands by
//! handle. Several independent connections can service a single export
//! ("multi-conn"), each driven by exactly one task.
//!
//! The core is a per-connection state machine over a nonblocking
//! [`Transport`]: request framing, payload transmission, and reply
//! processing interleave on one stream, and a partially sent request can be
//! suspended to service an incoming reply and later resumed byte-exactly.
//!
//! # Driving a connection
//!
//! A connection never blocks. The owning task polls the transport for the
//! readiness the connection asks for, then calls the notify entry points:
//!
//! ```ignore
//! let mut conn = nbd_aio::connect_tcp(addr, "export").await?;
//! let handle = conn.write(0, data)?;
//! loop {
//!     let interest = conn.direction().interest(conn.pending_len() > 0);
//!     let ready = conn.transport().ready(interest.unwrap()).await?;
//!     if ready.is_readable() {
//!         conn.notify_readable()?;
//!     } else if ready.is_writable() {
//!         conn.notify_writable()?;
//!     }
//!     if let Some(result) = conn.command_completed(handle) {
//!         break result?;
//!     }
//! }
//! ```

pub mod command;
pub mod config;
pub mod conn;
pub mod cursor;
pub mod error;
pub mod handshake;
pub mod machine;
pub mod multi;
pub mod transport;

pub use command::{CommandError, CommandResult, Kind};
pub use config::{ClientConfig, DEFAULT_MAX_IN_FLIGHT};
pub use conn::Connection;
pub use error::{ConfigError, Error, Result};
pub use handshake::{negotiate, ExportInfo};
pub use multi::MultiConn;
pub use transport::{Direction, Transport};

pub use nbd_proto;

use tokio::net::TcpStream;

/// Connect to a TCP NBD server, negotiate `export_name`, and return a
/// connection ready for command submission.
pub async fn connect_tcp(
    addr: impl tokio::net::ToSocketAddrs,
    export_name: &str,
) -> Result<Connection<TcpStream>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let export = negotiate(&mut stream, export_name).await?;
    Ok(Connection::new(stream, export))
}

/// Connect to a Unix-socket NBD server, negotiate `export_name`, and return
/// a connection ready for command submission.
#[cfg(unix)]
pub async fn connect_unix(
    path: impl AsRef<std::path::Path>,
    export_name: &str,
) -> Result<Connection<tokio::net::UnixStream>> {
    let mut stream = tokio::net::UnixStream::connect(path).await?;
    let export = negotiate(&mut stream, export_name).await?;
    Ok(Connection::new(stream, export))
}
