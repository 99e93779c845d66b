//! Multi-connection coordination.
//!
//! Groups N independent connections that together service one export. The
//! coordinator holds no shared mutable command state: export metadata is
//! fetched once and shared immutably, and each connection is handed off by
//! move to exactly one driving task. Command scheduling across connections
//! is the caller's decision; no cross-connection ordering is provided.

use std::sync::Arc;

use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::config::ClientConfig;
use crate::conn::Connection;
use crate::error::{ConfigError, Error, Result};
use crate::handshake::{negotiate, ExportInfo};
use crate::transport::Transport;

/// One logical export served by N independently driven connections.
pub struct MultiConn<T> {
    export: Arc<ExportInfo>,
    connections: Vec<Connection<T>>,
}

impl MultiConn<TcpStream> {
    /// Open `config.connections` TCP connections to `addr` and negotiate
    /// the same export on each.
    pub async fn connect_tcp<A: ToSocketAddrs + Clone>(
        addr: A,
        config: &ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut connections = Vec::with_capacity(config.connections);
        for _ in 0..config.connections {
            let mut stream = TcpStream::connect(addr.clone()).await?;
            stream.set_nodelay(true)?;
            let export = negotiate(&mut stream, &config.export_name).await?;
            connections.push(Connection::new(stream, export));
        }
        Self::from_connections(connections)
    }
}

#[cfg(unix)]
impl MultiConn<tokio::net::UnixStream> {
    /// Open `config.connections` Unix-socket connections to `path` and
    /// negotiate the same export on each.
    pub async fn connect_unix(
        path: impl AsRef<std::path::Path>,
        config: &ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let mut connections = Vec::with_capacity(config.connections);
        for _ in 0..config.connections {
            let mut stream = tokio::net::UnixStream::connect(path).await?;
            let export = negotiate(&mut stream, &config.export_name).await?;
            connections.push(Connection::new(stream, export));
        }
        Self::from_connections(connections)
    }
}

impl<T: Transport> MultiConn<T> {
    /// Group already negotiated connections, checking that they agree on
    /// the export and that the server permits multi-conn when there is
    /// more than one.
    pub fn from_connections(connections: Vec<Connection<T>>) -> Result<Self> {
        let Some(first) = connections.first() else {
            return Err(Error::Config(ConfigError::InvalidValue {
                field: "connections",
                reason: "must be at least 1",
            }));
        };
        let export = Arc::clone(first.export());

        for conn in &connections {
            if conn.export().size_bytes != export.size_bytes
                || conn.export().transmission_flags != export.transmission_flags
            {
                return Err(Error::Config(ConfigError::ExportMismatch {
                    reason: "size or flags differ between connections",
                }));
            }
        }

        if connections.len() > 1 && !export.can_multi_conn() {
            return Err(Error::Config(ConfigError::MultiConnUnsupported {
                requested: connections.len(),
            }));
        }

        debug!(
            connections = connections.len(),
            size_bytes = export.size_bytes,
            "export grouped"
        );
        Ok(Self {
            export,
            connections,
        })
    }

    /// Export metadata shared immutably by every connection.
    pub fn export(&self) -> &Arc<ExportInfo> {
        &self.export
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Hand the connections to their driving tasks. Each `Connection`
    /// moves out whole; single ownership is enforced by the type system,
    /// not by runtime locking.
    pub fn into_connections(self) -> (Arc<ExportInfo>, Vec<Connection<T>>) {
        (self.export, self.connections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use nbd_proto::{NBD_FLAG_CAN_MULTI_CONN, NBD_FLAG_HAS_FLAGS};

    fn conn(size: u64, flags: u16) -> Connection<MockTransport> {
        Connection::new(MockTransport::new(), ExportInfo::new(size, flags))
    }

    #[test]
    fn rejects_empty_group() {
        assert!(MultiConn::<MockTransport>::from_connections(vec![]).is_err());
    }

    #[test]
    fn rejects_mismatched_exports() {
        let flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_CAN_MULTI_CONN;
        let result =
            MultiConn::from_connections(vec![conn(1024, flags), conn(2048, flags)]);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::ExportMismatch { .. }))
        ));
    }

    #[test]
    fn rejects_multi_conn_without_capability() {
        let flags = NBD_FLAG_HAS_FLAGS;
        let result =
            MultiConn::from_connections(vec![conn(1024, flags), conn(1024, flags)]);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::MultiConnUnsupported { requested: 2 }))
        ));
    }

    #[test]
    fn single_connection_needs_no_capability() {
        let group = MultiConn::from_connections(vec![conn(1024, NBD_FLAG_HAS_FLAGS)]).unwrap();
        assert_eq!(group.len(), 1);
        let (export, conns) = group.into_connections();
        assert_eq!(export.size_bytes, 1024);
        assert_eq!(conns.len(), 1);
    }
}
