//! Connection establishment: fixed-newstyle handshake and option
//! negotiation.
//!
//! This runs with ordinary async I/O before the stream is handed to the
//! engine as a nonblocking transport. The metadata it produces is fetched
//! once and immutable thereafter.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use nbd_proto::*;

use crate::error::{Error, Result};

/// Export metadata negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportInfo {
    /// Size of the export in bytes.
    pub size_bytes: u64,
    /// Transmission flags advertised by the server.
    pub transmission_flags: u16,
}

impl ExportInfo {
    pub fn new(size_bytes: u64, transmission_flags: u16) -> Self {
        Self {
            size_bytes,
            transmission_flags,
        }
    }

    pub fn read_only(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_READ_ONLY) != 0
    }

    /// Server permits multiple connections to this export with
    /// well-defined consistency.
    pub fn can_multi_conn(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_CAN_MULTI_CONN) != 0
    }

    pub fn supports_flush(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_SEND_FLUSH) != 0
    }

    pub fn supports_trim(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_SEND_TRIM) != 0
    }

    pub fn supports_write_zeroes(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_SEND_WRITE_ZEROES) != 0
    }
}

/// Perform the client side of the fixed-newstyle handshake and negotiate
/// `export_name` via `NBD_OPT_GO`.
///
/// On success the stream sits at the start of the transmission phase and
/// belongs to the engine.
pub async fn negotiate<S>(stream: &mut S, export_name: &str) -> Result<ExportInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Server hello: two magics plus handshake flags.
    let mut hello = [0u8; 18];
    stream.read_exact(&mut hello).await?;

    let magic = u64::from_be_bytes(hello[0..8].try_into().unwrap());
    if magic != NBD_MAGIC {
        return Err(Error::NegotiationFailed {
            reason: "invalid server magic",
        });
    }

    let opts_magic = u64::from_be_bytes(hello[8..16].try_into().unwrap());
    if opts_magic != NBD_OPTS_MAGIC {
        return Err(Error::NegotiationFailed {
            reason: "invalid opts magic",
        });
    }

    let flags = u16::from_be_bytes(hello[16..18].try_into().unwrap());
    if (flags & NBD_FLAG_FIXED_NEWSTYLE) == 0 {
        return Err(Error::NegotiationFailed {
            reason: "server does not support fixed newstyle",
        });
    }
    let no_zeroes = (flags & NBD_FLAG_NO_ZEROES) != 0;

    let client_flags =
        NBD_FLAG_C_FIXED_NEWSTYLE | if no_zeroes { NBD_FLAG_C_NO_ZEROES } else { 0 };
    stream.write_all(&client_flags.to_be_bytes()).await?;

    // NBD_OPT_GO: option header, name length, name, zero info requests.
    let name_bytes = export_name.as_bytes();
    let opt_data_len = 4 + name_bytes.len() + 2;

    let mut opt_header = [0u8; 16];
    opt_header[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    opt_header[8..12].copy_from_slice(&NBD_OPT_GO.to_be_bytes());
    opt_header[12..16].copy_from_slice(&(opt_data_len as u32).to_be_bytes());
    stream.write_all(&opt_header).await?;

    stream
        .write_all(&(name_bytes.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(name_bytes).await?;
    stream.write_all(&0u16.to_be_bytes()).await?;

    // Collect option replies until NBD_REP_ACK.
    let mut size_bytes = 0u64;
    let mut transmission_flags = 0u16;
    loop {
        let mut reply_header = [0u8; 20];
        stream.read_exact(&mut reply_header).await?;

        let reply_magic = u64::from_be_bytes(reply_header[0..8].try_into().unwrap());
        if reply_magic != NBD_OPTION_REPLY_MAGIC {
            return Err(Error::NegotiationFailed {
                reason: "invalid option reply magic",
            });
        }

        let reply_type = u32::from_be_bytes(reply_header[12..16].try_into().unwrap());
        let reply_len = u32::from_be_bytes(reply_header[16..20].try_into().unwrap()) as usize;

        // Bound allocation against malicious servers.
        if reply_len > OPTION_REPLY_MAX_BYTES {
            return Err(Error::NegotiationFailed {
                reason: "oversized option reply",
            });
        }

        let mut reply_data = vec![0u8; reply_len];
        stream.read_exact(&mut reply_data).await?;

        if reply_type == NBD_REP_INFO && reply_len >= 12 {
            let info_type = u16::from_be_bytes(reply_data[0..2].try_into().unwrap());
            if info_type == NBD_INFO_EXPORT {
                size_bytes = u64::from_be_bytes(reply_data[2..10].try_into().unwrap());
                transmission_flags = u16::from_be_bytes(reply_data[10..12].try_into().unwrap());
            }
        } else if reply_type == NBD_REP_ACK {
            break;
        } else if reply_type >= 0x80000000 {
            return Err(Error::NegotiationFailed {
                reason: "option negotiation refused",
            });
        }
    }

    let export = ExportInfo::new(size_bytes, transmission_flags);
    debug!(
        size_bytes = export.size_bytes,
        flags = export.transmission_flags,
        "export negotiated"
    );
    Ok(export)
}
