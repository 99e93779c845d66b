//! RAM-disk NBD server.
//!
//! Test scaffolding only: a minimal fixed-newstyle NBD server backed by an
//! in-memory disk, used to exercise the client engine end to end. Serves
//! over any async stream and advertises multi-conn so several client
//! connections can target the same disk.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use nbd_proto::*;

/// Maximum length for option data during negotiation; bounds allocation
/// from misbehaving clients.
const OPTION_DATA_MAX_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("frame codec error: {0}")]
    Frame(#[from] FrameError),

    #[error("negotiation failed: {reason}")]
    Negotiation { reason: &'static str },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// In-memory disk shared by all connections to one server.
pub struct RamDisk {
    size_bytes: u64,
    data: RwLock<Vec<u8>>,
}

impl RamDisk {
    /// A zero-filled disk of `size_bytes`.
    pub fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            data: RwLock::new(vec![0u8; size_bytes as usize]),
        }
    }

    /// A disk initialized with the offset pattern: every 8 bytes hold
    /// their own offset as a big-endian u64.
    pub fn patterned(size_bytes: u64) -> Self {
        let mut data = vec![0u8; size_bytes as usize];
        for i in (0..data.len()).step_by(8) {
            let end = (i + 8).min(data.len());
            data[i..end].copy_from_slice(&(i as u64).to_be_bytes()[..end - i]);
        }
        Self {
            size_bytes,
            data: RwLock::new(data),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn in_bounds(&self, offset: u64, length: u64) -> bool {
        offset.checked_add(length).is_some_and(|end| end <= self.size_bytes)
    }

    /// Read a range; returns the NBD errno on failure.
    pub async fn read(&self, offset: u64, length: u32) -> Result<Vec<u8>, u32> {
        if !self.in_bounds(offset, length as u64) {
            return Err(NBD_EINVAL);
        }
        let data = self.data.read().await;
        Ok(data[offset as usize..(offset + length as u64) as usize].to_vec())
    }

    pub async fn write(&self, offset: u64, payload: &[u8]) -> Result<(), u32> {
        if !self.in_bounds(offset, payload.len() as u64) {
            return Err(NBD_ENOSPC);
        }
        let mut data = self.data.write().await;
        data[offset as usize..offset as usize + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    pub async fn zero(&self, offset: u64, length: u64) -> Result<(), u32> {
        if !self.in_bounds(offset, length) {
            return Err(NBD_EINVAL);
        }
        let mut data = self.data.write().await;
        data[offset as usize..(offset + length) as usize].fill(0);
        Ok(())
    }
}

/// NBD server for test use, one RAM disk per instance.
#[derive(Clone)]
pub struct RamServer {
    disk: Arc<RamDisk>,
    export_name: String,
}

impl RamServer {
    pub fn new(disk: Arc<RamDisk>, export_name: impl Into<String>) -> Self {
        Self {
            disk,
            export_name: export_name.into(),
        }
    }

    pub fn disk(&self) -> &Arc<RamDisk> {
        &self.disk
    }

    fn transmission_flags(&self) -> u16 {
        NBD_FLAG_HAS_FLAGS
            | NBD_FLAG_SEND_FLUSH
            | NBD_FLAG_SEND_TRIM
            | NBD_FLAG_SEND_WRITE_ZEROES
            | NBD_FLAG_CAN_MULTI_CONN
    }

    /// Bind a TCP listener and serve connections until the returned task
    /// is aborted. Returns the bound address.
    pub async fn listen_tcp(
        self,
    ) -> io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "NBD connection accepted");
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve(stream).await {
                                warn!(error = %e, "NBD connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        return;
                    }
                }
            }
        });
        Ok((addr, task))
    }

    /// Serve a single connection over any async stream: handshake, option
    /// negotiation, then the transmission phase.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let no_zeroes = handshake(&mut stream).await?;
        if !self.negotiate(&mut stream, no_zeroes).await? {
            return Ok(());
        }
        self.transmission(&mut stream).await
    }

    async fn negotiate<S>(&self, stream: &mut S, no_zeroes: bool) -> Result<bool, ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut header = [0u8; 16];
            stream.read_exact(&mut header).await?;

            let magic = u64::from_be_bytes(header[0..8].try_into().unwrap());
            if magic != NBD_OPTS_MAGIC {
                return Err(ServerError::Negotiation {
                    reason: "invalid option magic",
                });
            }

            let option = u32::from_be_bytes(header[8..12].try_into().unwrap());
            let length = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;
            if length > OPTION_DATA_MAX_BYTES {
                return Err(ServerError::Negotiation {
                    reason: "oversized option data",
                });
            }

            let mut data = vec![0u8; length];
            stream.read_exact(&mut data).await?;

            debug!(option, length, "NBD option");

            match option {
                NBD_OPT_EXPORT_NAME => {
                    if String::from_utf8_lossy(&data) != self.export_name {
                        return Ok(false);
                    }
                    let mut resp = [0u8; 10];
                    resp[0..8].copy_from_slice(&self.disk.size_bytes.to_be_bytes());
                    resp[8..10].copy_from_slice(&self.transmission_flags().to_be_bytes());
                    stream.write_all(&resp).await?;
                    if !no_zeroes {
                        stream.write_all(&[0u8; 124]).await?;
                    }
                    return Ok(true);
                }
                NBD_OPT_GO | NBD_OPT_INFO => {
                    if data.len() < 4 {
                        send_option_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        continue;
                    }
                    let name_len = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
                    if data.len() < 4 + name_len {
                        send_option_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        continue;
                    }
                    if String::from_utf8_lossy(&data[4..4 + name_len]) != self.export_name {
                        send_option_reply(stream, option, NBD_REP_ERR_UNKNOWN, &[]).await?;
                        continue;
                    }

                    let mut info = [0u8; 12];
                    info[0..2].copy_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                    info[2..10].copy_from_slice(&self.disk.size_bytes.to_be_bytes());
                    info[10..12].copy_from_slice(&self.transmission_flags().to_be_bytes());
                    send_option_reply(stream, option, NBD_REP_INFO, &info).await?;

                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    if option == NBD_OPT_GO {
                        return Ok(true);
                    }
                }
                NBD_OPT_ABORT => {
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    return Ok(false);
                }
                NBD_OPT_LIST => {
                    let name = self.export_name.as_bytes();
                    let mut list = Vec::with_capacity(4 + name.len());
                    list.extend_from_slice(&(name.len() as u32).to_be_bytes());
                    list.extend_from_slice(name);
                    send_option_reply(stream, option, NBD_REP_SERVER, &list).await?;
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }
                _ => {
                    send_option_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                }
            }
        }
    }

    async fn transmission<S>(&self, stream: &mut S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut req_buf = [0u8; Request::SIZE_BYTES];

        loop {
            match stream.read_exact(&mut req_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let req = Request::from_bytes(&req_buf)?;
            if req.validate_length(self.disk.size_bytes).is_err() {
                stream
                    .write_all(&SimpleReply::error(req.handle, NBD_EOVERFLOW).to_bytes())
                    .await?;
                continue;
            }

            match req.command {
                NbdCommand::Read => match self.disk.read(req.offset, req.length).await {
                    Ok(data) => {
                        stream
                            .write_all(&SimpleReply::ok(req.handle).to_bytes())
                            .await?;
                        stream.write_all(&data).await?;
                    }
                    Err(errno) => {
                        stream
                            .write_all(&SimpleReply::error(req.handle, errno).to_bytes())
                            .await?;
                    }
                },
                NbdCommand::Write => {
                    let len = req.length as usize;
                    let mut data = BytesMut::zeroed(len);
                    stream.read_exact(&mut data).await?;

                    let errno = match self.disk.write(req.offset, &data).await {
                        Ok(()) => NBD_OK,
                        Err(errno) => errno,
                    };
                    stream
                        .write_all(&SimpleReply { error: errno, handle: req.handle }.to_bytes())
                        .await?;
                }
                NbdCommand::Disconnect => return Ok(()),
                NbdCommand::Flush => {
                    // RAM disk: nothing to persist.
                    stream
                        .write_all(&SimpleReply::ok(req.handle).to_bytes())
                        .await?;
                }
                NbdCommand::Trim | NbdCommand::WriteZeroes => {
                    let errno = match self.disk.zero(req.offset, req.length as u64).await {
                        Ok(()) => NBD_OK,
                        Err(errno) => errno,
                    };
                    stream
                        .write_all(&SimpleReply { error: errno, handle: req.handle }.to_bytes())
                        .await?;
                }
            }
        }
    }
}

async fn handshake<S>(stream: &mut S) -> Result<bool, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 18];
    hello[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
    hello[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    let flags = NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES;
    hello[16..18].copy_from_slice(&flags.to_be_bytes());
    stream.write_all(&hello).await?;

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let client_flags = u32::from_be_bytes(buf);

    if (client_flags & NBD_FLAG_C_FIXED_NEWSTYLE) == 0 {
        return Err(ServerError::Negotiation {
            reason: "client must use fixed newstyle",
        });
    }

    Ok((client_flags & NBD_FLAG_C_NO_ZEROES) != 0)
}

async fn send_option_reply<S>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> Result<(), ServerError>
where
    S: AsyncWrite + Unpin,
{
    let mut header = [0u8; 20];
    header[0..8].copy_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
    header[8..12].copy_from_slice(&option.to_be_bytes());
    header[12..16].copy_from_slice(&reply_type.to_be_bytes());
    header[16..20].copy_from_slice(&(data.len() as u32).to_be_bytes());
    stream.write_all(&header).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ram_disk_bounds() {
        let disk = RamDisk::new(1024);
        assert!(disk.read(0, 1024).await.is_ok());
        assert_eq!(disk.read(1, 1024).await, Err(NBD_EINVAL));
        assert_eq!(disk.write(1020, b"12345").await, Err(NBD_ENOSPC));
    }

    #[tokio::test]
    async fn ram_disk_write_read() {
        let disk = RamDisk::new(1024);
        disk.write(100, b"hello").await.unwrap();
        assert_eq!(disk.read(100, 5).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn patterned_disk_holds_offsets() {
        let disk = RamDisk::patterned(64);
        assert_eq!(disk.read(0, 8).await.unwrap(), 0u64.to_be_bytes());
        assert_eq!(disk.read(40, 8).await.unwrap(), 40u64.to_be_bytes());
    }
}
