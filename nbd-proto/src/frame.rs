//! Fixed-layout transmission frames.
//!
//! Requests are 28 bytes on the wire, simple replies 16 bytes, all fields
//! network byte order. Write requests are followed by exactly `length`
//! payload bytes; read replies carry exactly `length` payload bytes after
//! the header. The codec only handles the fixed headers; payloads are raw.

use crate::consts::*;
use crate::error::FrameError;

/// NBD transmission command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
    WriteZeroes,
}

// Command codes on the wire
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;
const NBD_CMD_TRIM: u16 = 4;
const NBD_CMD_WRITE_ZEROES: u16 = 6;

impl NbdCommand {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISC => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            NBD_CMD_WRITE_ZEROES => Some(Self::WriteZeroes),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISC,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
            Self::WriteZeroes => NBD_CMD_WRITE_ZEROES,
        }
    }

    /// Whether a request of this kind is followed by a data payload.
    pub fn has_write_payload(self) -> bool {
        matches!(self, Self::Write)
    }

    /// Whether a successful reply to this kind carries a data payload.
    pub fn has_read_payload(self) -> bool {
        matches!(self, Self::Read)
    }
}

impl std::fmt::Display for NbdCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Disconnect => "disconnect",
            Self::Flush => "flush",
            Self::Trim => "trim",
            Self::WriteZeroes => "write_zeroes",
        };
        f.write_str(name)
    }
}

/// NBD request header (28 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub flags: u16,
    pub command: NbdCommand,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub const SIZE_BYTES: usize = 28;

    /// Serialize the request header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.to_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse a request header, checking magic and command code only.
    ///
    /// Length bounds depend on who is parsing (servers bound range commands
    /// by device size); use [`Request::validate_length`] for that.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, FrameError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC,
                actual: magic,
            });
        }

        let flags = u16::from_be_bytes([buf[4], buf[5]]);
        let cmd = u16::from_be_bytes([buf[6], buf[7]]);
        let command =
            NbdCommand::from_u16(cmd).ok_or(FrameError::UnknownCommand { command: cmd })?;
        // Header layout is fixed, so these slices are always 8/8/4 bytes.
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }

    /// Validate `length` against the protocol bounds.
    ///
    /// Data-transfer commands (Read, Write) are limited to
    /// [`NBD_MAX_PAYLOAD_SIZE`]. Range commands without data transfer
    /// (Trim, WriteZeroes) may exceed it, bounded only by `device_size`.
    pub fn validate_length(&self, device_size: u64) -> Result<(), FrameError> {
        let max_length = match self.command {
            NbdCommand::Read | NbdCommand::Write => NBD_MAX_PAYLOAD_SIZE,
            NbdCommand::Trim | NbdCommand::WriteZeroes => {
                device_size.min(u32::MAX as u64) as u32
            }
            NbdCommand::Disconnect | NbdCommand::Flush => u32::MAX,
        };

        if self.length > max_length {
            return Err(FrameError::LengthTooLarge {
                length_bytes: self.length,
                max_bytes: max_length,
            });
        }
        Ok(())
    }
}

/// NBD simple reply header (16 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct SimpleReply {
    pub error: u32,
    pub handle: u64,
}

impl SimpleReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn is_err(&self) -> bool {
        self.error != NBD_OK
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, FrameError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC,
                actual: magic,
            });
        }

        let error = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Ok(Self { error, handle })
    }
}

const _: () = {
    assert!(Request::SIZE_BYTES == 28);
    assert!(SimpleReply::SIZE_BYTES == 16);
};

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DEVICE_SIZE: u64 = 1024 * 1024 * 1024; // 1 GiB

    #[test]
    fn request_roundtrip() {
        let req = Request {
            flags: NBD_CMD_FLAG_FUA,
            command: NbdCommand::Write,
            handle: 12345,
            offset: 1024,
            length: 512,
        };
        let buf = req.to_bytes();
        let parsed = Request::from_bytes(&buf).unwrap();
        assert_eq!(parsed.command, NbdCommand::Write);
        assert_eq!(parsed.flags, NBD_CMD_FLAG_FUA);
        assert_eq!(parsed.handle, 12345);
        assert_eq!(parsed.offset, 1024);
        assert_eq!(parsed.length, 512);
    }

    #[test]
    fn request_wire_layout() {
        let req = Request {
            flags: 0,
            command: NbdCommand::Read,
            handle: 0x1122334455667788,
            offset: 0x10000,
            length: 0x4000,
        };
        let buf = req.to_bytes();
        assert_eq!(&buf[0..4], &NBD_REQUEST_MAGIC.to_be_bytes());
        assert_eq!(&buf[8..16], &0x1122334455667788u64.to_be_bytes());
        assert_eq!(&buf[24..28], &0x4000u32.to_be_bytes());
    }

    #[test]
    fn reply_roundtrip() {
        let reply = SimpleReply::ok(42);
        let buf = reply.to_bytes();
        let parsed = SimpleReply::from_bytes(&buf).unwrap();
        assert_eq!(parsed.error, NBD_OK);
        assert_eq!(parsed.handle, 42);
        assert!(!parsed.is_err());
    }

    #[test]
    fn request_invalid_magic() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        let result = Request::from_bytes(&buf);
        assert!(matches!(result, Err(FrameError::InvalidMagic { .. })));
    }

    #[test]
    fn reply_invalid_magic() {
        let buf = [0u8; 16];
        let result = SimpleReply::from_bytes(&buf);
        assert!(matches!(result, Err(FrameError::InvalidMagic { .. })));
    }

    #[test]
    fn request_unknown_command() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[6..8].copy_from_slice(&99u16.to_be_bytes());
        let result = Request::from_bytes(&buf);
        assert!(matches!(
            result,
            Err(FrameError::UnknownCommand { command: 99 })
        ));
    }

    #[test]
    fn read_length_bounded_by_max_payload() {
        let req = Request {
            flags: 0,
            command: NbdCommand::Read,
            handle: 1,
            offset: 0,
            length: NBD_MAX_PAYLOAD_SIZE + 1,
        };
        assert!(matches!(
            req.validate_length(TEST_DEVICE_SIZE),
            Err(FrameError::LengthTooLarge { .. })
        ));
    }

    #[test]
    fn trim_allows_large_length() {
        let req = Request {
            flags: 0,
            command: NbdCommand::Trim,
            handle: 1,
            offset: 0,
            length: NBD_MAX_PAYLOAD_SIZE + 1,
        };
        req.validate_length(TEST_DEVICE_SIZE).unwrap();
    }

    #[test]
    fn all_commands_roundtrip() {
        for cmd in [
            NbdCommand::Read,
            NbdCommand::Write,
            NbdCommand::Disconnect,
            NbdCommand::Flush,
            NbdCommand::Trim,
            NbdCommand::WriteZeroes,
        ] {
            assert_eq!(NbdCommand::from_u16(cmd.to_u16()), Some(cmd));
        }
    }
}
