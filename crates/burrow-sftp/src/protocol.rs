//! SFTP v3 wire primitives.
//!
//! Message types, status codes, open flags, the attribute record and the
//! length-prefixed string codec, as defined in draft-ietf-secsh-filexfer-02.
//! Only the pieces the bridge speaks are here; the framing itself lives in
//! [`crate::channel`].

use bytes::{Buf, BufMut, BytesMut};

/// SFTP protocol version spoken by the bridge.
pub const SFTP_VERSION: u32 = 3;

/// Largest payload a single READ reply may carry.
pub const MAX_READ_LEN: u32 = 65536;

/// Largest number of entries a single READDIR reply may carry.
pub const MAX_READDIR_ENTRIES: usize = 50;

/// Extension submethod for hard links.
pub const EXT_HARDLINK: &str = "hardlink@openssh.com";

/// Extension submethod for atomic renames.
pub const EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";

/// SFTP message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Version),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Close),
            5 => Ok(MessageType::Read),
            6 => Ok(MessageType::Write),
            7 => Ok(MessageType::Lstat),
            8 => Ok(MessageType::Fstat),
            9 => Ok(MessageType::Setstat),
            10 => Ok(MessageType::Fsetstat),
            11 => Ok(MessageType::Opendir),
            12 => Ok(MessageType::Readdir),
            13 => Ok(MessageType::Remove),
            14 => Ok(MessageType::Mkdir),
            15 => Ok(MessageType::Rmdir),
            16 => Ok(MessageType::Realpath),
            17 => Ok(MessageType::Stat),
            18 => Ok(MessageType::Rename),
            19 => Ok(MessageType::Readlink),
            20 => Ok(MessageType::Symlink),
            101 => Ok(MessageType::Status),
            102 => Ok(MessageType::Handle),
            103 => Ok(MessageType::Data),
            104 => Ok(MessageType::Name),
            105 => Ok(MessageType::Attrs),
            200 => Ok(MessageType::Extended),
            201 => Ok(MessageType::ExtendedReply),
            _ => Err(crate::Error::protocol(format!(
                "Unknown message type: {}",
                value
            ))),
        }
    }
}

/// SFTP status codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

/// File open flags (pflags field of SSH_FXP_OPEN)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x00000001;
    pub const WRITE: u32 = 0x00000002;
    pub const APPEND: u32 = 0x00000004;
    pub const CREAT: u32 = 0x00000008;
    pub const TRUNC: u32 = 0x00000010;
    pub const EXCL: u32 = 0x00000020;

    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    /// The exact bitmask some mount helpers send for an append-style open,
    /// having dropped O_APPEND on the way through.
    pub fn is_write_only(&self) -> bool {
        self.0 == Self::WRITE
    }
}

/// File-type bits carried in the permissions field.
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;

/// File attributes record (valid fields driven by the flags mask)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    pub const FLAG_SIZE: u32 = 0x00000001;
    pub const FLAG_UIDGID: u32 = 0x00000002;
    pub const FLAG_PERMISSIONS: u32 = 0x00000004;
    pub const FLAG_ACMODTIME: u32 = 0x00000008;

    /// Encode to the wire representation (flags mask + present fields).
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    /// Decode from the wire representation.
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        if buf.remaining() < 4 {
            return Err(crate::Error::protocol("Insufficient data for attr flags"));
        }

        let flags = buf.get_u32();
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::protocol("Insufficient data for size"));
            }
            attrs.size = Some(buf.get_u64());
        }

        if flags & Self::FLAG_UIDGID != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::protocol("Insufficient data for uid/gid"));
            }
            attrs.uid = Some(buf.get_u32());
            attrs.gid = Some(buf.get_u32());
        }

        if flags & Self::FLAG_PERMISSIONS != 0 {
            if buf.remaining() < 4 {
                return Err(crate::Error::protocol("Insufficient data for permissions"));
            }
            attrs.permissions = Some(buf.get_u32());
        }

        if flags & Self::FLAG_ACMODTIME != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::protocol("Insufficient data for atime/mtime"));
            }
            attrs.atime = Some(buf.get_u32());
            attrs.mtime = Some(buf.get_u32());
        }

        Ok(attrs)
    }
}

/// Length-prefixed string and byte-string codec.
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    /// Encode a string (u32 length + data)
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    /// Decode a string
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::protocol(format!("Invalid UTF-8 string: {}", e)))
    }

    /// Encode raw bytes (u32 length + data)
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    /// Decode raw bytes
    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        if buf.remaining() < 4 {
            return Err(crate::Error::protocol("Insufficient data for length"));
        }

        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(crate::Error::protocol("Insufficient data for payload"));
        }

        let bytes = buf[..len].to_vec();
        buf.advance(len);

        Ok(bytes)
    }
}
