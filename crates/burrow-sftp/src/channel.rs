//! SFTP framing over the secure channel.
//!
//! Length-prefixed packets in, one typed reply out per request. The reader
//! deliberately never fails hard: end of stream, a transport error or a
//! frame that does not parse all surface as "no message", which sends the
//! caller into its helper liveness check.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, trace};

use crate::protocol::{codec, FileAttrs, MessageType, StatusCode, SFTP_VERSION};
use crate::transport::SftpStream;
use crate::{Error, Result};

/// Upper bound on a single inbound frame. Write payloads stay well under
/// this; anything larger is a desynchronized or hostile stream.
const MAX_PACKET_LEN: usize = 256 * 1024;

/// A parsed client request.
///
/// One struct for every opcode, fields populated as the opcode demands:
/// `filename` is the primary path, `data` the secondary path or write
/// payload, `handle` the opaque handle bytes, `submethod` the EXTENDED
/// request name.
#[derive(Debug, Default, Clone)]
pub struct ClientMessage {
    pub opcode: u8,
    pub request_id: u32,
    pub filename: String,
    pub data: Vec<u8>,
    pub handle: Vec<u8>,
    pub flags: u32,
    pub offset: u64,
    pub length: u32,
    pub attrs: FileAttrs,
    pub submethod: Option<String>,
}

impl ClientMessage {
    /// The secondary path (RENAME target, SYMLINK location, EXTENDED second
    /// argument) as a string.
    pub fn data_path(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// One entry of a NAME reply.
#[derive(Debug, Clone)]
pub struct NameEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttrs,
}

impl NameEntry {
    /// An entry carrying just a name, with empty attributes.
    pub fn bare(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            filename: name.clone(),
            longname: name,
            attrs: FileAttrs::default(),
        }
    }
}

/// A single reply to a client request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status { code: StatusCode, message: String },
    Handle(Vec<u8>),
    Data(Vec<u8>),
    Name(Vec<NameEntry>),
    Attrs(FileAttrs),
}

impl Reply {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Reply::Status {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::status(StatusCode::Ok, "")
    }

    pub fn failure() -> Self {
        Self::status(StatusCode::Failure, "")
    }

    pub fn failure_with(message: impl Into<String>) -> Self {
        Self::status(StatusCode::Failure, message)
    }

    pub fn perm_denied() -> Self {
        Self::status(StatusCode::PermissionDenied, "permission denied")
    }

    pub fn no_such_file(message: impl Into<String>) -> Self {
        Self::status(StatusCode::NoSuchFile, message)
    }

    pub fn bad_handle(operation: &str) -> Self {
        Self::status(
            StatusCode::BadMessage,
            format!("{}: invalid handle", operation),
        )
    }

    pub fn unsupported() -> Self {
        Self::status(StatusCode::OpUnsupported, "Unsupported message")
    }

    fn encode(&self, request_id: u32) -> BytesMut {
        let mut body = BytesMut::new();

        match self {
            Reply::Status { code, message } => {
                body.put_u8(MessageType::Status as u8);
                body.put_u32(request_id);
                body.put_u32((*code).into());
                codec::put_string(&mut body, message);
                codec::put_string(&mut body, "");
            }
            Reply::Handle(handle) => {
                body.put_u8(MessageType::Handle as u8);
                body.put_u32(request_id);
                codec::put_bytes(&mut body, handle);
            }
            Reply::Data(data) => {
                body.put_u8(MessageType::Data as u8);
                body.put_u32(request_id);
                codec::put_bytes(&mut body, data);
            }
            Reply::Name(entries) => {
                body.put_u8(MessageType::Name as u8);
                body.put_u32(request_id);
                body.put_u32(entries.len() as u32);
                for entry in entries {
                    codec::put_string(&mut body, &entry.filename);
                    codec::put_string(&mut body, &entry.longname);
                    body.put(entry.attrs.encode());
                }
            }
            Reply::Attrs(attrs) => {
                body.put_u8(MessageType::Attrs as u8);
                body.put_u32(request_id);
                body.put(attrs.encode());
            }
        }

        body
    }
}

/// Framing session over one helper channel.
pub struct SftpChannel {
    stream: Box<dyn SftpStream>,
}

impl SftpChannel {
    pub fn new(stream: Box<dyn SftpStream>) -> Self {
        Self { stream }
    }

    /// Serve the INIT/VERSION exchange that opens every SFTP session.
    pub async fn handshake(&mut self) -> Result<()> {
        let body = self
            .read_packet()
            .await
            .ok_or_else(|| Error::connection("channel closed before INIT"))?;

        let mut buf = &body[..];
        if buf.remaining() < 5 || buf.get_u8() != MessageType::Init as u8 {
            return Err(Error::protocol("expected INIT"));
        }
        let version = buf.get_u32();
        info!(version, "client initialized sftp session");

        let mut reply = BytesMut::new();
        reply.put_u8(MessageType::Version as u8);
        reply.put_u32(SFTP_VERSION);
        self.write_packet(&reply).await?;

        Ok(())
    }

    /// Read the next client request.
    ///
    /// `None` on end of stream, transport failure or an unparseable frame.
    pub async fn get_client_message(&mut self) -> Option<ClientMessage> {
        let body = self.read_packet().await?;

        match parse_client_message(&body) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!("dropping unparseable client frame: {}", e);
                None
            }
        }
    }

    /// Send the reply for `request_id`.
    pub async fn send_reply(&mut self, request_id: u32, reply: &Reply) -> Result<()> {
        let body = reply.encode(request_id);
        self.write_packet(&body).await
    }

    async fn read_packet(&mut self) -> Option<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        if self.stream.read_exact(&mut len_buf).await.is_err() {
            return None;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_PACKET_LEN {
            trace!(len, "bad frame length");
            return None;
        }

        let mut body = vec![0u8; len];
        if self.stream.read_exact(&mut body).await.is_err() {
            return None;
        }

        Some(body)
    }

    async fn write_packet(&mut self, body: &[u8]) -> Result<()> {
        let mut packet = BytesMut::with_capacity(4 + body.len());
        packet.put_u32(body.len() as u32);
        packet.put_slice(body);

        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn parse_client_message(body: &[u8]) -> Result<ClientMessage> {
    let mut buf = &body[..];
    if buf.remaining() < 5 {
        return Err(Error::protocol("frame too short for opcode and id"));
    }

    let opcode = buf.get_u8();
    let request_id = buf.get_u32();

    let mut msg = ClientMessage {
        opcode,
        request_id,
        ..Default::default()
    };

    let Ok(message_type) = MessageType::try_from(opcode) else {
        // Unknown opcode: the dispatcher answers OP_UNSUPPORTED, no fields
        // needed.
        return Ok(msg);
    };

    match message_type {
        MessageType::Open => {
            msg.filename = codec::get_string(&mut buf)?;
            if buf.remaining() < 4 {
                return Err(Error::protocol("OPEN missing pflags"));
            }
            msg.flags = buf.get_u32();
            msg.attrs = FileAttrs::decode(&mut buf)?;
        }
        MessageType::Close | MessageType::Readdir | MessageType::Fstat => {
            msg.handle = codec::get_bytes(&mut buf)?;
        }
        MessageType::Read => {
            msg.handle = codec::get_bytes(&mut buf)?;
            if buf.remaining() < 12 {
                return Err(Error::protocol("READ missing offset or length"));
            }
            msg.offset = buf.get_u64();
            msg.length = buf.get_u32();
        }
        MessageType::Write => {
            msg.handle = codec::get_bytes(&mut buf)?;
            if buf.remaining() < 8 {
                return Err(Error::protocol("WRITE missing offset"));
            }
            msg.offset = buf.get_u64();
            msg.data = codec::get_bytes(&mut buf)?;
        }
        MessageType::Opendir
        | MessageType::Stat
        | MessageType::Lstat
        | MessageType::Realpath
        | MessageType::Rmdir
        | MessageType::Remove
        | MessageType::Readlink => {
            msg.filename = codec::get_string(&mut buf)?;
        }
        MessageType::Setstat | MessageType::Mkdir => {
            msg.filename = codec::get_string(&mut buf)?;
            msg.attrs = FileAttrs::decode(&mut buf)?;
        }
        MessageType::Fsetstat => {
            msg.handle = codec::get_bytes(&mut buf)?;
            msg.attrs = FileAttrs::decode(&mut buf)?;
        }
        MessageType::Rename | MessageType::Symlink => {
            msg.filename = codec::get_string(&mut buf)?;
            msg.data = codec::get_bytes(&mut buf)?;
        }
        MessageType::Extended => {
            msg.submethod = Some(codec::get_string(&mut buf)?);
            // The two supported submethods carry a path pair; other bodies
            // are left unparsed for the unsupported reply.
            if let Ok(first) = codec::get_string(&mut buf) {
                msg.filename = first;
                if let Ok(second) = codec::get_bytes(&mut buf) {
                    msg.data = second;
                }
            }
        }
        _ => {
            // INIT after handshake, or a reply opcode from a confused
            // client; the dispatcher answers OP_UNSUPPORTED.
        }
    }

    Ok(msg)
}
