//! Shared test harness: a scripted secure session, an in-memory SFTP client
//! and a recording platform fake.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use burrow_sftp::protocol::{codec, FileAttrs, MessageType, SFTP_VERSION};
use burrow_sftp::{
    Error, HostPlatform, MountConfig, Platform, RemoteProcess, Result, SftpServer, SftpStream,
    SshSession,
};

/// Scripted exit-code poll results for a [`ScriptedProcess`].
#[derive(Debug, Clone, Copy)]
pub enum Exit {
    Running,
    Code(i32),
    PollError,
}

/// A remote process whose exit codes, output and channel are all scripted.
pub struct ScriptedProcess {
    exits: VecDeque<Exit>,
    stdout: String,
    stderr: String,
    channel: Option<Box<dyn SftpStream>>,
}

#[async_trait]
impl RemoteProcess for ScriptedProcess {
    async fn exit_code(&mut self, _wait: Duration) -> Result<Option<i32>> {
        match self.exits.pop_front() {
            None | Some(Exit::Running) => Ok(None),
            Some(Exit::Code(code)) => Ok(Some(code)),
            Some(Exit::PollError) => Err(Error::connection("scripted poll failure")),
        }
    }

    async fn read_std_error(&mut self) -> Result<String> {
        Ok(self.stderr.clone())
    }

    async fn read_std_output(&mut self) -> Result<String> {
        Ok(self.stdout.clone())
    }

    fn take_channel(&mut self) -> Result<Box<dyn SftpStream>> {
        self.channel
            .take()
            .ok_or_else(|| Error::connection("channel already taken"))
    }
}

type SharedStream = Arc<Mutex<Option<DuplexStream>>>;

/// Secure session whose exec calls pop pre-scripted processes.
#[derive(Default)]
pub struct ScriptedSession {
    commands: Mutex<Vec<String>>,
    processes: Mutex<VecDeque<ScriptedProcess>>,
    client_ends: Mutex<Vec<SharedStream>>,
    shutdown_called: AtomicBool,
}

impl ScriptedSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a helper process carrying a live SFTP channel; returns the
    /// client side of that channel.
    pub fn push_helper(&self, exits: Vec<Exit>) -> TestClient {
        let (client_end, server_end) = duplex(1 << 16);
        let shared: SharedStream = Arc::new(Mutex::new(Some(client_end)));
        self.client_ends.lock().unwrap().push(shared.clone());

        self.processes.lock().unwrap().push_back(ScriptedProcess {
            exits: exits.into(),
            stdout: String::new(),
            stderr: String::new(),
            channel: Some(Box::new(server_end)),
        });

        TestClient::new(shared)
    }

    /// Queue a helper that dies immediately with `code` and `stderr`.
    pub fn push_failed_helper(&self, code: i32, stderr: &str) {
        self.processes.lock().unwrap().push_back(ScriptedProcess {
            exits: vec![Exit::Code(code)].into(),
            stdout: String::new(),
            stderr: stderr.to_string(),
            channel: None,
        });
    }

    /// Queue a plain command whose stdout is scripted (findmnt, umount, ...).
    pub fn push_output(&self, stdout: &str) {
        self.processes.lock().unwrap().push_back(ScriptedProcess {
            exits: VecDeque::new(),
            stdout: stdout.to_string(),
            stderr: String::new(),
            channel: None,
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn shutdown_was_called(&self) -> bool {
        self.shutdown_called.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshSession for ScriptedSession {
    async fn exec(&self, command: &str) -> Result<Box<dyn RemoteProcess>> {
        self.commands.lock().unwrap().push(command.to_string());

        let process = self
            .processes
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::connection("no scripted process for exec"))?;

        Ok(Box::new(process))
    }

    fn force_shutdown(&self) {
        self.shutdown_called.store(true, Ordering::SeqCst);
        for end in self.client_ends.lock().unwrap().iter() {
            end.lock().unwrap().take();
        }
    }
}

/// Platform fake: ownership changes and timestamp writes are recorded
/// instead of applied (they need root against a real filesystem); link and
/// symlink creation and lstat reads go to the real filesystem.
#[derive(Default)]
pub struct FakePlatform {
    pub chowns: Mutex<Vec<(PathBuf, i64, i64)>>,
    pub utimes: Mutex<Vec<(PathBuf, u32, u32)>>,
    pub ownership_overrides: Mutex<HashMap<PathBuf, (i64, i64)>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ownership(&self, path: impl Into<PathBuf>, uid: i64, gid: i64) {
        self.ownership_overrides
            .lock()
            .unwrap()
            .insert(path.into(), (uid, gid));
    }

    pub fn chown_calls(&self) -> Vec<(PathBuf, i64, i64)> {
        self.chowns.lock().unwrap().clone()
    }

    pub fn utime_calls(&self) -> Vec<(PathBuf, u32, u32)> {
        self.utimes.lock().unwrap().clone()
    }
}

impl Platform for FakePlatform {
    fn chown(&self, path: &Path, uid: i64, gid: i64) -> std::io::Result<()> {
        self.chowns
            .lock()
            .unwrap()
            .push((path.to_path_buf(), uid, gid));
        Ok(())
    }

    fn utime(&self, path: &Path, atime: u32, mtime: u32) -> std::io::Result<()> {
        self.utimes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), atime, mtime));
        Ok(())
    }

    fn symlink(&self, old: &Path, new: &Path, is_dir: bool) -> std::io::Result<()> {
        HostPlatform.symlink(old, new, is_dir)
    }

    fn link(&self, old: &Path, new: &Path) -> std::io::Result<()> {
        HostPlatform.link(old, new)
    }

    fn symlink_attr(&self, path: &Path) -> std::io::Result<FileAttrs> {
        HostPlatform.symlink_attr(path)
    }

    fn ownership(&self, path: &Path) -> std::io::Result<(i64, i64)> {
        if let Some(ids) = self.ownership_overrides.lock().unwrap().get(path) {
            return Ok(*ids);
        }
        HostPlatform.ownership(path)
    }
}

/// A decoded server reply.
#[derive(Debug)]
pub enum RawReply {
    Status { id: u32, code: u32, message: String },
    Handle { id: u32, handle: Vec<u8> },
    Data { id: u32, data: Vec<u8> },
    Name { id: u32, entries: Vec<(String, String, FileAttrs)> },
    Attrs { id: u32, attrs: FileAttrs },
}

impl RawReply {
    pub fn status_code(&self) -> u32 {
        match self {
            RawReply::Status { code, .. } => *code,
            other => panic!("expected status reply, got {:?}", other),
        }
    }

    pub fn handle(&self) -> Vec<u8> {
        match self {
            RawReply::Handle { handle, .. } => handle.clone(),
            other => panic!("expected handle reply, got {:?}", other),
        }
    }

    pub fn data(&self) -> Vec<u8> {
        match self {
            RawReply::Data { data, .. } => data.clone(),
            other => panic!("expected data reply, got {:?}", other),
        }
    }

    pub fn entries(&self) -> Vec<(String, String, FileAttrs)> {
        match self {
            RawReply::Name { entries, .. } => entries.clone(),
            other => panic!("expected name reply, got {:?}", other),
        }
    }

    pub fn attrs(&self) -> FileAttrs {
        match self {
            RawReply::Attrs { attrs, .. } => attrs.clone(),
            other => panic!("expected attrs reply, got {:?}", other),
        }
    }
}

/// Client end of the helper channel, speaking raw SFTP v3.
pub struct TestClient {
    stream: SharedStream,
    next_id: AtomicU32,
}

impl TestClient {
    fn new(stream: SharedStream) -> Self {
        Self {
            stream,
            next_id: AtomicU32::new(1),
        }
    }

    fn take_stream(&self) -> DuplexStream {
        self.stream
            .lock()
            .unwrap()
            .take()
            .expect("channel closed or in use")
    }

    fn put_stream(&self, stream: DuplexStream) {
        *self.stream.lock().unwrap() = Some(stream);
    }

    /// Drop the client end, producing end-of-stream on the server side.
    pub fn close_stream(&self) {
        self.stream.lock().unwrap().take();
    }

    pub async fn send_packet(&self, body: &[u8]) {
        let mut stream = self.take_stream();
        stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(body).await.unwrap();
        stream.flush().await.unwrap();
        self.put_stream(stream);
    }

    pub async fn recv_packet(&self) -> Vec<u8> {
        let mut stream = self.take_stream();
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut body).await.unwrap();
        self.put_stream(stream);
        body
    }

    pub async fn send_init(&self) {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Init as u8);
        body.put_u32(SFTP_VERSION);
        self.send_packet(&body).await;
    }

    pub async fn expect_version(&self) {
        let body = self.recv_packet().await;
        assert_eq!(body[0], MessageType::Version as u8);
    }

    pub async fn init(&self) {
        self.send_init().await;
        self.expect_version().await;
    }

    async fn roundtrip(&self, body: BytesMut, id: u32) -> RawReply {
        self.send_packet(&body).await;
        let reply = parse_reply(&self.recv_packet().await);
        let reply_id = match &reply {
            RawReply::Status { id, .. }
            | RawReply::Handle { id, .. }
            | RawReply::Data { id, .. }
            | RawReply::Name { id, .. }
            | RawReply::Attrs { id, .. } => *id,
        };
        assert_eq!(reply_id, id, "reply for wrong request");
        reply
    }

    fn begin(&self, message_type: MessageType) -> (BytesMut, u32) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut body = BytesMut::new();
        body.put_u8(message_type as u8);
        body.put_u32(id);
        (body, id)
    }

    pub async fn open(&self, path: &str, flags: u32, attrs: &FileAttrs) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Open);
        codec::put_string(&mut body, path);
        body.put_u32(flags);
        body.put(attrs.encode());
        self.roundtrip(body, id).await
    }

    pub async fn close(&self, handle: &[u8]) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Close);
        codec::put_bytes(&mut body, handle);
        self.roundtrip(body, id).await
    }

    pub async fn read(&self, handle: &[u8], offset: u64, len: u32) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Read);
        codec::put_bytes(&mut body, handle);
        body.put_u64(offset);
        body.put_u32(len);
        self.roundtrip(body, id).await
    }

    pub async fn write(&self, handle: &[u8], offset: u64, data: &[u8]) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Write);
        codec::put_bytes(&mut body, handle);
        body.put_u64(offset);
        codec::put_bytes(&mut body, data);
        self.roundtrip(body, id).await
    }

    pub async fn opendir(&self, path: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Opendir);
        codec::put_string(&mut body, path);
        self.roundtrip(body, id).await
    }

    pub async fn readdir(&self, handle: &[u8]) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Readdir);
        codec::put_bytes(&mut body, handle);
        self.roundtrip(body, id).await
    }

    pub async fn mkdir(&self, path: &str, attrs: &FileAttrs) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Mkdir);
        codec::put_string(&mut body, path);
        body.put(attrs.encode());
        self.roundtrip(body, id).await
    }

    pub async fn rmdir(&self, path: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Rmdir);
        codec::put_string(&mut body, path);
        self.roundtrip(body, id).await
    }

    pub async fn stat(&self, path: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Stat);
        codec::put_string(&mut body, path);
        self.roundtrip(body, id).await
    }

    pub async fn lstat(&self, path: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Lstat);
        codec::put_string(&mut body, path);
        self.roundtrip(body, id).await
    }

    pub async fn fstat(&self, handle: &[u8]) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Fstat);
        codec::put_bytes(&mut body, handle);
        self.roundtrip(body, id).await
    }

    pub async fn setstat(&self, path: &str, attrs: &FileAttrs) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Setstat);
        codec::put_string(&mut body, path);
        body.put(attrs.encode());
        self.roundtrip(body, id).await
    }

    pub async fn fsetstat(&self, handle: &[u8], attrs: &FileAttrs) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Fsetstat);
        codec::put_bytes(&mut body, handle);
        body.put(attrs.encode());
        self.roundtrip(body, id).await
    }

    pub async fn remove(&self, path: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Remove);
        codec::put_string(&mut body, path);
        self.roundtrip(body, id).await
    }

    pub async fn rename(&self, source: &str, target: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Rename);
        codec::put_string(&mut body, source);
        codec::put_string(&mut body, target);
        self.roundtrip(body, id).await
    }

    pub async fn symlink(&self, target: &str, link_path: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Symlink);
        codec::put_string(&mut body, target);
        codec::put_string(&mut body, link_path);
        self.roundtrip(body, id).await
    }

    pub async fn readlink(&self, path: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Readlink);
        codec::put_string(&mut body, path);
        self.roundtrip(body, id).await
    }

    pub async fn realpath(&self, path: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Realpath);
        codec::put_string(&mut body, path);
        self.roundtrip(body, id).await
    }

    pub async fn extended(&self, submethod: &str, first: &str, second: &str) -> RawReply {
        let (mut body, id) = self.begin(MessageType::Extended);
        codec::put_string(&mut body, submethod);
        codec::put_string(&mut body, first);
        codec::put_string(&mut body, second);
        self.roundtrip(body, id).await
    }

    pub async fn raw_request(&self, opcode: u8) -> RawReply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut body = BytesMut::new();
        body.put_u8(opcode);
        body.put_u32(id);
        self.roundtrip(body, id).await
    }
}

fn parse_reply(body: &[u8]) -> RawReply {
    let mut buf = &body[..];
    let message_type = buf.get_u8();
    let id = buf.get_u32();

    match MessageType::try_from(message_type).unwrap() {
        MessageType::Status => RawReply::Status {
            id,
            code: buf.get_u32(),
            message: codec::get_string(&mut buf).unwrap(),
        },
        MessageType::Handle => RawReply::Handle {
            id,
            handle: codec::get_bytes(&mut buf).unwrap(),
        },
        MessageType::Data => RawReply::Data {
            id,
            data: codec::get_bytes(&mut buf).unwrap(),
        },
        MessageType::Name => {
            let count = buf.get_u32();
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let filename = codec::get_string(&mut buf).unwrap();
                let longname = codec::get_string(&mut buf).unwrap();
                let attrs = FileAttrs::decode(&mut buf).unwrap();
                entries.push((filename, longname, attrs));
            }
            RawReply::Name { id, entries }
        }
        MessageType::Attrs => RawReply::Attrs {
            id,
            attrs: FileAttrs::decode(&mut buf).unwrap(),
        },
        other => panic!("unexpected reply type {:?}", other),
    }
}

/// A live bridge over scripted transport, ready for requests.
pub struct TestBridge {
    pub session: Arc<ScriptedSession>,
    pub platform: Arc<FakePlatform>,
    pub client: TestClient,
    pub server: SftpServer,
}

/// Start a server for `config` with a healthy scripted helper; the INIT
/// handshake is already done.
pub async fn start_bridge(config: MountConfig) -> TestBridge {
    let session = ScriptedSession::new();
    let client = session.push_helper(vec![Exit::Running, Exit::Code(0)]);
    let platform = FakePlatform::new();

    client.send_init().await;
    let server = SftpServer::new(session.clone(), config, platform.clone())
        .await
        .expect("bridge construction failed");
    client.expect_version().await;

    TestBridge {
        session,
        platform,
        client,
        server,
    }
}

/// Start a bridge for a source directory and run the dispatch loop in the
/// background; returns everything a request-level test needs.
pub async fn serve(config: MountConfig) -> (Arc<ScriptedSession>, Arc<FakePlatform>, TestClient) {
    let TestBridge {
        session,
        platform,
        client,
        mut server,
    } = start_bridge(config).await;

    tokio::spawn(async move { server.run().await });

    (session, platform, client)
}
