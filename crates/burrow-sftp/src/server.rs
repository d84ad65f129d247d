//! The SFTP request dispatcher and session controller.
//!
//! One server instance serves one guest mount: it spawns the remote mount
//! helper, then answers the helper's SFTP requests against the local
//! filesystem until the stream ends. Requests are handled strictly one at a
//! time; replies go out in request order. The only operation another thread
//! may perform is [`StopHandle::stop`].

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::attrs;
use crate::channel::{ClientMessage, NameEntry, Reply, SftpChannel};
use crate::config::MountConfig;
use crate::handle::{DirEntryInfo, HandleTable};
use crate::idmap::{wire_id, IdMap, NO_ID_INFO};
use crate::jail;
use crate::mount;
use crate::platform::Platform;
use crate::protocol::{
    FileAttrs, MessageType, OpenFlags, StatusCode, EXT_HARDLINK, EXT_POSIX_RENAME,
    MAX_READDIR_ENTRIES, MAX_READ_LEN,
};
use crate::transport::{RemoteProcess, SshSession};
use crate::Result;

/// Host-side SFTP server for one exported directory.
pub struct SftpServer {
    session: Arc<dyn SshSession>,
    helper: Box<dyn RemoteProcess>,
    channel: SftpChannel,
    config: MountConfig,
    ids: IdMap,
    handles: HandleTable,
    platform: Arc<dyn Platform>,
    stop_requested: Arc<AtomicBool>,
}

/// Cross-thread stop control for a running [`SftpServer`].
#[derive(Clone)]
pub struct StopHandle {
    stop_requested: Arc<AtomicBool>,
    session: Arc<dyn SshSession>,
}

impl StopHandle {
    /// Request shutdown and force the in-flight channel read to return.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.session.force_shutdown();
    }
}

impl SftpServer {
    /// Spawn the mount helper over `session` and open the SFTP session on
    /// its channel.
    pub async fn new(
        session: Arc<dyn SshSession>,
        config: MountConfig,
        platform: Arc<dyn Platform>,
    ) -> Result<Self> {
        config.validate()?;

        let mut helper = mount::spawn_helper(
            session.as_ref(),
            &config.mount_command,
            &config.source,
            &config.target,
        )
        .await?;

        let mut channel = SftpChannel::new(helper.take_channel()?);
        channel.handshake().await?;

        let ids = IdMap::new(
            config.uid_mappings.clone(),
            config.gid_mappings.clone(),
            config.default_uid,
            config.default_gid,
        );

        info!(source = %config.source, target = %config.target, "sftp bridge ready");

        Ok(Self {
            session,
            helper,
            channel,
            config,
            ids,
            handles: HandleTable::new(),
            platform,
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for stopping the server from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_requested: self.stop_requested.clone(),
            session: self.session.clone(),
        }
    }

    /// Serve requests until stop is requested, the helper ends cleanly, or
    /// recovery of a dead helper fails.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let Some(msg) = self.channel.get_client_message().await else {
                if self.stop_requested.load(Ordering::SeqCst) {
                    break;
                }

                // No message and no stop request: find out what happened to
                // the helper. A poll timeout or failure counts as a dead
                // helper with a wedged channel.
                let status = match self.helper.exit_code(mount::HELPER_POLL).await {
                    Ok(Some(code)) => code,
                    Ok(None) | Err(_) => 1,
                };

                if status != 0 {
                    error!(
                        "mount helper in the guest appears to have exited unexpectedly, \
                         trying to recover"
                    );
                    self.recover().await?;
                    continue;
                }

                break;
            };

            self.process_message(&msg).await;
        }

        Ok(())
    }

    /// Clean up whatever the dead helper left mounted, then start a fresh
    /// helper and SFTP session on its channel.
    async fn recover(&mut self) -> Result<()> {
        mount::unmount_stale(self.session.as_ref(), &self.config.source).await?;

        self.helper = mount::spawn_helper(
            self.session.as_ref(),
            &self.config.mount_command,
            &self.config.source,
            &self.config.target,
        )
        .await?;

        self.channel = SftpChannel::new(self.helper.take_channel()?);
        self.channel.handshake().await?;

        info!("mount helper restarted");
        Ok(())
    }

    async fn process_message(&mut self, msg: &ClientMessage) {
        let reply = self.dispatch(msg).await;

        if let Err(e) = self.channel.send_reply(msg.request_id, &reply).await {
            error!("error occurred when replying to client: {}", e);
        }
    }

    async fn dispatch(&mut self, msg: &ClientMessage) -> Reply {
        match MessageType::try_from(msg.opcode) {
            Ok(MessageType::Realpath) => self.handle_realpath(msg),
            Ok(MessageType::Opendir) => self.handle_opendir(msg).await,
            Ok(MessageType::Mkdir) => self.handle_mkdir(msg).await,
            Ok(MessageType::Rmdir) => self.handle_rmdir(msg).await,
            Ok(MessageType::Lstat) => self.handle_stat(msg, false).await,
            Ok(MessageType::Stat) => self.handle_stat(msg, true).await,
            Ok(MessageType::Fstat) => self.handle_fstat(msg).await,
            Ok(MessageType::Readdir) => self.handle_readdir(msg),
            Ok(MessageType::Close) => self.handle_close(msg),
            Ok(MessageType::Open) => self.handle_open(msg).await,
            Ok(MessageType::Read) => self.handle_read(msg).await,
            Ok(MessageType::Write) => self.handle_write(msg).await,
            Ok(MessageType::Rename) => self.handle_rename(msg).await,
            Ok(MessageType::Remove) => self.handle_remove(msg).await,
            Ok(MessageType::Setstat) => self.handle_setstat(msg, false).await,
            Ok(MessageType::Fsetstat) => self.handle_setstat(msg, true).await,
            Ok(MessageType::Readlink) => self.handle_readlink(msg).await,
            Ok(MessageType::Symlink) => self.handle_symlink(msg).await,
            Ok(MessageType::Extended) => self.handle_extended(msg).await,
            Ok(other) => {
                trace!("Unexpected message: {:?}", other);
                Reply::unsupported()
            }
            Err(_) => {
                trace!("Unknown message: {}", msg.opcode);
                Reply::unsupported()
            }
        }
    }

    fn in_jail(&self, path: &str) -> bool {
        jail::is_inside(&self.config.source, path)
    }

    fn jail_deny(&self, operation: &str, path: &str) -> Reply {
        trace!(
            "{}: cannot validate path '{}' against source '{}'",
            operation,
            path,
            self.config.source
        );
        Reply::perm_denied()
    }

    /// Remap the raw owner and group of an lstat-sourced attribute record.
    fn map_link_ids(&self, mut attrs: FileAttrs) -> FileAttrs {
        attrs.uid = attrs.uid.map(|u| self.ids.mapped_uid(i64::from(u)) as u32);
        attrs.gid = attrs.gid.map(|g| self.ids.mapped_gid(i64::from(g)) as u32);
        attrs
    }

    /// Chown a newly created entry: reverse-map the requested ids, falling
    /// back to the containing directory's owner and group where the remote
    /// side had no opinion.
    fn apply_new_entry_ownership(
        &self,
        path: &str,
        requested: &FileAttrs,
    ) -> std::result::Result<(), Reply> {
        let parent = Path::new(path).parent().unwrap_or_else(|| Path::new("/"));
        let (parent_uid, parent_gid) = self
            .platform
            .ownership(parent)
            .unwrap_or((NO_ID_INFO, NO_ID_INFO));

        let uid = self.ids.reverse_uid(wire_id(requested.uid), parent_uid);
        let gid = self.ids.reverse_gid(wire_id(requested.gid), parent_gid);

        if let Err(e) = self.platform.chown(Path::new(path), uid, gid) {
            trace!(
                "failed to chown '{}' to owner:{} and group:{}: {}",
                path,
                uid,
                gid,
                e
            );
            return Err(Reply::failure());
        }

        Ok(())
    }

    fn handle_realpath(&self, msg: &ClientMessage) -> Reply {
        if !self.in_jail(&msg.filename) {
            return self.jail_deny("realpath", &msg.filename);
        }

        Reply::Name(vec![NameEntry::bare(absolute_path(&msg.filename))])
    }

    async fn handle_opendir(&mut self, msg: &ClientMessage) -> Reply {
        if !self.in_jail(&msg.filename) {
            return self.jail_deny("opendir", &msg.filename);
        }

        let mut read_dir = match fs::read_dir(&msg.filename).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("Cannot open directory '{}': no such directory", msg.filename);
                return Reply::no_such_file("no such directory");
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                trace!("Cannot read directory '{}': permission denied", msg.filename);
                return Reply::perm_denied();
            }
            Err(e) => {
                trace!("Cannot open directory '{}': {}", msg.filename, e);
                return Reply::failure();
            }
        };

        // Snapshot every entry, hidden and system files included. The
        // cursor never refreshes.
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if let Ok(metadata) = fs::symlink_metadata(&path).await {
                entries.push(DirEntryInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path,
                    metadata,
                });
            }
        }

        Reply::Handle(self.handles.insert_dir(entries))
    }

    fn handle_readdir(&mut self, msg: &ClientMessage) -> Reply {
        let Some(dir) = self.handles.dir_mut(&msg.handle) else {
            trace!("readdir: bad handle requested");
            return Reply::bad_handle("readdir");
        };

        if dir.is_empty() {
            return Reply::status(StatusCode::Eof, "");
        }

        let batch = dir.drain(MAX_READDIR_ENTRIES);

        let mut entries = Vec::with_capacity(batch.len());
        for entry in batch {
            let attrs = if entry.is_symlink() {
                match self.platform.symlink_attr(&entry.path) {
                    Ok(link_attrs) => self.map_link_ids(link_attrs),
                    Err(_) => attrs::wire_attrs(&entry.metadata, &self.ids),
                }
            } else {
                attrs::wire_attrs(&entry.metadata, &self.ids)
            };

            let longname = attrs::long_name(&entry.metadata, &entry.name);
            entries.push(NameEntry {
                filename: entry.name,
                longname,
                attrs,
            });
        }

        Reply::Name(entries)
    }

    async fn handle_mkdir(&mut self, msg: &ClientMessage) -> Reply {
        if !self.in_jail(&msg.filename) {
            return self.jail_deny("mkdir", &msg.filename);
        }

        if let Err(e) = fs::create_dir(&msg.filename).await {
            trace!("mkdir: failed for '{}': {}", msg.filename, e);
            return Reply::failure();
        }

        if let Some(permissions) = msg.attrs.permissions {
            if let Err(e) =
                fs::set_permissions(&msg.filename, attrs::to_fs_permissions(permissions)).await
            {
                trace!("mkdir: set permissions failed for '{}': {}", msg.filename, e);
                return Reply::failure();
            }
        }

        match self.apply_new_entry_ownership(&msg.filename, &msg.attrs) {
            Ok(()) => Reply::ok(),
            Err(reply) => reply,
        }
    }

    async fn handle_rmdir(&mut self, msg: &ClientMessage) -> Reply {
        if !self.in_jail(&msg.filename) {
            return self.jail_deny("rmdir", &msg.filename);
        }

        if let Err(e) = fs::remove_dir(&msg.filename).await {
            trace!("rmdir: failed for '{}': {}", msg.filename, e);
            return Reply::failure();
        }

        Reply::ok()
    }

    async fn handle_open(&mut self, msg: &ClientMessage) -> Reply {
        if !self.in_jail(&msg.filename) {
            return self.jail_deny("open", &msg.filename);
        }

        let flags = OpenFlags(msg.flags);
        let mut options = fs::OpenOptions::new();
        let mut append = flags.has_append();

        if flags.has_read() {
            options.read(true);
        }
        if flags.has_write() {
            options.write(true).create(true);

            // Some mount helpers drop O_APPEND on the way through (sshfs
            // before 3.2) and present a bare WRITE mask instead.
            if flags.is_write_only() && self.config.write_append_workaround {
                info!("adding write-only append workaround");
                append = true;
            }
        }
        if append {
            options.append(true);
        }
        if flags.has_trunc() {
            options.truncate(true);
        }

        let existed = fs::symlink_metadata(&msg.filename).await.is_ok();

        let file = match options.open(&msg.filename).await {
            Ok(file) => file,
            Err(e) => {
                trace!("Cannot open '{}': {}", msg.filename, e);
                return Reply::failure();
            }
        };

        if !existed {
            if let Some(permissions) = msg.attrs.permissions {
                if let Err(e) =
                    fs::set_permissions(&msg.filename, attrs::to_fs_permissions(permissions)).await
                {
                    trace!("Cannot set permissions for '{}': {}", msg.filename, e);
                    return Reply::failure();
                }
            }

            if let Err(reply) = self.apply_new_entry_ownership(&msg.filename, &msg.attrs) {
                return reply;
            }
        }

        Reply::Handle(
            self.handles
                .insert_file(file, PathBuf::from(&msg.filename)),
        )
    }

    async fn handle_read(&mut self, msg: &ClientMessage) -> Reply {
        let Some(handle) = self.handles.file_mut(&msg.handle) else {
            trace!("read: bad handle requested");
            return Reply::bad_handle("read");
        };

        let len = msg.length.min(MAX_READ_LEN) as usize;

        if let Err(e) = handle.file.seek(SeekFrom::Start(msg.offset)).await {
            trace!(
                "read: cannot seek to position {} in '{}': {}",
                msg.offset,
                handle.path.display(),
                e
            );
            return Reply::failure();
        }

        let mut buffer = vec![0u8; len];
        match handle.file.read(&mut buffer).await {
            Ok(0) => Reply::status(StatusCode::Eof, "End of file"),
            Ok(n) => {
                buffer.truncate(n);
                Reply::Data(buffer)
            }
            Err(e) => {
                trace!("read: failed for '{}': {}", handle.path.display(), e);
                Reply::failure_with(e.to_string())
            }
        }
    }

    async fn handle_write(&mut self, msg: &ClientMessage) -> Reply {
        let Some(handle) = self.handles.file_mut(&msg.handle) else {
            trace!("write: bad handle requested");
            return Reply::bad_handle("write");
        };

        if let Err(e) = handle.file.seek(SeekFrom::Start(msg.offset)).await {
            trace!(
                "write: cannot seek to position {} in '{}': {}",
                msg.offset,
                handle.path.display(),
                e
            );
            return Reply::failure();
        }

        // Write everything, flushing after every partial write.
        let mut remaining = &msg.data[..];
        while !remaining.is_empty() {
            match handle.file.write(remaining).await {
                Ok(0) => {
                    trace!("write: no progress for '{}'", handle.path.display());
                    return Reply::failure();
                }
                Ok(n) => {
                    if let Err(e) = handle.file.flush().await {
                        trace!("write: flush failed for '{}': {}", handle.path.display(), e);
                        return Reply::failure();
                    }
                    remaining = &remaining[n..];
                }
                Err(e) => {
                    trace!("write: failed for '{}': {}", handle.path.display(), e);
                    return Reply::failure();
                }
            }
        }

        Reply::ok()
    }

    fn handle_close(&mut self, msg: &ClientMessage) -> Reply {
        if self.handles.close(&msg.handle) {
            Reply::ok()
        } else {
            trace!("close: bad handle requested");
            Reply::bad_handle("close")
        }
    }

    async fn handle_stat(&mut self, msg: &ClientMessage, follow: bool) -> Reply {
        if !self.in_jail(&msg.filename) {
            return self.jail_deny("stat", &msg.filename);
        }

        let info = match fs::symlink_metadata(&msg.filename).await {
            Ok(info) => info,
            Err(_) => {
                trace!("stat: cannot stat '{}': no such file", msg.filename);
                return Reply::no_such_file("no such file");
            }
        };

        if !follow && info.file_type().is_symlink() {
            return match self.platform.symlink_attr(Path::new(&msg.filename)) {
                Ok(link_attrs) => Reply::Attrs(self.map_link_ids(link_attrs)),
                Err(e) => {
                    trace!("stat: cannot read link attributes of '{}': {}", msg.filename, e);
                    Reply::failure()
                }
            };
        }

        // Following: a dangling symlink has nothing behind it.
        match fs::metadata(&msg.filename).await {
            Ok(info) => Reply::Attrs(attrs::wire_attrs(&info, &self.ids)),
            Err(_) => {
                trace!("stat: cannot stat '{}': no such file", msg.filename);
                Reply::no_such_file("no such file")
            }
        }
    }

    async fn handle_fstat(&mut self, msg: &ClientMessage) -> Reply {
        let Some(handle) = self.handles.file(&msg.handle) else {
            trace!("fstat: bad handle requested");
            return Reply::bad_handle("fstat");
        };

        // Follows the handle's path so a symlink reports its target.
        match fs::metadata(&handle.path).await {
            Ok(info) => Reply::Attrs(attrs::wire_attrs(&info, &self.ids)),
            Err(e) => {
                trace!("fstat: failed for '{}': {}", handle.path.display(), e);
                Reply::failure_with(e.to_string())
            }
        }
    }

    async fn handle_setstat(&mut self, msg: &ClientMessage, by_handle: bool) -> Reply {
        let filename = if by_handle {
            match self.handles.file(&msg.handle) {
                Some(handle) => handle.path.clone(),
                None => {
                    trace!("setstat: bad handle requested");
                    return Reply::bad_handle("setstat");
                }
            }
        } else {
            if !self.in_jail(&msg.filename) {
                return self.jail_deny("setstat", &msg.filename);
            }

            if fs::symlink_metadata(&msg.filename).await.is_err() {
                trace!("setstat: cannot setstat '{}': no such file", msg.filename);
                return Reply::no_such_file("no such file");
            }

            PathBuf::from(&msg.filename)
        };

        if let Some(size) = msg.attrs.size {
            let resized = match fs::OpenOptions::new().write(true).open(&filename).await {
                Ok(file) => file.set_len(size).await.is_ok(),
                Err(_) => false,
            };
            if !resized {
                trace!("setstat: cannot resize '{}'", filename.display());
                return Reply::failure();
            }
        }

        if let Some(permissions) = msg.attrs.permissions {
            if let Err(e) =
                fs::set_permissions(&filename, attrs::to_fs_permissions(permissions)).await
            {
                trace!(
                    "setstat: set permissions failed for '{}': {}",
                    filename.display(),
                    e
                );
                return Reply::failure();
            }
        }

        if let (Some(atime), Some(mtime)) = (msg.attrs.atime, msg.attrs.mtime) {
            if let Err(e) = self.platform.utime(&filename, atime, mtime) {
                trace!(
                    "setstat: cannot set modification date for '{}': {}",
                    filename.display(),
                    e
                );
                return Reply::failure();
            }
        }

        if msg.attrs.uid.is_some() || msg.attrs.gid.is_some() {
            // The message's own ids double as the reverse fallback here: an
            // unmapped guest id is applied as sent.
            let uid = wire_id(msg.attrs.uid);
            let gid = wire_id(msg.attrs.gid);
            let uid = self.ids.reverse_uid(uid, uid);
            let gid = self.ids.reverse_gid(gid, gid);

            if let Err(e) = self.platform.chown(&filename, uid, gid) {
                trace!(
                    "setstat: cannot set ownership for '{}': {}",
                    filename.display(),
                    e
                );
                return Reply::failure();
            }
        }

        Reply::ok()
    }

    async fn handle_readlink(&mut self, msg: &ClientMessage) -> Reply {
        if !self.in_jail(&msg.filename) {
            return self.jail_deny("readlink", &msg.filename);
        }

        match fs::read_link(&msg.filename).await {
            Ok(target) => Reply::Name(vec![NameEntry::bare(target.to_string_lossy())]),
            Err(_) => {
                trace!("readlink: invalid link for '{}'", msg.filename);
                Reply::no_such_file("invalid link")
            }
        }
    }

    async fn handle_symlink(&mut self, msg: &ClientMessage) -> Reply {
        // Only the link's own location is jailed; the target may point
        // anywhere, it just won't resolve for the guest.
        let link_target = &msg.filename;
        let link_path = msg.data_path();

        if !self.in_jail(&link_path) {
            return self.jail_deny("symlink", &link_path);
        }

        let is_dir = fs::metadata(link_target)
            .await
            .map(|info| info.is_dir())
            .unwrap_or(false);

        if let Err(e) =
            self.platform
                .symlink(Path::new(link_target), Path::new(&link_path), is_dir)
        {
            trace!(
                "symlink: failure creating symlink from '{}' to '{}': {}",
                link_target,
                link_path,
                e
            );
            return Reply::failure();
        }

        Reply::ok()
    }

    async fn handle_rename(&mut self, msg: &ClientMessage) -> Reply {
        let source = &msg.filename;
        if !self.in_jail(source) {
            return self.jail_deny("rename", source);
        }

        if fs::symlink_metadata(source).await.is_err() {
            trace!("rename: cannot rename '{}': no such file", source);
            return Reply::no_such_file("no such file");
        }

        let target = msg.data_path();
        if !self.in_jail(&target) {
            return self.jail_deny("rename", &target);
        }

        if fs::metadata(&target).await.is_ok() {
            if let Err(e) = fs::remove_file(&target).await {
                trace!("rename: cannot remove '{}' for renaming: {}", target, e);
                return Reply::failure();
            }
        }

        if let Err(e) = fs::rename(source, &target).await {
            trace!("rename: failed renaming '{}' to '{}': {}", source, target, e);
            return Reply::failure();
        }

        Reply::ok()
    }

    async fn handle_remove(&mut self, msg: &ClientMessage) -> Reply {
        if !self.in_jail(&msg.filename) {
            return self.jail_deny("remove", &msg.filename);
        }

        if let Err(e) = fs::remove_file(&msg.filename).await {
            trace!("remove: cannot remove '{}': {}", msg.filename, e);
            return Reply::failure();
        }

        Reply::ok()
    }

    async fn handle_extended(&mut self, msg: &ClientMessage) -> Reply {
        let Some(submethod) = msg.submethod.as_deref() else {
            trace!("extended: invalid submessage requested");
            return Reply::failure();
        };

        match submethod {
            EXT_HARDLINK => {
                let new_name = msg.data_path();
                if !self.in_jail(&new_name) {
                    return self.jail_deny("hardlink", &new_name);
                }

                if let Err(e) = self
                    .platform
                    .link(Path::new(&msg.filename), Path::new(&new_name))
                {
                    trace!(
                        "hardlink: failed creating link from '{}' to '{}': {}",
                        msg.filename,
                        new_name,
                        e
                    );
                    return Reply::failure();
                }

                Reply::ok()
            }
            EXT_POSIX_RENAME => self.handle_rename(msg).await,
            other => {
                trace!("Unhandled extended method requested: {}", other);
                Reply::unsupported()
            }
        }
    }
}

impl Drop for SftpServer {
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);

        let open = self.handles.open_count();
        if open > 0 {
            debug!("releasing {} open handles on session end", open);
        }
    }
}

/// Absolute form of `path`, without touching symlinks.
fn absolute_path(path: &str) -> String {
    if Path::new(path).is_absolute() {
        return path.to_string();
    }

    std::env::current_dir()
        .map(|cwd| cwd.join(path).to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}
