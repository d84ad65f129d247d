//! # Burrow SFTP
//!
//! Host-side SFTP (SSH File Transfer Protocol, version 3) server that exports
//! a single directory subtree to a remote user-space mount helper.
//!
//! The remote side runs a FUSE-style filesystem client (typically sshfs) and
//! issues SFTP requests over a previously-established secure channel; this
//! crate answers them against the local filesystem, enforcing an export-root
//! jail and translating uid/gid ownership across the guest/host boundary.
//!
//! ## Features
//!
//! - Full SFTP v3 request dispatch (open/read/write/stat/rename/symlink/...)
//! - `hardlink@openssh.com` and `posix-rename@openssh.com` extensions
//! - Bidirectional uid/gid mapping with sentinel fall-through
//! - Supervision of the remote mount helper, with stale-mount recovery
//! - Injectable transport and platform seams for testing
//!
//! The secure transport itself (authentication, encryption, remote process
//! execution) is the embedding daemon's business; it reaches this crate only
//! through the traits in [`transport`].

pub mod attrs;
pub mod channel;
pub mod config;
pub mod error;
pub mod handle;
pub mod idmap;
pub mod jail;
pub mod mount;
pub mod platform;
pub mod protocol;
pub mod server;
pub mod transport;

pub use channel::{ClientMessage, NameEntry, Reply, SftpChannel};
pub use config::MountConfig;
pub use error::{Error, Result};
pub use idmap::{IdMap, DEFAULT_ID, NO_ID_INFO};
pub use platform::{HostPlatform, Platform};
pub use server::{SftpServer, StopHandle};
pub use transport::{RemoteProcess, SftpStream, SshSession};
