//! Secure-transport seam.
//!
//! The bridge never owns the SSH stack. The embedding daemon hands it an
//! authenticated session through these traits: the ability to run a remote
//! command, watch its exit status, and take over the byte channel the remote
//! process speaks SFTP on. Tests substitute scripted in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

/// Byte channel carrying SFTP frames.
pub trait SftpStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SftpStream for T {}

/// An established, authenticated secure session to the guest.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Start a process on the remote side.
    async fn exec(&self, command: &str) -> Result<Box<dyn RemoteProcess>>;

    /// Tear the transport down hard.
    ///
    /// Contract: an in-flight channel read returns promptly and subsequent
    /// reads report end-of-stream. Callable from any thread; this is the only
    /// cross-thread entry point the bridge relies on.
    fn force_shutdown(&self);
}

/// A process running on the remote side of the session.
#[async_trait]
pub trait RemoteProcess: Send {
    /// Poll for the process exit code, waiting at most `wait`.
    ///
    /// `Ok(None)` means the process had not exited within the window.
    async fn exit_code(&mut self, wait: Duration) -> Result<Option<i32>>;

    /// Drain captured standard error.
    async fn read_std_error(&mut self) -> Result<String>;

    /// Drain captured standard output.
    async fn read_std_output(&mut self) -> Result<String>;

    /// Take ownership of the channel the process reads and writes on.
    ///
    /// May be called once per process; later calls fail.
    fn take_channel(&mut self) -> Result<Box<dyn SftpStream>>;
}
