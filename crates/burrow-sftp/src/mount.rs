//! Remote mount helper lifecycle.
//!
//! The guest runs a user-space filesystem client (sshfs or compatible)
//! spawned over the secure session. Spawning polls the process briefly to
//! catch immediate failures; recovery after an unexpected death unmounts
//! whatever the dead helper left behind before a fresh helper is started.

use std::time::Duration;

use tracing::{debug, warn};

use crate::transport::{RemoteProcess, SshSession};
use crate::{Error, Result};

/// How long to wait on an exit-code poll before assuming the helper runs.
pub(crate) const HELPER_POLL: Duration = Duration::from_millis(250);

/// Backslash-escape every occurrence of `needle` in `value`.
pub fn escape_char(value: &str, needle: char) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == needle {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Launch the mount helper in the guest and confirm it came up.
pub(crate) async fn spawn_helper(
    session: &dyn SshSession,
    mount_command: &str,
    source: &str,
    target: &str,
) -> Result<Box<dyn RemoteProcess>> {
    let command = format!(
        "sudo {} :\"{}\" \"{}\"",
        mount_command,
        escape_char(source, '"'),
        escape_char(target, '"')
    );
    debug!(%command, "starting mount helper");

    let mut process = session.exec(&command).await?;

    match process.exit_code(HELPER_POLL).await? {
        // No exit within the window: the helper is up and serving.
        None => Ok(process),
        // Already gone with success; the session will wind down cleanly.
        Some(0) => Ok(process),
        Some(code) => {
            let stderr = process.read_std_error().await.unwrap_or_default();
            Err(Error::helper(format!(
                "mount helper exited with {}: {}",
                code,
                stderr.trim()
            )))
        }
    }
}

/// Find and unmount whatever a dead helper left mounted for `source`.
pub(crate) async fn unmount_stale(session: &dyn SshSession, source: &str) -> Result<()> {
    let mut probe = session
        .exec(&format!("findmnt --source :{} -o TARGET -n", source))
        .await?;

    let mount_path = probe.read_std_output().await?;
    let mount_path = mount_path.trim();

    if mount_path.is_empty() {
        debug!("no stale mount to clean up");
        return Ok(());
    }

    warn!(target = %mount_path, "unmounting stale mount");
    session.exec(&format!("sudo umount {}", mount_path)).await?;
    Ok(())
}
