//! Injectable platform primitives.
//!
//! The handful of filesystem calls the dispatcher cannot do portably through
//! `tokio::fs` — ownership changes, timestamp writes, link creation and
//! lstat-style attribute reads — live behind the [`Platform`] trait so tests
//! can substitute a recording fake (changing ownership to arbitrary ids
//! needs root on a real filesystem).

use std::io;
use std::path::Path;

use crate::protocol::{FileAttrs, S_IFLNK};

/// Platform capability interface handed to the server.
pub trait Platform: Send + Sync {
    /// Change owner and group of `path`. An id of `-1` leaves that side
    /// unchanged, as the underlying syscall does.
    fn chown(&self, path: &Path, uid: i64, gid: i64) -> io::Result<()>;

    /// Set access and modification times of `path`, in seconds since epoch.
    fn utime(&self, path: &Path, atime: u32, mtime: u32) -> io::Result<()>;

    /// Create a symbolic link at `new` pointing to `old`. `is_dir` reports
    /// whether the target is a directory, for platforms that distinguish.
    fn symlink(&self, old: &Path, new: &Path, is_dir: bool) -> io::Result<()>;

    /// Create a hard link at `new` for `old`.
    fn link(&self, old: &Path, new: &Path) -> io::Result<()>;

    /// Read attributes of `path` itself, never following a final symlink.
    fn symlink_attr(&self, path: &Path) -> io::Result<FileAttrs>;

    /// Owner and group of `path`.
    fn ownership(&self, path: &Path) -> io::Result<(i64, i64)>;
}

/// [`Platform`] implementation backed by the host kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

#[cfg(unix)]
impl Platform for HostPlatform {
    fn chown(&self, path: &Path, uid: i64, gid: i64) -> io::Result<()> {
        let path_c = c_path(path)?;

        let ret = unsafe { libc::chown(path_c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn utime(&self, path: &Path, atime: u32, mtime: u32) -> io::Result<()> {
        let path_c = c_path(path)?;

        let times = [
            libc::timeval {
                tv_sec: atime as libc::time_t,
                tv_usec: 0,
            },
            libc::timeval {
                tv_sec: mtime as libc::time_t,
                tv_usec: 0,
            },
        ];

        let ret = unsafe { libc::utimes(path_c.as_ptr(), times.as_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn symlink(&self, old: &Path, new: &Path, _is_dir: bool) -> io::Result<()> {
        std::os::unix::fs::symlink(old, new)
    }

    fn link(&self, old: &Path, new: &Path) -> io::Result<()> {
        std::fs::hard_link(old, new)
    }

    fn symlink_attr(&self, path: &Path) -> io::Result<FileAttrs> {
        use std::os::unix::fs::MetadataExt;

        let info = std::fs::symlink_metadata(path)?;
        Ok(FileAttrs {
            size: Some(info.len()),
            uid: Some(info.uid()),
            gid: Some(info.gid()),
            permissions: Some(S_IFLNK | 0o777),
            atime: Some(info.atime() as u32),
            mtime: Some(info.mtime() as u32),
        })
    }

    fn ownership(&self, path: &Path) -> io::Result<(i64, i64)> {
        use std::os::unix::fs::MetadataExt;

        let info = std::fs::metadata(path)?;
        Ok((i64::from(info.uid()), i64::from(info.gid())))
    }
}

#[cfg(unix)]
fn c_path(path: &Path) -> io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;

    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}
