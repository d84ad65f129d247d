//! Local metadata to wire attribute conversion, and `ls -l` long names.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use chrono::{TimeZone, Utc};

use crate::idmap::IdMap;
use crate::protocol::{FileAttrs, S_IFDIR, S_IFLNK, S_IFREG};

pub const READ_USER: u32 = 0o400;
pub const WRITE_USER: u32 = 0o200;
pub const EXEC_USER: u32 = 0o100;
pub const READ_GROUP: u32 = 0o040;
pub const WRITE_GROUP: u32 = 0o020;
pub const EXEC_GROUP: u32 = 0o010;
pub const READ_OTHER: u32 = 0o004;
pub const WRITE_OTHER: u32 = 0o002;
pub const EXEC_OTHER: u32 = 0o001;

/// Mask of the nine rwx bits carried on the wire.
pub const PERMISSION_MASK: u32 = 0o777;

/// Extract the nine permission bits from a host mode word.
pub fn to_wire_permissions(mode: u32) -> u32 {
    mode & PERMISSION_MASK
}

/// Build host filesystem permissions from a wire permissions field.
pub fn to_fs_permissions(wire: u32) -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    std::fs::Permissions::from_mode(wire & PERMISSION_MASK)
}

/// Convert local file metadata into the wire attribute record.
///
/// Fills every field the protocol knows: size, mapped uid/gid, the nine
/// permission bits plus a file-type bit, and atime/mtime in seconds since
/// the epoch (UTC). Symbolic links report `S_IFLNK | 0777`.
pub fn wire_attrs(info: &Metadata, ids: &IdMap) -> FileAttrs {
    let mut permissions = to_wire_permissions(info.mode());

    if info.file_type().is_symlink() {
        permissions = S_IFLNK | 0o777;
    } else if info.is_dir() {
        permissions |= S_IFDIR;
    } else if info.is_file() {
        permissions |= S_IFREG;
    }

    FileAttrs {
        size: Some(info.len()),
        uid: Some(ids.mapped_uid(i64::from(info.uid())) as u32),
        gid: Some(ids.mapped_gid(i64::from(info.gid())) as u32),
        permissions: Some(permissions),
        atime: Some(info.atime() as u32),
        mtime: Some(info.mtime() as u32),
    }
}

/// Build the `ls -l` style long name for a directory entry.
///
/// `<type><rwxrwxrwx> 1 <uid> <gid> <size> <MMM d hh:mm:ss yyyy> <name>`,
/// with the numeric owner and group as the host sees them (pre-mapping).
pub fn long_name(info: &Metadata, displayname: &str) -> String {
    let mut out = String::with_capacity(64 + displayname.len());

    out.push(if info.file_type().is_symlink() {
        'l'
    } else if info.is_dir() {
        'd'
    } else {
        '-'
    });

    let mode = info.mode();
    for (bit, ch) in [
        (READ_USER, 'r'),
        (WRITE_USER, 'w'),
        (EXEC_USER, 'x'),
        (READ_GROUP, 'r'),
        (WRITE_GROUP, 'w'),
        (EXEC_GROUP, 'x'),
        (READ_OTHER, 'r'),
        (WRITE_OTHER, 'w'),
        (EXEC_OTHER, 'x'),
    ] {
        out.push(if mode & bit != 0 { ch } else { '-' });
    }

    let timestamp = Utc
        .timestamp_opt(info.mtime(), 0)
        .single()
        .unwrap_or_default()
        .format("%b %-d %H:%M:%S %Y");

    out.push_str(&format!(
        " 1 {} {} {} {} {}",
        info.uid(),
        info.gid(),
        info.len(),
        timestamp,
        displayname
    ));

    out
}
