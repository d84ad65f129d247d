//! Opaque handle table.
//!
//! Open files and directory listing cursors live in two disjoint maps under
//! one id counter, so a handle is unique across both and a file handle can
//! never be served to a directory request or vice versa. Handles travel on
//! the wire as four big-endian bytes.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

/// An open file plus the path it was opened under (FSTAT and FSETSTAT need
/// the path back).
pub struct FileHandle {
    pub file: tokio::fs::File,
    pub path: PathBuf,
}

/// One entry of a directory snapshot, with its lstat-style metadata.
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
    pub metadata: std::fs::Metadata,
}

impl DirEntryInfo {
    pub fn is_symlink(&self) -> bool {
        self.metadata.file_type().is_symlink()
    }
}

/// A directory listing cursor: the snapshot taken at open time, consumed
/// front to back and never refreshed.
pub struct DirHandle {
    entries: VecDeque<DirEntryInfo>,
}

impl DirHandle {
    pub fn new(entries: Vec<DirEntryInfo>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take up to `n` entries off the front of the cursor.
    pub fn drain(&mut self, n: usize) -> Vec<DirEntryInfo> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n).collect()
    }
}

/// Table of all handles issued to the client.
#[derive(Default)]
pub struct HandleTable {
    files: HashMap<u32, FileHandle>,
    dirs: HashMap<u32, DirHandle>,
    next_id: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&mut self, file: tokio::fs::File, path: PathBuf) -> Vec<u8> {
        let id = self.allocate_id();
        self.files.insert(id, FileHandle { file, path });
        id.to_be_bytes().to_vec()
    }

    pub fn insert_dir(&mut self, entries: Vec<DirEntryInfo>) -> Vec<u8> {
        let id = self.allocate_id();
        self.dirs.insert(id, DirHandle::new(entries));
        id.to_be_bytes().to_vec()
    }

    pub fn file(&self, handle: &[u8]) -> Option<&FileHandle> {
        self.files.get(&decode_id(handle)?)
    }

    pub fn file_mut(&mut self, handle: &[u8]) -> Option<&mut FileHandle> {
        self.files.get_mut(&decode_id(handle)?)
    }

    pub fn dir_mut(&mut self, handle: &[u8]) -> Option<&mut DirHandle> {
        self.dirs.get_mut(&decode_id(handle)?)
    }

    /// Destroy a handle, whichever map holds it. False if it names neither
    /// an open file nor a directory cursor.
    pub fn close(&mut self, handle: &[u8]) -> bool {
        let Some(id) = decode_id(handle) else {
            return false;
        };

        self.files.remove(&id).is_some() || self.dirs.remove(&id).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

fn decode_id(handle: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = handle.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
