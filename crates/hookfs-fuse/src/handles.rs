//! File and directory handles for FUSE operations.
//!
//! Open files are [`HookFile`]s, so reads, writes and syncs through a handle
//! stay hooked. Directories are listed once at opendir and served from that
//! snapshot until releasedir.

use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hookfs::{DirEntry, FileKind, HookFile};

use crate::error::{FuseError, FuseResult};

/// One entry of a directory snapshot, with the inode it was reported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSlot {
    pub ino: u64,
    pub kind: FileKind,
    pub name: OsString,
}

/// Handle type for FUSE operations.
///
/// Variants are cheap to clone so a worker can own the handle while the
/// table stays unlocked.
#[derive(Debug, Clone)]
pub enum FuseHandle {
    /// An open file.
    File(Arc<HookFile>),

    /// A directory listing taken at opendir, `.` and `..` first.
    Dir(Arc<Vec<DirSlot>>),
}

impl FuseHandle {
    /// Builds a directory handle from a listing.
    ///
    /// `inode_of` assigns the inode reported for each listed entry.
    pub fn dir(
        ino: u64,
        parent_ino: u64,
        entries: Vec<DirEntry>,
        mut inode_of: impl FnMut(&DirEntry) -> u64,
    ) -> Self {
        let mut slots = Vec::with_capacity(entries.len() + 2);
        slots.push(DirSlot {
            ino,
            kind: FileKind::Directory,
            name: OsString::from("."),
        });
        slots.push(DirSlot {
            ino: parent_ino,
            kind: FileKind::Directory,
            name: OsString::from(".."),
        });
        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            slots.push(DirSlot {
                ino: inode_of(&entry),
                kind: entry.kind,
                name: entry.name,
            });
        }
        FuseHandle::Dir(Arc::new(slots))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FuseHandle::File(_))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FuseHandle::Dir(_))
    }

    pub fn as_file(&self) -> FuseResult<&Arc<HookFile>> {
        match self {
            FuseHandle::File(f) => Ok(f),
            FuseHandle::Dir(_) => Err(FuseError::WrongHandleType),
        }
    }

    pub fn as_dir(&self) -> FuseResult<&Arc<Vec<DirSlot>>> {
        match self {
            FuseHandle::Dir(d) => Ok(d),
            FuseHandle::File(_) => Err(FuseError::WrongHandleType),
        }
    }
}

/// Thread-safe handle table with auto-incrementing IDs.
///
/// IDs start at 1; 0 is reserved for "no handle".
#[derive(Debug)]
pub struct HandleTable {
    handles: DashMap<u64, FuseHandle>,
    next_id: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a handle and returns its ID.
    pub fn insert(&self, handle: FuseHandle) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.handles.entry(id) {
                slot.insert(handle);
                return id;
            }
        }
    }

    /// Clones the handle out of the table.
    pub fn get(&self, fh: u64) -> FuseResult<FuseHandle> {
        self.handles
            .get(&fh)
            .map(|h| h.clone())
            .ok_or(FuseError::InvalidHandle(fh))
    }

    pub fn file(&self, fh: u64) -> FuseResult<Arc<HookFile>> {
        self.get(fh)?.as_file().cloned()
    }

    pub fn dir(&self, fh: u64) -> FuseResult<Arc<Vec<DirSlot>>> {
        self.get(fh)?.as_dir().cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<FuseHandle> {
        self.handles.remove(&fh).map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
