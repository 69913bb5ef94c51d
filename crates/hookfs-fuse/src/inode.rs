//! Inode management for the FUSE adapter.
//!
//! The façade is path-addressed while FUSE speaks in inode numbers. This
//! table maps between the two, with FUSE `nlookup` tracking so entries are
//! only evicted once the kernel forgets them. Paths are relative to the
//! backing root; the root itself is the empty path.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Path relative to the backing root.
    pub path: PathBuf,
    /// Lookup count for proper `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: PathBuf, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count by `count`.
    ///
    /// Returns `None`, leaving the count untouched, if it would go negative.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe bidirectional map between inodes and backing paths.
#[derive(Debug)]
pub struct InodeTable {
    path_to_id: DashMap<PathBuf, u64>,
    id_to_entry: DashMap<u64, InodeEntry>,
    next_id: AtomicU64,
}

impl InodeTable {
    /// Creates a table with the root directory pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            path_to_id: DashMap::new(),
            id_to_entry: DashMap::new(),
            next_id: AtomicU64::new(ROOT_INODE + 1),
        };
        table.path_to_id.insert(PathBuf::new(), ROOT_INODE);
        table
            .id_to_entry
            .insert(ROOT_INODE, InodeEntry::new(PathBuf::new(), 1));
        table
    }

    /// Returns the inode for `path`, allocating one if needed, and counts a lookup.
    ///
    /// Used by lookup, create, mkdir, mknod, symlink and link replies.
    pub fn get_or_insert(&self, path: &Path) -> u64 {
        if let Some(ino) = self.get_inode(path)
            && let Some(entry) = self.id_to_entry.get(&ino)
        {
            entry.inc_nlookup();
            return ino;
        }
        self.insert_with(path, 1)
    }

    /// Like [`get_or_insert`](Self::get_or_insert) without counting a lookup.
    ///
    /// Returning an entry from `readdir()` does not affect its lookup count.
    pub fn get_or_insert_no_lookup_inc(&self, path: &Path) -> u64 {
        if let Some(ino) = self.get_inode(path) {
            return ino;
        }
        self.insert_with(path, 0)
    }

    fn insert_with(&self, path: &Path, nlookup: u64) -> u64 {
        let mut counted = false;
        let ino = *self.path_to_id.entry(path.to_path_buf()).or_insert_with(|| {
            let ino = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.id_to_entry
                .insert(ino, InodeEntry::new(path.to_path_buf(), nlookup));
            counted = true;
            ino
        });
        // Lost the race to another inserter; count our lookup on its entry.
        if !counted
            && nlookup > 0
            && let Some(entry) = self.id_to_entry.get(&ino)
        {
            entry.inc_nlookup();
        }
        ino
    }

    /// Backing path of an inode.
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.id_to_entry.get(&ino).map(|e| e.path.clone())
    }

    /// Backing path of `name` inside directory `parent`.
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path_of(parent).map(|p| p.join(name))
    }

    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        self.path_to_id.get(path).map(|r| *r)
    }

    pub fn nlookup(&self, ino: u64) -> Option<u64> {
        self.id_to_entry.get(&ino).map(|e| e.nlookup())
    }

    /// Releases `nlookup` references; evicts the inode when none remain.
    ///
    /// Returns `true` if the inode was evicted. The root is never evicted.
    pub fn forget(&self, ino: u64, nlookup: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let remaining = match self.id_to_entry.get(&ino) {
            Some(entry) => entry.dec_nlookup(nlookup),
            None => return false,
        };
        if remaining != Some(0) {
            return false;
        }
        match self.id_to_entry.remove(&ino) {
            Some((_, entry)) => {
                self.path_to_id.remove_if(&entry.path, |_, id| *id == ino);
                true
            }
            None => false,
        }
    }

    /// Drops the path mapping after unlink or rmdir.
    ///
    /// The entry itself stays until the kernel forgets the inode, since it
    /// may still pass the number to later operations.
    pub fn invalidate_path(&self, path: &Path) {
        if path.as_os_str().is_empty() {
            return;
        }
        self.path_to_id.remove(path);
    }

    /// Moves `old` and everything below it to `new` after a rename.
    ///
    /// An inode previously known at `new` loses its path mapping, as the
    /// rename replaced it.
    pub fn rename(&self, old: &Path, new: &Path) {
        self.invalidate_path(new);
        let moved: Vec<(PathBuf, u64)> = self
            .path_to_id
            .iter()
            .filter(|e| e.key().starts_with(old) && !e.key().as_os_str().is_empty())
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (path, ino) in moved {
            let Ok(rest) = path.strip_prefix(old) else {
                continue;
            };
            let renamed = if rest.as_os_str().is_empty() {
                new.to_path_buf()
            } else {
                new.join(rest)
            };
            self.path_to_id.remove(&path);
            self.path_to_id.insert(renamed.clone(), ino);
            if let Some(mut entry) = self.id_to_entry.get_mut(&ino) {
                entry.path = renamed;
            }
        }
    }

    /// Number of inodes, including the root.
    pub fn len(&self) -> usize {
        self.id_to_entry.len()
    }

    /// Whether only the root is known.
    pub fn is_empty(&self) -> bool {
        self.id_to_entry.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
