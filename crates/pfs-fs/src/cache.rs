//! Injected inode cache.
//!
//! The core reparses inodes on demand; callers who want memoization hand
//! in a cache at construction. The interface is deliberately two
//! operations with no eviction contract: any discipline (LRU, unbounded,
//! process-global) is the caller's business.

use parking_lot::Mutex;
use pfs_ondisk::Inode;
use pfs_types::InodeNumber;
use std::collections::HashMap;

/// Key-value store for decoded inodes, keyed by inode number.
pub trait InodeCache: Send + Sync {
    /// Look up a previously added inode.
    fn get(&self, ino: InodeNumber) -> Option<Inode>;

    /// Record a decoded inode. Whether anything is retained is up to the
    /// implementation.
    fn add(&self, ino: InodeNumber, inode: &Inode);
}

impl<C: InodeCache + ?Sized> InodeCache for std::sync::Arc<C> {
    fn get(&self, ino: InodeNumber) -> Option<Inode> {
        (**self).get(ino)
    }

    fn add(&self, ino: InodeNumber, inode: &Inode) {
        (**self).add(ino, inode);
    }
}

/// The default cache: remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInodeCache;

impl InodeCache for NoopInodeCache {
    fn get(&self, _ino: InodeNumber) -> Option<Inode> {
        None
    }

    fn add(&self, _ino: InodeNumber, _inode: &Inode) {}
}

/// Unbounded in-memory cache, safe to share across threads.
#[derive(Debug, Default)]
pub struct MemoryInodeCache {
    map: Mutex<HashMap<InodeNumber, Inode>>,
}

impl MemoryInodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl InodeCache for MemoryInodeCache {
    fn get(&self, ino: InodeNumber) -> Option<Inode> {
        self.map.lock().get(&ino).cloned()
    }

    fn add(&self, ino: InodeNumber, inode: &Inode) {
        self.map.lock().insert(ino, inode.clone());
    }
}
