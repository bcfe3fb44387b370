#![forbid(unsafe_code)]
//! Hierarchical facade over an ext4 image.
//!
//! A `Filesystem` is built once from a random-access byte source: the
//! superblock and group descriptor table are parsed at construction and
//! held immutably, inodes are reparsed on demand (optionally memoized via
//! an injected cache), and extent lists and directory listings are
//! transient values produced per traversal. All I/O is positional, so one
//! filesystem value can serve concurrent readers.

mod cache;

pub use cache::{InodeCache, MemoryInodeCache, NoopInodeCache};
pub use pfs_error::{PfsError, Result};
pub use pfs_ondisk::{FileType, InodeKind};

use pfs_block::{ByteDevice, read_sector_aligned};
use pfs_dir::DirEntries;
use pfs_ondisk::{Extent, GroupDesc, Inode, Superblock};
use pfs_types::{
    BlockSize, ByteOffset, InodeNumber, SECTOR_SIZE, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
    ParseError, align_up, inode_index_in_group, inode_to_group,
};
use serde::Serialize;
use std::io;
use tracing::debug;

/// Read-only view of one ext4 image.
///
/// The byte source outlives the filesystem value and is only ever read.
pub struct Filesystem<D: ByteDevice> {
    dev: D,
    sb: Superblock,
    groups: Vec<GroupDesc>,
    cache: Box<dyn InodeCache>,
}

impl<D: ByteDevice> std::fmt::Debug for Filesystem<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("sb", &self.sb)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

impl<D: ByteDevice> Filesystem<D> {
    /// Construct a filesystem with no inode memoization.
    pub fn new(dev: D) -> Result<Self> {
        Self::with_cache(dev, Box::new(NoopInodeCache))
    }

    /// Construct a filesystem with a caller-supplied inode cache.
    pub fn with_cache(dev: D, cache: Box<dyn InodeCache>) -> Result<Self> {
        // Superblock: a sector-aligned read of the 1024 bytes at offset 1024.
        let region = read_sector_aligned(&dev, ByteOffset(SUPERBLOCK_OFFSET), SUPERBLOCK_SIZE)?;
        let sb = Superblock::parse_region(&region).map_err(|e| match e {
            ParseError::InvalidMagic { actual, .. } => PfsError::NotExt4 {
                actual: u16::try_from(actual).unwrap_or(0),
            },
            other => PfsError::superblock(&other),
        })?;

        let group_count = sb.group_count().map_err(|e| PfsError::superblock(&e))?;

        let groups = read_group_table(&dev, &sb, group_count)?;

        debug!(
            target: "pfs::fs",
            event = "mounted",
            block_size = sb.block_size.get(),
            groups = groups.len(),
            inodes = sb.inodes_count,
            volume = %sb.volume_name,
        );

        Ok(Self {
            dev,
            sb,
            groups,
            cache,
        })
    }

    /// The parsed superblock.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.sb.block_size
    }

    // ── Inode locator ───────────────────────────────────────────────────

    /// Read inode `ino` through sector-aligned I/O, consulting the cache.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Inode> {
        if ino.0 == 0 {
            return Err(PfsError::CorruptInode {
                ino: 0,
                detail: "inode 0 is never valid".to_owned(),
            });
        }
        if let Some(inode) = self.cache.get(ino) {
            return Ok(inode);
        }

        let group = inode_to_group(ino, self.sb.inodes_per_group);
        let index = inode_index_in_group(ino, self.sb.inodes_per_group);

        let desc = self
            .groups
            .get(group.0 as usize)
            .ok_or_else(|| PfsError::CorruptInode {
                ino: ino.0,
                detail: format!("block group {group} out of range"),
            })?;

        let table_block = desc.inode_table(self.sb.is_64bit());
        let byte_offset = table_block
            .to_byte_offset(self.sb.block_size)
            .and_then(|off| {
                off.checked_add(u64::from(index) * u64::from(self.sb.inode_size))
            })
            .ok_or_else(|| PfsError::CorruptInode {
                ino: ino.0,
                detail: "inode table offset overflows u64".to_owned(),
            })?;

        let raw = read_sector_aligned(&self.dev, byte_offset, usize::from(self.sb.inode_size))?;
        let inode = Inode::parse_from_bytes(&raw).map_err(|e| PfsError::inode(ino, &e))?;

        self.cache.add(ino, &inode);
        Ok(inode)
    }

    /// Resolve the full, ordered extent list of an inode.
    fn extents_of(&self, ino: InodeNumber, inode: &Inode) -> Result<Vec<Extent>> {
        pfs_extent::collect_extents(&self.dev, self.sb.block_size, ino, inode)
    }

    // ── Path resolution ─────────────────────────────────────────────────

    /// Walk `path` from the root directory (inode 2) to its final inode.
    fn resolve(&self, path: &str) -> Result<(InodeNumber, Inode)> {
        let segments = clean_path(path);

        let mut current_ino = InodeNumber::ROOT;
        let mut current = self.read_inode(current_ino)?;

        for segment in &segments {
            match current.kind {
                InodeKind::Directory => {}
                InodeKind::Symlink => {
                    return Err(PfsError::SymlinkUnsupported {
                        path: path.to_owned(),
                    });
                }
                _ => {
                    return Err(PfsError::NotADirectory {
                        path: path.to_owned(),
                    });
                }
            }

            let extents = self.extents_of(current_ino, &current)?;
            let mut found = None;
            for entry in DirEntries::new(&self.dev, self.sb.block_size, current_ino, extents) {
                let entry = entry?;
                if entry.name == segment.as_bytes() {
                    found = Some(entry.inode);
                    break;
                }
            }

            let child = found.ok_or_else(|| PfsError::NotFound {
                path: path.to_owned(),
            })?;

            current_ino = InodeNumber(child);
            current = self.read_inode(current_ino)?;
        }

        Ok((current_ino, current))
    }

    // ── Caller-facing operations ────────────────────────────────────────

    /// List a directory. `.` and `..` never appear; order is on-disk
    /// record order and stable for an immutable image.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry<'_, D>>> {
        let (ino, inode) = self.resolve(path)?;
        match inode.kind {
            InodeKind::Directory => {}
            InodeKind::Symlink => {
                return Err(PfsError::SymlinkUnsupported {
                    path: path.to_owned(),
                });
            }
            _ => {
                return Err(PfsError::NotADirectory {
                    path: path.to_owned(),
                });
            }
        }

        let extents = self.extents_of(ino, &inode)?;
        let records = pfs_dir::collect_entries(&self.dev, self.sb.block_size, ino, extents)?;

        Ok(records
            .into_iter()
            .map(|record| DirEntry {
                fs: self,
                name: record.name_str(),
                ino: InodeNumber(record.inode),
                file_type: record.file_type(),
            })
            .collect())
    }

    /// Stat a path. Works for any inode kind reachable without following
    /// a symlink.
    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let (ino, inode) = self.resolve(path)?;
        let name = clean_path(path)
            .into_iter()
            .next_back()
            .unwrap_or_else(|| "/".to_owned());
        Ok(FileInfo::new(name, ino, &inode))
    }

    /// Open a regular file for sequential reading.
    ///
    /// Directories and other non-file inodes fail with `NotARegularFile`;
    /// symlinks fail with `SymlinkUnsupported` (resolution is out of
    /// scope).
    pub fn open(&self, path: &str) -> Result<File<'_, D>> {
        let (ino, inode) = self.resolve(path)?;
        match inode.kind {
            InodeKind::Regular => {}
            InodeKind::Symlink => {
                return Err(PfsError::SymlinkUnsupported {
                    path: path.to_owned(),
                });
            }
            _ => {
                return Err(PfsError::NotARegularFile {
                    path: path.to_owned(),
                });
            }
        }

        let extents = self.extents_of(ino, &inode)?;

        debug!(
            target: "pfs::fs",
            event = "open",
            path,
            ino = ino.0,
            size = inode.size,
            extents = extents.len(),
        );

        Ok(File {
            fs: self,
            ino,
            extents,
            size: inode.size,
            pos: 0,
        })
    }
}

/// Read and decode the group descriptor table.
///
/// The table sits in the block after the superblock and is read as whole
/// 512-byte sectors covering `group_count * desc_size` bytes.
fn read_group_table<D: ByteDevice>(
    dev: &D,
    sb: &Superblock,
    group_count: u32,
) -> Result<Vec<GroupDesc>> {
    let desc_size = sb.group_desc_size();
    let table_bytes = u64::from(group_count) * u64::from(desc_size);
    let read_len = align_up(table_bytes, SECTOR_SIZE).ok_or_else(|| {
        PfsError::CorruptGroupTable {
            detail: "descriptor table size overflows u64".to_owned(),
        }
    })?;

    let offset = sb
        .gdt_start_block()
        .to_byte_offset(sb.block_size)
        .ok_or_else(|| PfsError::CorruptGroupTable {
            detail: "descriptor table offset overflows u64".to_owned(),
        })?;

    if offset.0 + read_len > dev.len_bytes() {
        return Err(PfsError::CorruptGroupTable {
            detail: format!(
                "image too small for {group_count} descriptors at offset {offset}"
            ),
        });
    }

    let read_len = usize::try_from(read_len).map_err(|_| PfsError::CorruptGroupTable {
        detail: "descriptor table too large".to_owned(),
    })?;
    let raw = read_sector_aligned(dev, offset, read_len)?;

    let mut groups = Vec::with_capacity(group_count as usize);
    for i in 0..group_count as usize {
        let start = i * usize::from(desc_size);
        let desc = GroupDesc::parse_from_bytes(&raw[start..], desc_size)
            .map_err(|e| PfsError::group_table(&e))?;
        groups.push(desc);
    }

    Ok(groups)
}

// ── Path cleaning ───────────────────────────────────────────────────────────

/// Lexically clean a path into its segments: separators collapse, `.`
/// disappears, `..` pops (never above the root).
#[must_use]
pub fn clean_path(path: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other.to_owned()),
        }
    }
    segments
}

// ── Directory entries & metadata ────────────────────────────────────────────

/// One directory listing entry: a name, a type hint from the on-disk
/// record, and lazy metadata resolution.
pub struct DirEntry<'fs, D: ByteDevice> {
    fs: &'fs Filesystem<D>,
    name: String,
    ino: InodeNumber,
    file_type: FileType,
}

impl<D: ByteDevice> std::fmt::Debug for DirEntry<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirEntry")
            .field("name", &self.name)
            .field("ino", &self.ino)
            .field("file_type", &self.file_type)
            .finish()
    }
}

impl<D: ByteDevice> DirEntry<'_, D> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// The `file_type` byte from the directory record. A hint only; the
    /// inode's mode is authoritative.
    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Resolve full metadata by reading this entry's inode.
    pub fn info(&self) -> Result<FileInfo> {
        let inode = self.fs.read_inode(self.ino)?;
        Ok(FileInfo::new(self.name.clone(), self.ino, &inode))
    }
}

/// File metadata as returned by `stat` and `DirEntry::info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub ino: u32,
    pub size: u64,
    pub mode: u16,
    pub mtime: u32,
    pub kind: InodeKind,
}

impl FileInfo {
    fn new(name: String, ino: InodeNumber, inode: &Inode) -> Self {
        Self {
            name,
            ino: ino.0,
            size: inode.size,
            mode: inode.mode,
            mtime: inode.mtime,
            kind: inode.kind,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.kind == InodeKind::Symlink
    }
}

// ── File reader ─────────────────────────────────────────────────────────────

/// Sequential reader over one regular file's bytes.
///
/// Delivers exactly the file's logical size: blocks not covered by any
/// extent read as zeros, and the final block is truncated to the size.
/// There is no seeking; re-open to restart.
pub struct File<'fs, D: ByteDevice> {
    fs: &'fs Filesystem<D>,
    ino: InodeNumber,
    extents: Vec<Extent>,
    size: u64,
    pos: u64,
}

impl<D: ByteDevice> std::fmt::Debug for File<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("ino", &self.ino)
            .field("extents", &self.extents)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}

impl<D: ByteDevice> File<'_, D> {
    /// Inode number this reader was opened from.
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Logical file size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes not yet delivered.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.size - self.pos
    }

    /// Read up to `buf.len()` bytes. Returns 0 only at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let bs = self.fs.sb.block_size.as_u64();
        let want = u64::try_from(buf.len()).unwrap_or(u64::MAX).min(self.remaining());
        let mut filled = 0_u64;

        while filled < want {
            let logical_block = self.pos / bs;
            let offset_in_block = self.pos % bs;
            let chunk = (bs - offset_in_block).min(want - filled);

            // usize conversions are safe: chunk <= block size <= 65536.
            let dst_start = filled as usize;
            let dst = &mut buf[dst_start..dst_start + chunk as usize];

            match self.covering_extent(logical_block) {
                Some(extent) => {
                    let block_delta = logical_block - u64::from(extent.logical_block);
                    let phys = extent
                        .physical_start
                        .checked_add(block_delta)
                        .and_then(|b| b.checked_mul(bs))
                        .and_then(|b| b.checked_add(offset_in_block))
                        .ok_or_else(|| PfsError::CorruptExtentTree {
                            ino: self.ino.0,
                            detail: "extent byte offset overflows u64".to_owned(),
                        })?;
                    self.fs.dev.read_exact_at(ByteOffset(phys), dst)?;
                }
                None => {
                    // Sparse gap: logical range with no extent reads as zeros.
                    dst.fill(0);
                }
            }

            filled += chunk;
            self.pos += chunk;
        }

        Ok(filled as usize)
    }

    /// Read the whole remaining stream into one buffer.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let remaining = usize::try_from(self.remaining()).map_err(|_| {
            PfsError::io(
                "read_all",
                io::Error::new(io::ErrorKind::InvalidInput, "file too large for memory"),
            )
        })?;
        let mut out = vec![0_u8; remaining];
        let mut done = 0;
        while done < out.len() {
            let n = self.read(&mut out[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        out.truncate(done);
        Ok(out)
    }

    /// First extent covering `logical_block`, if any. Extents are sorted
    /// and non-overlapping, so a binary search by start block suffices.
    fn covering_extent(&self, logical_block: u64) -> Option<&Extent> {
        let idx = self
            .extents
            .partition_point(|e| u64::from(e.logical_block) <= logical_block);
        let candidate = self.extents[..idx].last()?;
        (logical_block < candidate.logical_end()).then_some(candidate)
    }
}

impl<D: ByteDevice> io::Read for File<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        File::read(self, buf).map_err(io::Error::other)
    }
}
