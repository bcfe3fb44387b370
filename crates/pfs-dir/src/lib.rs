#![forbid(unsafe_code)]
//! Directory entry iteration.
//!
//! A pull-based sequence over the variable-length records packed into a
//! directory inode's data blocks. One entry is yielded at a time, so a
//! name lookup in a large directory short-circuits without materializing
//! the whole listing.

use pfs_block::ByteDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{DirEntryRecord, Extent};
use pfs_types::{BlockSize, InodeNumber};

/// Iterator over a directory's entries, in on-disk record order.
///
/// `.` and `..` are filtered, gap records (`inode == 0`) are skipped, and
/// the `0xDE` checksum tail terminates the extent it appears in. Any
/// malformed record fails the stream with `CorruptDirectory`; iteration
/// does not resume past corruption.
pub struct DirEntries<'a> {
    dev: &'a dyn ByteDevice,
    block_size: BlockSize,
    ino: InodeNumber,
    extents: std::vec::IntoIter<Extent>,
    buf: Vec<u8>,
    pos: usize,
    failed: bool,
}

impl<'a> DirEntries<'a> {
    /// Iterate the records stored in `extents` (a directory inode's
    /// resolved data extents, in logical order).
    #[must_use]
    pub fn new(
        dev: &'a dyn ByteDevice,
        block_size: BlockSize,
        ino: InodeNumber,
        extents: Vec<Extent>,
    ) -> Self {
        Self {
            dev,
            block_size,
            ino,
            extents: extents.into_iter(),
            buf: Vec::new(),
            pos: 0,
            failed: false,
        }
    }

    /// Load the next extent's bytes: exactly `length * B` bytes starting
    /// at `physical_start * B`. Returns `Ok(false)` when no extents remain.
    fn load_next_extent(&mut self) -> Result<bool> {
        let Some(extent) = self.extents.next() else {
            return Ok(false);
        };

        let len = u64::from(extent.actual_len()) * self.block_size.as_u64();
        let offset = extent
            .physical_start
            .checked_mul(self.block_size.as_u64())
            .ok_or_else(|| self.corrupt("extent byte offset overflows u64"))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| self.corrupt("extent end overflows u64"))?;
        if end > self.dev.len_bytes() {
            return Err(self.corrupt("extent extends past end of image"));
        }

        let len = usize::try_from(len).map_err(|_| self.corrupt("extent too large"))?;
        let mut buf = vec![0_u8; len];
        self.dev
            .read_exact_at(pfs_types::ByteOffset(offset), &mut buf)?;
        self.buf = buf;
        self.pos = 0;
        Ok(true)
    }

    fn corrupt(&self, detail: &str) -> PfsError {
        PfsError::CorruptDirectory {
            ino: self.ino.0,
            detail: detail.to_owned(),
        }
    }

    fn next_entry(&mut self) -> Result<Option<DirEntryRecord>> {
        loop {
            // Need at least a record header in the current extent buffer.
            if self.pos + 8 > self.buf.len() {
                if !self.load_next_extent()? {
                    return Ok(None);
                }
                continue;
            }

            let record = DirEntryRecord::parse(&self.buf[self.pos..])
                .map_err(|e| PfsError::directory(self.ino, &e))?;

            if record.is_checksum_sentinel() {
                // Tail sentinel: nothing further in this extent.
                self.pos = self.buf.len();
                continue;
            }

            // rec_len >= 8 was validated by parse, so this always advances.
            self.pos += usize::from(record.rec_len);

            if record.inode == 0 {
                continue; // gap left by a record merge
            }
            if record.is_dot_or_dotdot() {
                continue;
            }

            return Ok(Some(record));
        }
    }
}

impl Iterator for DirEntries<'_> {
    type Item = Result<DirEntryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Materialize a full listing. Fails as a whole if any record is corrupt:
/// there is no partial success.
pub fn collect_entries(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    ino: InodeNumber,
    extents: Vec<Extent>,
) -> Result<Vec<DirEntryRecord>> {
    DirEntries::new(dev, block_size, ino, extents).collect()
}
