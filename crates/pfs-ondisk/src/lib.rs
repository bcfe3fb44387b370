#![forbid(unsafe_code)]
//! ext4 on-disk record decoding.
//!
//! Fixed-layout little-endian records, decoded field by field at the
//! offsets documented in the kernel wiki's disk-layout reference:
//! superblock, group descriptor, inode, extent tree nodes, and directory
//! entries. Decoding is structural only; no checksum is verified beyond
//! the superblock magic.

use pfs_types::{
    BlockNumber, BlockSize, EXT4_EXTENTS_FL, EXT4_INDEX_FL, EXT4_SUPER_MAGIC, ParseError,
    S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, SUPERBLOCK_SIZE, ensure_slice, read_fixed, read_le_u16,
    read_le_u32, read_u8, trim_nul_padded,
};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Extent tree node magic (`eh_magic`).
pub const EXTENT_MAGIC: u16 = 0xF30A;

/// `ee_len` values above this mark an unwritten (preallocated) extent.
const EXT_INIT_MAX_LEN: u16 = 1_u16 << 15;

// ── Superblock feature flags (incompat subset this reader cares about) ──────

/// Inodes may use extent trees.
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
/// Group descriptors are 64 bytes; high halves of block addresses are live.
pub const INCOMPAT_64BIT: u32 = 0x0080;
/// Block-group metadata may be clustered into flex groups.
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed ext4 superblock (1024 bytes at image offset 1024).
///
/// Unknown or incompatible feature flags never fail the parse; only the
/// magic and the geometry actually used for traversal are validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub desc_size: u16,

    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    pub rev_level: u32,
    pub state: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub mtime: u32,
    pub wtime: u32,

    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
}

impl Superblock {
    /// Decode a superblock from its 1024-byte on-disk region.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT4_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT4_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let feature_incompat = read_le_u32(region, 0x60)?;
        let is_64bit = (feature_incompat & INCOMPAT_64BIT) != 0;

        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let blocks_hi = u64::from(read_le_u32(region, 0x150)?);
        let free_blocks_lo = u64::from(read_le_u32(region, 0x0C)?);
        let free_blocks_hi = u64::from(read_le_u32(region, 0x158)?);

        // High halves are only meaningful under INCOMPAT_64BIT.
        let (blocks_count, free_blocks_count) = if is_64bit {
            (
                blocks_lo | (blocks_hi << 32),
                free_blocks_lo | (free_blocks_hi << 32),
            )
        } else {
            (blocks_lo, free_blocks_lo)
        };

        let block_size = BlockSize::from_log(read_le_u32(region, 0x18)?)?;

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count,
            free_blocks_count,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size: read_le_u16(region, 0x58)?,
            first_ino: read_le_u32(region, 0x54)?,
            desc_size: read_le_u16(region, 0xFE)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            rev_level: read_le_u32(region, 0x4C)?,
            state: read_le_u16(region, 0x3A)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,

            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat,
            feature_ro_compat: read_le_u32(region, 0x64)?,
        })
    }

    #[must_use]
    pub fn has_incompat(&self, mask: u32) -> bool {
        (self.feature_incompat & mask) != 0
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.has_incompat(INCOMPAT_64BIT)
    }

    /// Group descriptor record width: 32 bytes, or 64 under INCOMPAT_64BIT.
    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.desc_size.max(64)
        } else {
            32
        }
    }

    /// Number of block groups.
    ///
    /// The block axis and the inode axis must agree:
    /// `ceil(blocks / blocks_per_group) == ceil(inodes / inodes_per_group)`.
    /// Disagreement (or a zero divisor) means the superblock is lying about
    /// its own geometry.
    pub fn group_count(&self) -> Result<u32, ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inode_size < 128 {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be >= 128",
            });
        }

        let by_blocks = self
            .blocks_count
            .div_ceil(u64::from(self.blocks_per_group));
        let by_inodes =
            u64::from(self.inodes_count).div_ceil(u64::from(self.inodes_per_group));

        if by_blocks != by_inodes {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "block-group and inode-group counts disagree",
            });
        }

        u32::try_from(by_blocks).map_err(|_| ParseError::IntegerConversion {
            field: "group_count",
        })
    }

    /// First block of the group descriptor table: the block after the
    /// superblock. With 1 KiB blocks the superblock itself occupies block 1,
    /// so the table starts at block 2; with larger blocks it starts at
    /// block 1.
    #[must_use]
    pub fn gdt_start_block(&self) -> BlockNumber {
        if self.block_size.get() == 1024 {
            BlockNumber(2)
        } else {
            BlockNumber(1)
        }
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// Parsed block group descriptor (32 or 64 bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap_lo: u32,
    pub inode_bitmap_lo: u32,
    pub inode_table_lo: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
    pub flags: u16,
    pub block_bitmap_hi: u32,
    pub inode_bitmap_hi: u32,
    pub inode_table_hi: u32,
}

impl GroupDesc {
    /// Decode one descriptor from `bytes` (at least `desc_size` long).
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let desc_size = usize::from(desc_size);
        if desc_size < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        if bytes.len() < desc_size {
            return Err(ParseError::InsufficientData {
                needed: desc_size,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let (block_bitmap_hi, inode_bitmap_hi, inode_table_hi) = if desc_size >= 64 {
            (
                read_le_u32(bytes, 0x20)?,
                read_le_u32(bytes, 0x24)?,
                read_le_u32(bytes, 0x28)?,
            )
        } else {
            (0, 0, 0)
        };

        Ok(Self {
            block_bitmap_lo: read_le_u32(bytes, 0x00)?,
            inode_bitmap_lo: read_le_u32(bytes, 0x04)?,
            inode_table_lo: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
            flags: read_le_u16(bytes, 0x12)?,
            block_bitmap_hi,
            inode_bitmap_hi,
            inode_table_hi,
        })
    }

    /// Physical block of this group's inode table.
    ///
    /// The high half only participates when the filesystem is 64-bit.
    #[must_use]
    pub fn inode_table(&self, is_64bit: bool) -> BlockNumber {
        let lo = u64::from(self.inode_table_lo);
        if is_64bit {
            BlockNumber(lo | (u64::from(self.inode_table_hi) << 32))
        } else {
            BlockNumber(lo)
        }
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// File kind derived from the mode's high nibble at parse time, so call
/// sites branch on a variant instead of re-testing mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl InodeKind {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFREG => Self::Regular,
            S_IFLNK => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// Parsed inode record.
///
/// The 60-byte `block` region is carried verbatim; whether it holds an
/// extent tree root or a legacy pointer table is decided by `uses_extents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u16,
    pub kind: InodeKind,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    pub blocks_lo: u32,
    pub flags: u32,
    pub generation: u32,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    /// `i_block[0..15]`: extent tree root or legacy block pointers.
    #[serde(with = "BigArray")]
    pub block: [u8; 60],
}

impl Inode {
    /// Decode an inode from at least 128 bytes of its table slot.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mode = read_le_u16(bytes, 0x00)?;

        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        // OSD2 high halves (Linux layout) live at the tail of the base record.
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size_hi = u64::from(read_le_u32(bytes, 0x6C)?);

        Ok(Self {
            mode,
            kind: InodeKind::from_mode(mode),
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size: size_lo | (size_hi << 32),
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks_lo: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,

            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,

            block: read_fixed::<60>(bytes, 0x28)?,
        })
    }

    /// Whether the `i_block` region roots an extent tree.
    #[must_use]
    pub fn uses_extents(&self) -> bool {
        (self.flags & EXT4_EXTENTS_FL) != 0
    }

    /// Whether this directory carries an htree index. Indexed directories
    /// are still read by linear scan; the flag is informational here.
    #[must_use]
    pub fn is_htree_dir(&self) -> bool {
        self.kind == InodeKind::Directory && (self.flags & EXT4_INDEX_FL) != 0
    }
}

// ── Extent tree records ─────────────────────────────────────────────────────

/// Extent tree node header (`ext4_extent_header`, 12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
    pub generation: u32,
}

/// Leaf extent: a run of logical file blocks mapped to physical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub logical_block: u32,
    pub raw_len: u16,
    pub physical_start: u64,
}

impl Extent {
    #[must_use]
    pub fn is_unwritten(self) -> bool {
        self.raw_len > EXT_INIT_MAX_LEN
    }

    /// Length in blocks, with the unwritten bit masked off.
    #[must_use]
    pub fn actual_len(self) -> u16 {
        if self.raw_len <= EXT_INIT_MAX_LEN {
            self.raw_len
        } else {
            self.raw_len - EXT_INIT_MAX_LEN
        }
    }

    /// One past the last logical block this extent covers.
    #[must_use]
    pub fn logical_end(self) -> u64 {
        u64::from(self.logical_block) + u64::from(self.actual_len())
    }
}

/// Internal extent tree entry pointing at a child node block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIndex {
    pub logical_block: u32,
    pub child_block: BlockNumber,
}

/// One decoded extent tree node: either all leaves or all index entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentNode {
    Leaf(Vec<Extent>),
    Index(Vec<ExtentIndex>),
}

/// Decode one extent tree node from the front of `bytes`.
///
/// `bytes` is the inode's 60-byte `i_block` region at the root, or a whole
/// tree block below it.
pub fn parse_extent_node(bytes: &[u8]) -> Result<(ExtentHeader, ExtentNode), ParseError> {
    if bytes.len() < 12 {
        return Err(ParseError::InsufficientData {
            needed: 12,
            offset: 0,
            actual: bytes.len(),
        });
    }

    let header = ExtentHeader {
        magic: read_le_u16(bytes, 0x00)?,
        entries: read_le_u16(bytes, 0x02)?,
        max_entries: read_le_u16(bytes, 0x04)?,
        depth: read_le_u16(bytes, 0x06)?,
        generation: read_le_u32(bytes, 0x08)?,
    };

    if header.magic != EXTENT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(EXTENT_MAGIC),
            actual: u64::from(header.magic),
        });
    }

    if header.entries > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }

    let entries_len = usize::from(header.entries);
    let needed = 12_usize
        .checked_add(entries_len.saturating_mul(12))
        .ok_or(ParseError::InvalidField {
            field: "eh_entries",
            reason: "overflow",
        })?;
    if bytes.len() < needed {
        return Err(ParseError::InsufficientData {
            needed,
            offset: 12,
            actual: bytes.len().saturating_sub(12),
        });
    }

    if header.depth == 0 {
        let mut extents = Vec::with_capacity(entries_len);
        for idx in 0..entries_len {
            let base = 12 + idx * 12;
            let logical_block = read_le_u32(bytes, base)?;
            let raw_len = read_le_u16(bytes, base + 4)?;
            let start_hi = u64::from(read_le_u16(bytes, base + 6)?);
            let start_lo = u64::from(read_le_u32(bytes, base + 8)?);
            extents.push(Extent {
                logical_block,
                raw_len,
                physical_start: start_lo | (start_hi << 32),
            });
        }
        Ok((header, ExtentNode::Leaf(extents)))
    } else {
        let mut indexes = Vec::with_capacity(entries_len);
        for idx in 0..entries_len {
            let base = 12 + idx * 12;
            let logical_block = read_le_u32(bytes, base)?;
            let leaf_lo = u64::from(read_le_u32(bytes, base + 4)?);
            let leaf_hi = u64::from(read_le_u16(bytes, base + 8)?);
            indexes.push(ExtentIndex {
                logical_block,
                child_block: BlockNumber(leaf_lo | (leaf_hi << 32)),
            });
        }
        Ok((header, ExtentNode::Index(indexes)))
    }
}

// ── Legacy block pointer table ──────────────────────────────────────────────

/// The pre-extents interpretation of `i_block`: 12 direct pointers, then
/// one single-, one double-, and one triple-indirect pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPointers {
    pub direct: [u32; 12],
    pub single_indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
}

impl BlockPointers {
    /// Reinterpret the inode's 60-byte `i_block` region as a pointer table.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < 60 {
            return Err(ParseError::InsufficientData {
                needed: 60,
                offset: 0,
                actual: region.len(),
            });
        }
        let mut direct = [0_u32; 12];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = read_le_u32(region, i * 4)?;
        }
        Ok(Self {
            direct,
            single_indirect: read_le_u32(region, 48)?,
            double_indirect: read_le_u32(region, 52)?,
            triple_indirect: read_le_u32(region, 56)?,
        })
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// Directory entry `file_type` byte, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// `file_type` value of the checksum tail entry terminating a directory
/// block ("reserved_ft").
pub const DIRENT_CHECKSUM_SENTINEL: u8 = 0xDE;

/// One raw directory record (`ext4_dir_entry_2`) decoded from a data block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryRecord {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type_raw: u8,
    pub name: Vec<u8>,
}

impl DirEntryRecord {
    /// Decode the record at the front of `bytes`.
    ///
    /// `rec_len` is validated against the 8-byte header, the name it claims
    /// to hold, and the bytes actually available; the name is raw bytes
    /// with no encoding validation.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let inode = read_le_u32(bytes, 0)?;
        let rec_len = read_le_u16(bytes, 4)?;
        let name_len = read_u8(bytes, 6)?;
        let file_type_raw = read_u8(bytes, 7)?;

        if usize::from(rec_len) < 8 + usize::from(name_len) {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "record shorter than header plus name",
            });
        }
        if usize::from(rec_len) > bytes.len() {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "record extends past available data",
            });
        }

        let name = ensure_slice(bytes, 8, usize::from(name_len))?.to_vec();

        Ok(Self {
            inode,
            rec_len,
            name_len,
            file_type_raw,
            name,
        })
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_raw(self.file_type_raw)
    }

    /// Whether this record is the checksum tail sentinel.
    #[must_use]
    pub fn is_checksum_sentinel(&self) -> bool {
        self.file_type_raw == DIRENT_CHECKSUM_SENTINEL
    }

    /// Whether the name is exactly `.` or `..`.
    #[must_use]
    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}
