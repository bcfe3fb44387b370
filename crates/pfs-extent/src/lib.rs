#![forbid(unsafe_code)]
//! Extent resolution: from an inode's 60-byte `i_block` region to the
//! complete, ordered list of leaf extents covering the file.
//!
//! Extent-mapped inodes get a recursive tree walk with a bounded depth.
//! Legacy inodes (EXTENTS flag clear) get their direct/indirect pointer
//! tables resolved and normalized into length-1 synthetic extents, so
//! everything downstream sees a single mapping shape.

use pfs_block::ByteDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{BlockPointers, Extent, ExtentNode, Inode, parse_extent_node};
use pfs_types::{BlockNumber, BlockSize, InodeNumber, ParseError};
use tracing::trace;

/// Maximum extent tree depth we will follow (the kernel's own limit).
/// Anything deeper is attacker-controlled recursion, not a filesystem.
const MAX_EXTENT_DEPTH: u16 = 5;

/// Collect all leaf extents of `inode`, sorted by logical block.
///
/// Works for both mapping schemes: extent trees are flattened
/// recursively, legacy pointer tables are enumerated into length-1
/// extents. Entries of length zero are treated as absent; overlapping
/// logical ranges fail with `CorruptExtentTree`.
pub fn collect_extents(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    ino: InodeNumber,
    inode: &Inode,
) -> Result<Vec<Extent>> {
    let mut extents = if inode.uses_extents() {
        let mut out = Vec::new();
        collect_tree_node(dev, block_size, ino, &inode.block, None, &mut out)?;
        out
    } else {
        collect_legacy(dev, block_size, ino, inode)?
    };

    extents.sort_by_key(|e| e.logical_block);

    for pair in extents.windows(2) {
        if pair[0].logical_end() > u64::from(pair[1].logical_block) {
            return Err(PfsError::CorruptExtentTree {
                ino: ino.0,
                detail: format!(
                    "extents overlap: [{}, {}) and [{}, {})",
                    pair[0].logical_block,
                    pair[0].logical_end(),
                    pair[1].logical_block,
                    pair[1].logical_end(),
                ),
            });
        }
    }

    trace!(
        target: "pfs::extent",
        event = "collect_extents",
        ino = ino.0,
        count = extents.len(),
    );

    Ok(extents)
}

/// Decode one tree node and recurse into its children.
///
/// `expected_depth` is `None` at the root (the root header sets the pace)
/// and pinned to `parent_depth - 1` below it; a child that disagrees with
/// its parent is corruption, not a different tree.
fn collect_tree_node(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    ino: InodeNumber,
    node_bytes: &[u8],
    expected_depth: Option<u16>,
    out: &mut Vec<Extent>,
) -> Result<()> {
    let (header, node) =
        parse_extent_node(node_bytes).map_err(|e| PfsError::extent_tree(ino, &e))?;

    if header.depth > MAX_EXTENT_DEPTH {
        return Err(PfsError::CorruptExtentTree {
            ino: ino.0,
            detail: format!(
                "depth {} exceeds maximum {MAX_EXTENT_DEPTH}",
                header.depth
            ),
        });
    }
    if let Some(expected) = expected_depth {
        if header.depth != expected {
            return Err(PfsError::CorruptExtentTree {
                ino: ino.0,
                detail: format!(
                    "child node depth {} does not match expected {expected}",
                    header.depth
                ),
            });
        }
    }

    match node {
        ExtentNode::Leaf(leaves) => {
            // Zero-length entries are treated as absent.
            out.extend(leaves.into_iter().filter(|e| e.actual_len() > 0));
        }
        ExtentNode::Index(indexes) => {
            let child_depth = header.depth - 1;
            for index in indexes {
                let child = read_block(dev, block_size, ino, index.child_block)?;
                collect_tree_node(dev, block_size, ino, &child, Some(child_depth), out)?;
            }
        }
    }

    Ok(())
}

/// Read one whole block. Index entries address children in blocks, so the
/// byte offset is `((leaf_hi << 32) | leaf_lo) * block_size`: the halves
/// combine *before* the block-size scaling.
fn read_block(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    ino: InodeNumber,
    block: BlockNumber,
) -> Result<Vec<u8>> {
    let offset = block
        .to_byte_offset(block_size)
        .ok_or_else(|| PfsError::extent_tree(
            ino,
            &ParseError::InvalidField {
                field: "child_block",
                reason: "byte offset overflows u64",
            },
        ))?;
    let mut buf = vec![0_u8; block_size.as_usize()];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

// ── Legacy block map ────────────────────────────────────────────────────────

/// Enumerate a legacy inode's block pointers into length-1 extents.
///
/// Direct pointers run until the first zero; each indirect level resolves
/// through a block of `B / 4` little-endian pointers, also terminated by
/// the first zero.
fn collect_legacy(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    ino: InodeNumber,
    inode: &Inode,
) -> Result<Vec<Extent>> {
    let ptrs =
        BlockPointers::parse(&inode.block).map_err(|e| PfsError::extent_tree(ino, &e))?;

    let mut physical = Vec::new();

    for &block in &ptrs.direct {
        if block == 0 {
            return Ok(to_synthetic_extents(&physical));
        }
        physical.push(u64::from(block));
    }

    if !append_indirect(dev, block_size, ino, ptrs.single_indirect, 1, &mut physical)? {
        return Ok(to_synthetic_extents(&physical));
    }
    if !append_indirect(dev, block_size, ino, ptrs.double_indirect, 2, &mut physical)? {
        return Ok(to_synthetic_extents(&physical));
    }
    append_indirect(dev, block_size, ino, ptrs.triple_indirect, 3, &mut physical)?;

    Ok(to_synthetic_extents(&physical))
}

/// Resolve one indirect pointer of the given `level` (1 = the block holds
/// data pointers, 2/3 = it holds pointers to lower indirect blocks).
///
/// Returns `false` once a zero pointer terminated enumeration.
fn append_indirect(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    ino: InodeNumber,
    pointer: u32,
    level: u8,
    physical: &mut Vec<u64>,
) -> Result<bool> {
    if pointer == 0 {
        return Ok(false);
    }

    let block = read_block(dev, block_size, ino, BlockNumber(u64::from(pointer)))?;
    let entries = block_size.as_usize() / 4;

    for i in 0..entries {
        let next = u32::from_le_bytes([
            block[i * 4],
            block[i * 4 + 1],
            block[i * 4 + 2],
            block[i * 4 + 3],
        ]);
        if next == 0 {
            return Ok(false);
        }
        if level == 1 {
            physical.push(u64::from(next));
        } else if !append_indirect(dev, block_size, ino, next, level - 1, physical)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Wrap resolved physical blocks as length-1 extents with consecutive
/// logical numbering, giving the file reader a single code path.
fn to_synthetic_extents(physical: &[u64]) -> Vec<Extent> {
    physical
        .iter()
        .enumerate()
        .map(|(logical, &block)| Extent {
            logical_block: u32::try_from(logical).unwrap_or(u32::MAX),
            raw_len: 1,
            physical_start: block,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::MemoryByteDevice;
    use pfs_ondisk::EXTENT_MAGIC;
    use pfs_types::ByteOffset;
    use std::collections::BTreeMap;

    const BS: u32 = 1024;

    fn bs() -> BlockSize {
        BlockSize::new(BS).unwrap()
    }

    /// Device serving explicit byte segments from a huge virtual image;
    /// everything else reads as zeros. Lets tests address blocks above
    /// 4 GiB without allocating them.
    struct SparseByteDevice {
        len: u64,
        segments: BTreeMap<u64, Vec<u8>>,
    }

    impl SparseByteDevice {
        fn new(len: u64) -> Self {
            Self {
                len,
                segments: BTreeMap::new(),
            }
        }

        fn put(&mut self, offset: u64, bytes: Vec<u8>) {
            self.segments.insert(offset, bytes);
        }
    }

    impl ByteDevice for SparseByteDevice {
        fn len_bytes(&self) -> u64 {
            self.len
        }

        fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
            if offset.0 >= self.len {
                return Ok(0);
            }
            let n = usize::try_from((self.len - offset.0).min(buf.len() as u64)).unwrap();
            buf[..n].fill(0);
            for (&seg_start, seg) in &self.segments {
                let seg_end = seg_start + seg.len() as u64;
                let read_end = offset.0 + n as u64;
                if seg_end <= offset.0 || seg_start >= read_end {
                    continue;
                }
                let copy_start = seg_start.max(offset.0);
                let copy_end = seg_end.min(read_end);
                let dst = usize::try_from(copy_start - offset.0).unwrap();
                let src = usize::try_from(copy_start - seg_start).unwrap();
                let len = usize::try_from(copy_end - copy_start).unwrap();
                buf[dst..dst + len].copy_from_slice(&seg[src..src + len]);
            }
            Ok(n)
        }
    }

    fn put_header(buf: &mut [u8], entries: u16, max: u16, depth: u16) {
        buf[0..2].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        buf[2..4].copy_from_slice(&entries.to_le_bytes());
        buf[4..6].copy_from_slice(&max.to_le_bytes());
        buf[6..8].copy_from_slice(&depth.to_le_bytes());
    }

    fn put_leaf(buf: &mut [u8], at: usize, logical: u32, len: u16, phys: u64) {
        buf[at..at + 4].copy_from_slice(&logical.to_le_bytes());
        buf[at + 4..at + 6].copy_from_slice(&len.to_le_bytes());
        buf[at + 6..at + 8].copy_from_slice(&(((phys >> 32) & 0xFFFF) as u16).to_le_bytes());
        buf[at + 8..at + 12].copy_from_slice(&((phys & 0xFFFF_FFFF) as u32).to_le_bytes());
    }

    fn put_index(buf: &mut [u8], at: usize, logical: u32, child: u64) {
        buf[at..at + 4].copy_from_slice(&logical.to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&((child & 0xFFFF_FFFF) as u32).to_le_bytes());
        buf[at + 8..at + 10].copy_from_slice(&(((child >> 32) & 0xFFFF) as u16).to_le_bytes());
    }

    fn extent_inode(block: [u8; 60]) -> Inode {
        let mut raw = [0_u8; 128];
        raw[0x00..0x02].copy_from_slice(&0o100_644_u16.to_le_bytes());
        raw[0x20..0x24].copy_from_slice(&pfs_types::EXT4_EXTENTS_FL.to_le_bytes());
        raw[0x28..0x28 + 60].copy_from_slice(&block);
        Inode::parse_from_bytes(&raw).unwrap()
    }

    fn legacy_inode(block: [u8; 60]) -> Inode {
        let mut raw = [0_u8; 128];
        raw[0x00..0x02].copy_from_slice(&0o100_644_u16.to_le_bytes());
        raw[0x28..0x28 + 60].copy_from_slice(&block);
        Inode::parse_from_bytes(&raw).unwrap()
    }

    #[test]
    fn depth0_extents_sorted_by_logical() {
        let mut root = [0_u8; 60];
        put_header(&mut root, 2, 4, 0);
        put_leaf(&mut root, 12, 10, 2, 500); // out of order on purpose
        put_leaf(&mut root, 24, 0, 4, 300);

        let dev = MemoryByteDevice::new(vec![0_u8; 4096]);
        let extents =
            collect_extents(&dev, bs(), InodeNumber(12), &extent_inode(root)).unwrap();
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0].logical_block, 0);
        assert_eq!(extents[0].physical_start, 300);
        assert_eq!(extents[1].logical_block, 10);
    }

    #[test]
    fn zero_length_entries_are_absent() {
        let mut root = [0_u8; 60];
        put_header(&mut root, 2, 4, 0);
        put_leaf(&mut root, 12, 0, 0, 300); // length 0: dropped
        put_leaf(&mut root, 24, 4, 1, 400);

        let dev = MemoryByteDevice::new(vec![0_u8; 4096]);
        let extents =
            collect_extents(&dev, bs(), InodeNumber(12), &extent_inode(root)).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].logical_block, 4);
    }

    #[test]
    fn depth1_tree_with_high_child_address() {
        // Index entry whose child block needs the high 16 bits: block
        // 2^32 + 3, i.e. byte offset (2^32 + 3) * 1024. A plain
        // `hi << 32 + lo * block_size` computation would read the wrong
        // place entirely.
        let child_block_nr = (1_u64 << 32) + 3;
        let mut root = [0_u8; 60];
        put_header(&mut root, 1, 4, 1);
        put_index(&mut root, 12, 0, child_block_nr);

        let mut child = vec![0_u8; BS as usize];
        put_header(&mut child, 1, 84, 0);
        put_leaf(&mut child, 12, 0, 6, 2048);

        let mut dev = SparseByteDevice::new((child_block_nr + 8) * u64::from(BS));
        dev.put(child_block_nr * u64::from(BS), child);

        let extents =
            collect_extents(&dev, bs(), InodeNumber(12), &extent_inode(root)).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].logical_block, 0);
        assert_eq!(extents[0].actual_len(), 6);
        assert_eq!(extents[0].physical_start, 2048);
    }

    #[test]
    fn depth2_tree_flattens_to_same_leaves_as_depth0() {
        // depth-2 root -> depth-1 node at block 10 -> leaf node at block 11
        let mut root = [0_u8; 60];
        put_header(&mut root, 1, 4, 2);
        put_index(&mut root, 12, 0, 10);

        let mut mid = vec![0_u8; BS as usize];
        put_header(&mut mid, 1, 84, 1);
        put_index(&mut mid, 12, 0, 11);

        let mut leaf = vec![0_u8; BS as usize];
        put_header(&mut leaf, 2, 84, 0);
        put_leaf(&mut leaf, 12, 0, 3, 100);
        put_leaf(&mut leaf, 24, 3, 2, 200);

        let mut image = vec![0_u8; 16 * BS as usize];
        image[10 * BS as usize..11 * BS as usize].copy_from_slice(&mid);
        image[11 * BS as usize..12 * BS as usize].copy_from_slice(&leaf);
        let dev = MemoryByteDevice::new(image);

        let deep = collect_extents(&dev, bs(), InodeNumber(12), &extent_inode(root)).unwrap();

        let mut flat_root = [0_u8; 60];
        put_header(&mut flat_root, 2, 4, 0);
        put_leaf(&mut flat_root, 12, 0, 3, 100);
        put_leaf(&mut flat_root, 24, 3, 2, 200);
        let flat =
            collect_extents(&dev, bs(), InodeNumber(12), &extent_inode(flat_root)).unwrap();

        assert_eq!(deep, flat);
    }

    #[test]
    fn excessive_depth_is_corruption() {
        let mut root = [0_u8; 60];
        put_header(&mut root, 0, 4, MAX_EXTENT_DEPTH + 1);

        let dev = MemoryByteDevice::new(vec![0_u8; 4096]);
        let err = collect_extents(&dev, bs(), InodeNumber(7), &extent_inode(root)).unwrap_err();
        assert!(matches!(err, PfsError::CorruptExtentTree { ino: 7, .. }));
    }

    #[test]
    fn child_depth_mismatch_is_corruption() {
        // Root claims depth 2, child claims depth 0 (should be 1).
        let mut root = [0_u8; 60];
        put_header(&mut root, 1, 4, 2);
        put_index(&mut root, 12, 0, 10);

        let mut child = vec![0_u8; BS as usize];
        put_header(&mut child, 0, 84, 0);

        let mut image = vec![0_u8; 16 * BS as usize];
        image[10 * BS as usize..11 * BS as usize].copy_from_slice(&child);
        let dev = MemoryByteDevice::new(image);

        let err = collect_extents(&dev, bs(), InodeNumber(9), &extent_inode(root)).unwrap_err();
        assert!(matches!(err, PfsError::CorruptExtentTree { .. }));
    }

    #[test]
    fn overlapping_extents_are_corruption() {
        let mut root = [0_u8; 60];
        put_header(&mut root, 2, 4, 0);
        put_leaf(&mut root, 12, 0, 4, 300);
        put_leaf(&mut root, 24, 2, 4, 600); // overlaps [0, 4)

        let dev = MemoryByteDevice::new(vec![0_u8; 4096]);
        let err = collect_extents(&dev, bs(), InodeNumber(3), &extent_inode(root)).unwrap_err();
        assert!(matches!(err, PfsError::CorruptExtentTree { ino: 3, .. }));
    }

    #[test]
    fn legacy_direct_blocks_stop_at_zero() {
        let mut region = [0_u8; 60];
        region[0..4].copy_from_slice(&50_u32.to_le_bytes());
        region[4..8].copy_from_slice(&51_u32.to_le_bytes());
        region[8..12].copy_from_slice(&52_u32.to_le_bytes());
        // direct[3] == 0 terminates; later pointers must be ignored
        region[16..20].copy_from_slice(&99_u32.to_le_bytes());

        let dev = MemoryByteDevice::new(vec![0_u8; 4096]);
        let extents =
            collect_extents(&dev, bs(), InodeNumber(5), &legacy_inode(region)).unwrap();
        assert_eq!(extents.len(), 3);
        assert_eq!(
            extents
                .iter()
                .map(|e| (e.logical_block, e.physical_start, e.actual_len()))
                .collect::<Vec<_>>(),
            vec![(0, 50, 1), (1, 51, 1), (2, 52, 1)]
        );
    }

    #[test]
    fn legacy_single_indirect_resolves() {
        let mut region = [0_u8; 60];
        for i in 0_u32..12 {
            region[(i as usize) * 4..(i as usize) * 4 + 4]
                .copy_from_slice(&(20 + i).to_le_bytes());
        }
        region[48..52].copy_from_slice(&40_u32.to_le_bytes()); // single indirect

        // Block 40 holds two data pointers then a zero.
        let mut image = vec![0_u8; 64 * BS as usize];
        let ind = 40 * BS as usize;
        image[ind..ind + 4].copy_from_slice(&100_u32.to_le_bytes());
        image[ind + 4..ind + 8].copy_from_slice(&101_u32.to_le_bytes());

        let dev = MemoryByteDevice::new(image);
        let extents =
            collect_extents(&dev, bs(), InodeNumber(5), &legacy_inode(region)).unwrap();
        assert_eq!(extents.len(), 14);
        assert_eq!(extents[11].physical_start, 31);
        assert_eq!(extents[12].physical_start, 100);
        assert_eq!(extents[13].physical_start, 101);
        assert_eq!(extents[13].logical_block, 13);
    }

    #[test]
    fn legacy_double_indirect_resolves() {
        let mut region = [0_u8; 60];
        for i in 0_u32..12 {
            region[(i as usize) * 4..(i as usize) * 4 + 4]
                .copy_from_slice(&(20 + i).to_le_bytes());
        }
        region[48..52].copy_from_slice(&40_u32.to_le_bytes()); // single
        region[52..56].copy_from_slice(&41_u32.to_le_bytes()); // double

        let entries = BS as usize / 4;
        let mut image = vec![0_u8; 128 * BS as usize];
        // Single-indirect block 40: completely full of pointers 100..100+entries
        let ind = 40 * BS as usize;
        for i in 0..entries {
            image[ind + i * 4..ind + i * 4 + 4]
                .copy_from_slice(&(100 + i as u32).to_le_bytes());
        }
        // Double-indirect block 41 -> indirect block 42 -> one pointer, then zero
        let dind = 41 * BS as usize;
        image[dind..dind + 4].copy_from_slice(&42_u32.to_le_bytes());
        let ind2 = 42 * BS as usize;
        image[ind2..ind2 + 4].copy_from_slice(&900_u32.to_le_bytes());

        let dev = MemoryByteDevice::new(image);
        let extents =
            collect_extents(&dev, bs(), InodeNumber(5), &legacy_inode(region)).unwrap();
        assert_eq!(extents.len(), 12 + entries + 1);
        assert_eq!(extents.last().unwrap().physical_start, 900);
    }
}
