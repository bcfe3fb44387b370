//! Crafted-image builder for facade tests.
//!
//! Builds minimal but structurally honest ext4 images in memory: one block
//! group, a real superblock and group descriptor table, an inode table,
//! extent-mapped files and directories. Directories are written
//! bottom-up, so children exist before the parent's data block is laid
//! down.

use pfs_types::EXT4_EXTENTS_FL;

pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;
pub const EXTENT_MAGIC: u16 = 0xF30A;
pub const ROOT_INO: u32 = 2;

pub struct ImageBuilder {
    bs: u32,
    image: Vec<u8>,
    inode_table_block: u64,
    inode_size: u16,
    inodes_count: u32,
    next_data_block: u64,
    next_ino: u32,
}

impl ImageBuilder {
    /// One-group image. `total_blocks * bs` bytes, inode table at block 8.
    pub fn new(bs: u32, total_blocks: u64) -> Self {
        let inodes_count = 128_u32;
        let inode_size = 256_u16;
        let inode_table_block = 8_u64;
        let table_blocks = (u64::from(inodes_count) * u64::from(inode_size)).div_ceil(u64::from(bs));

        let mut builder = Self {
            bs,
            image: vec![0_u8; usize::try_from(total_blocks * u64::from(bs)).unwrap()],
            inode_table_block,
            inode_size,
            inodes_count,
            next_data_block: inode_table_block + table_blocks,
            next_ino: 11, // first non-reserved inode
        };
        builder.write_superblock(total_blocks);
        builder.write_group_desc();
        builder
    }

    fn write_superblock(&mut self, total_blocks: u64) {
        let first_data_block: u32 = if self.bs == 1024 { 1 } else { 0 };
        let log_block_size = self.bs.trailing_zeros() - 10;

        let sb = 1024_usize;
        let img = &mut self.image;
        img[sb..sb + 4].copy_from_slice(&self.inodes_count.to_le_bytes());
        img[sb + 0x04..sb + 0x08].copy_from_slice(&(total_blocks as u32).to_le_bytes());
        img[sb + 0x14..sb + 0x18].copy_from_slice(&first_data_block.to_le_bytes());
        img[sb + 0x18..sb + 0x1C].copy_from_slice(&log_block_size.to_le_bytes());
        // One group on both axes.
        img[sb + 0x20..sb + 0x24].copy_from_slice(&(total_blocks as u32).to_le_bytes());
        img[sb + 0x28..sb + 0x2C].copy_from_slice(&self.inodes_count.to_le_bytes());
        img[sb + 0x38..sb + 0x3A].copy_from_slice(&EXT4_SUPER_MAGIC.to_le_bytes());
        img[sb + 0x54..sb + 0x58].copy_from_slice(&11_u32.to_le_bytes());
        img[sb + 0x58..sb + 0x5A].copy_from_slice(&self.inode_size.to_le_bytes());
        img[sb + 0x60..sb + 0x64].copy_from_slice(&0x0040_u32.to_le_bytes()); // EXTENTS
        img[sb + 0x78..sb + 0x7C].copy_from_slice(b"peek");
    }

    fn write_group_desc(&mut self) {
        // The reader looks for the GDT in the block after the superblock.
        let gdt_block: u64 = if self.bs == 1024 { 2 } else { 1 };
        let at = usize::try_from(gdt_block * u64::from(self.bs)).unwrap();
        self.image[at + 0x08..at + 0x0C]
            .copy_from_slice(&u32::try_from(self.inode_table_block).unwrap().to_le_bytes());
    }

    pub fn alloc_data_block(&mut self) -> u64 {
        let block = self.next_data_block;
        self.next_data_block += 1;
        block
    }

    pub fn write_block(&mut self, block: u64, data: &[u8]) {
        assert!(data.len() <= self.bs as usize);
        let at = usize::try_from(block * u64::from(self.bs)).unwrap();
        self.image[at..at + data.len()].copy_from_slice(data);
    }

    /// Write inode `ino` directly into the table.
    pub fn set_inode(&mut self, ino: u32, mode: u16, size: u64, flags: u32, iblock: &[u8; 60]) {
        assert!(ino >= 1 && ino <= self.inodes_count);
        let at = usize::try_from(
            self.inode_table_block * u64::from(self.bs)
                + u64::from(ino - 1) * u64::from(self.inode_size),
        )
        .unwrap();
        let slot = &mut self.image[at..at + usize::from(self.inode_size)];
        slot.fill(0);
        slot[0x00..0x02].copy_from_slice(&mode.to_le_bytes());
        slot[0x04..0x08].copy_from_slice(&((size & 0xFFFF_FFFF) as u32).to_le_bytes());
        slot[0x6C..0x70].copy_from_slice(&((size >> 32) as u32).to_le_bytes());
        slot[0x10..0x14].copy_from_slice(&1_650_000_000_u32.to_le_bytes()); // mtime
        slot[0x1A..0x1C].copy_from_slice(&1_u16.to_le_bytes()); // links
        slot[0x20..0x24].copy_from_slice(&flags.to_le_bytes());
        slot[0x28..0x28 + 60].copy_from_slice(iblock);
    }

    pub fn next_ino(&mut self) -> u32 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Build an extent tree root (depth 0) from `(logical, len, physical)` runs.
    pub fn extent_root(extents: &[(u32, u16, u64)]) -> [u8; 60] {
        assert!(extents.len() <= 4, "a 60-byte root holds at most 4 leaves");
        let mut root = [0_u8; 60];
        root[0..2].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        root[2..4].copy_from_slice(&(extents.len() as u16).to_le_bytes());
        root[4..6].copy_from_slice(&4_u16.to_le_bytes());
        // depth 0, generation 0
        for (i, &(logical, len, phys)) in extents.iter().enumerate() {
            let at = 12 + i * 12;
            root[at..at + 4].copy_from_slice(&logical.to_le_bytes());
            root[at + 4..at + 6].copy_from_slice(&len.to_le_bytes());
            root[at + 6..at + 8].copy_from_slice(&(((phys >> 32) & 0xFFFF) as u16).to_le_bytes());
            root[at + 8..at + 12].copy_from_slice(&((phys & 0xFFFF_FFFF) as u32).to_le_bytes());
        }
        root
    }

    /// Regular file from contiguous content. Returns its inode number.
    pub fn add_file(&mut self, content: &[u8]) -> u32 {
        let ino = self.next_ino();
        self.set_file_at(ino, content);
        ino
    }

    fn set_file_at(&mut self, ino: u32, content: &[u8]) {
        let blocks_needed = content.len().div_ceil(self.bs as usize);
        let root = if blocks_needed == 0 {
            Self::extent_root(&[])
        } else {
            let first = self.alloc_data_block();
            for i in 1..blocks_needed {
                let b = self.alloc_data_block();
                assert_eq!(b, first + i as u64, "contiguous allocation expected");
            }
            for (i, chunk) in content.chunks(self.bs as usize).enumerate() {
                self.write_block(first + i as u64, chunk);
            }
            Self::extent_root(&[(0, blocks_needed as u16, first)])
        };
        self.set_inode(ino, 0o100_644, content.len() as u64, EXT4_EXTENTS_FL, &root);
    }

    /// Fast symlink: target bytes live in the inode's i_block region.
    pub fn add_symlink(&mut self, target: &[u8]) -> u32 {
        assert!(target.len() <= 60);
        let ino = self.next_ino();
        let mut iblock = [0_u8; 60];
        iblock[..target.len()].copy_from_slice(target);
        self.set_inode(ino, 0o120_777, target.len() as u64, 0, &iblock);
        ino
    }

    /// Directory with the given `(ino, name, file_type)` children.
    /// Returns its inode number; `set_root_dir` wires inode 2.
    pub fn add_dir(&mut self, parent_ino: u32, entries: &[(u32, &str, u8)]) -> u32 {
        let ino = self.next_ino();
        self.set_dir_at(ino, parent_ino, entries);
        ino
    }

    pub fn set_root_dir(&mut self, entries: &[(u32, &str, u8)]) {
        self.set_dir_at(ROOT_INO, ROOT_INO, entries);
    }

    fn set_dir_at(&mut self, ino: u32, parent_ino: u32, entries: &[(u32, &str, u8)]) {
        let block = self.alloc_data_block();
        let data = self.dir_block(ino, parent_ino, entries);
        self.write_block(block, &data);
        let root = Self::extent_root(&[(0, 1, block)]);
        self.set_inode(
            ino,
            0o040_755,
            u64::from(self.bs),
            EXT4_EXTENTS_FL,
            &root,
        );
    }

    /// One directory data block: `.`, `..`, the entries, with the last
    /// record's rec_len padded to the end of the block.
    fn dir_block(&self, self_ino: u32, parent_ino: u32, entries: &[(u32, &str, u8)]) -> Vec<u8> {
        let mut block = Vec::with_capacity(self.bs as usize);

        let mut records: Vec<(u32, Vec<u8>, u8)> = vec![
            (self_ino, b".".to_vec(), 2),
            (parent_ino, b"..".to_vec(), 2),
        ];
        records.extend(
            entries
                .iter()
                .map(|&(ino, name, ftype)| (ino, name.as_bytes().to_vec(), ftype)),
        );

        let last = records.len() - 1;
        for (i, (ino, name, ftype)) in records.iter().enumerate() {
            let rec_len = if i == last {
                self.bs as usize - block.len()
            } else {
                (8 + name.len() + 3) & !3
            };
            let start = block.len();
            block.resize(start + rec_len, 0);
            block[start..start + 4].copy_from_slice(&ino.to_le_bytes());
            block[start + 4..start + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
            block[start + 6] = name.len() as u8;
            block[start + 7] = *ftype;
            block[start + 8..start + 8 + name.len()].copy_from_slice(name);
        }

        assert_eq!(block.len(), self.bs as usize);
        block
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image
    }
}
