//! ext2 (revision 1) on-disk structures.
//!
//! Only the fields vimg writes or needs to read are modelled. Offsets follow
//! the classic `ext2_super_block`, `ext2_group_desc`, `ext2_inode` and
//! `ext2_dir_entry_2` layouts.

pub mod builder;
pub mod layout;
pub mod reader;

use crate::codec::{
    ensure_slice, le_u16, le_u32, put_le_u16, put_le_u32, read_fixed, trim_nul_padded,
};
use crate::error::{ImageError, Result};

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_MAGIC: u16 = 0xEF53;
pub const EXT2_DYNAMIC_REV: u32 = 1;

pub const ROOT_INO: u32 = 2;
pub const FIRST_INO: u32 = 11;
pub const RESERVED_INODES: u64 = 10;

pub const GROUP_DESC_SIZE: usize = 32;
pub const INODE_SIZE: usize = 128;

pub const N_DIRECT: usize = 12;
pub const IND_BLOCK: usize = 12;
pub const DIND_BLOCK: usize = 13;
pub const TIND_BLOCK: usize = 14;
pub const N_BLOCKS: usize = 15;

/// Bytes of block-pointer area a fast symlink can use.
pub const INLINE_DATA_LEN: usize = N_BLOCKS * 4;

pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;

/// Files at or above this size need `FEATURE_RO_COMPAT_LARGE_FILE`.
pub const LARGE_FILE_SIZE: u64 = 1 << 31;

pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

/// Does `group` carry a superblock and GDT copy under `SPARSE_SUPER`?
///
/// Groups 0 and 1 always do, others only when a power of 3, 5 or 7.
pub fn group_has_super(group: u64, sparse_super: bool) -> bool {
    if !sparse_super || group <= 1 {
        return true;
    }
    [3_u64, 5, 7].iter().any(|base| {
        let mut n = *base;
        while n < group {
            n *= base;
        }
        n == group
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
}

impl Superblock {
    pub fn block_size(&self) -> u64 {
        1024_u64 << self.log_block_size
    }

    pub fn group_count(&self) -> u64 {
        u64::from(self.blocks_count - self.first_data_block).div_ceil(u64::from(self.blocks_per_group))
    }

    pub fn inode_size(&self) -> u64 {
        if self.rev_level == 0 {
            INODE_SIZE as u64
        } else {
            u64::from(self.inode_size)
        }
    }

    pub fn sparse_super(&self) -> bool {
        self.feature_ro_compat & FEATURE_RO_COMPAT_SPARSE_SUPER != 0
    }

    pub fn large_file(&self) -> bool {
        self.feature_ro_compat & FEATURE_RO_COMPAT_LARGE_FILE != 0
    }

    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0_u8; SUPERBLOCK_SIZE];
        put_le_u32(&mut buf, 0, self.inodes_count);
        put_le_u32(&mut buf, 4, self.blocks_count);
        put_le_u32(&mut buf, 8, self.r_blocks_count);
        put_le_u32(&mut buf, 12, self.free_blocks_count);
        put_le_u32(&mut buf, 16, self.free_inodes_count);
        put_le_u32(&mut buf, 20, self.first_data_block);
        put_le_u32(&mut buf, 24, self.log_block_size);
        put_le_u32(&mut buf, 28, self.log_block_size);
        put_le_u32(&mut buf, 32, self.blocks_per_group);
        put_le_u32(&mut buf, 36, self.blocks_per_group);
        put_le_u32(&mut buf, 40, self.inodes_per_group);
        put_le_u32(&mut buf, 44, self.mtime);
        put_le_u32(&mut buf, 48, self.wtime);
        put_le_u16(&mut buf, 52, self.mnt_count);
        put_le_u16(&mut buf, 54, self.max_mnt_count);
        put_le_u16(&mut buf, 56, EXT2_MAGIC);
        put_le_u16(&mut buf, 58, self.state);
        put_le_u16(&mut buf, 60, self.errors);
        put_le_u16(&mut buf, 62, self.minor_rev_level);
        put_le_u32(&mut buf, 64, self.lastcheck);
        put_le_u32(&mut buf, 68, self.checkinterval);
        put_le_u32(&mut buf, 72, self.creator_os);
        put_le_u32(&mut buf, 76, self.rev_level);
        put_le_u16(&mut buf, 80, self.def_resuid);
        put_le_u16(&mut buf, 82, self.def_resgid);
        put_le_u32(&mut buf, 84, self.first_ino);
        put_le_u16(&mut buf, 88, self.inode_size);
        put_le_u16(&mut buf, 90, self.block_group_nr);
        put_le_u32(&mut buf, 92, self.feature_compat);
        put_le_u32(&mut buf, 96, self.feature_incompat);
        put_le_u32(&mut buf, 100, self.feature_ro_compat);
        buf[104..120].copy_from_slice(&self.uuid);
        let name = self.volume_name.as_bytes();
        let n = name.len().min(16);
        buf[120..120 + n].copy_from_slice(&name[..n]);
        buf
    }

    /// Parse a 1024-byte superblock region and sanity check its geometry.
    pub fn decode(region: &[u8]) -> Result<Self> {
        ensure_slice(region, 0, SUPERBLOCK_SIZE)?;
        let magic = le_u16(region, 56)?;
        if magic != EXT2_MAGIC {
            return Err(ImageError::format(format!(
                "bad superblock magic {magic:#06x}"
            )));
        }

        let sb = Self {
            inodes_count: le_u32(region, 0)?,
            blocks_count: le_u32(region, 4)?,
            r_blocks_count: le_u32(region, 8)?,
            free_blocks_count: le_u32(region, 12)?,
            free_inodes_count: le_u32(region, 16)?,
            first_data_block: le_u32(region, 20)?,
            log_block_size: le_u32(region, 24)?,
            blocks_per_group: le_u32(region, 32)?,
            inodes_per_group: le_u32(region, 40)?,
            mtime: le_u32(region, 44)?,
            wtime: le_u32(region, 48)?,
            mnt_count: le_u16(region, 52)?,
            max_mnt_count: le_u16(region, 54)?,
            state: le_u16(region, 58)?,
            errors: le_u16(region, 60)?,
            minor_rev_level: le_u16(region, 62)?,
            lastcheck: le_u32(region, 64)?,
            checkinterval: le_u32(region, 68)?,
            creator_os: le_u32(region, 72)?,
            rev_level: le_u32(region, 76)?,
            def_resuid: le_u16(region, 80)?,
            def_resgid: le_u16(region, 82)?,
            first_ino: le_u32(region, 84)?,
            inode_size: le_u16(region, 88)?,
            block_group_nr: le_u16(region, 90)?,
            feature_compat: le_u32(region, 92)?,
            feature_incompat: le_u32(region, 96)?,
            feature_ro_compat: le_u32(region, 100)?,
            uuid: read_fixed(region, 104)?,
            volume_name: trim_nul_padded(ensure_slice(region, 120, 16)?),
        };

        if sb.log_block_size > 6 {
            return Err(ImageError::format(format!(
                "unsupported block size shift {}",
                sb.log_block_size
            )));
        }
        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(ImageError::format("superblock has empty block groups"));
        }
        if sb.first_data_block >= sb.blocks_count {
            return Err(ImageError::format("superblock block count is too small"));
        }
        let inode_size = sb.inode_size();
        if inode_size < INODE_SIZE as u64 || !inode_size.is_power_of_two() || inode_size > sb.block_size() {
            return Err(ImageError::format(format!("bad inode size {inode_size}")));
        }
        Ok(sb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_le_u32(buf, 0, self.block_bitmap);
        put_le_u32(buf, 4, self.inode_bitmap);
        put_le_u32(buf, 8, self.inode_table);
        put_le_u16(buf, 12, self.free_blocks_count);
        put_le_u16(buf, 14, self.free_inodes_count);
        put_le_u16(buf, 16, self.used_dirs_count);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            block_bitmap: le_u32(bytes, 0)?,
            inode_bitmap: le_u32(bytes, 4)?,
            inode_table: le_u32(bytes, 8)?,
            free_blocks_count: le_u16(bytes, 12)?,
            free_inodes_count: le_u16(bytes, 14)?,
            used_dirs_count: le_u16(bytes, 16)?,
        })
    }
}

/// How an inode is classified by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Directory,
    Regular,
    Symlink,
    /// Device node, fifo, socket or an unknown type; carries the `S_IFMT` bits.
    Abnormal(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Inode {
    pub mode: u16,
    pub uid: u32,
    pub size: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u32,
    pub links_count: u16,
    /// In 512-byte units.
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
}

impl Inode {
    pub fn kind(&self) -> InodeKind {
        match self.mode & S_IFMT {
            S_IFDIR => InodeKind::Directory,
            S_IFREG => InodeKind::Regular,
            S_IFLNK => InodeKind::Symlink,
            other => InodeKind::Abnormal(other),
        }
    }

    pub fn permissions(&self) -> u16 {
        self.mode & !S_IFMT
    }

    /// Logical size in bytes.
    pub fn full_size(&self) -> u64 {
        self.size
    }

    /// A symlink whose target lives in the block pointer area.
    pub fn is_fast_symlink(&self, block_size: u64) -> bool {
        let acl_blocks = if self.file_acl != 0 { block_size / 512 } else { 0 };
        self.kind() == InodeKind::Symlink && u64::from(self.blocks) == acl_blocks
    }

    pub fn inline_data(&self) -> [u8; INLINE_DATA_LEN] {
        let mut out = [0_u8; INLINE_DATA_LEN];
        for (chunk, ptr) in out.chunks_exact_mut(4).zip(self.block.iter()) {
            chunk.copy_from_slice(&ptr.to_le_bytes());
        }
        out
    }

    pub fn set_inline_data(&mut self, data: &[u8]) {
        let mut raw = [0_u8; INLINE_DATA_LEN];
        let n = data.len().min(INLINE_DATA_LEN);
        raw[..n].copy_from_slice(&data[..n]);
        for (ptr, chunk) in self.block.iter_mut().zip(raw.chunks_exact(4)) {
            *ptr = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    pub fn encode(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0_u8; INODE_SIZE];
        put_le_u16(&mut buf, 0, self.mode);
        put_le_u16(&mut buf, 2, self.uid as u16);
        put_le_u32(&mut buf, 4, self.size as u32);
        put_le_u32(&mut buf, 8, self.atime);
        put_le_u32(&mut buf, 12, self.ctime);
        put_le_u32(&mut buf, 16, self.mtime);
        put_le_u32(&mut buf, 20, self.dtime);
        put_le_u16(&mut buf, 24, self.gid as u16);
        put_le_u16(&mut buf, 26, self.links_count);
        put_le_u32(&mut buf, 28, self.blocks);
        put_le_u32(&mut buf, 32, self.flags);
        for (i, ptr) in self.block.iter().enumerate() {
            put_le_u32(&mut buf, 40 + i * 4, *ptr);
        }
        put_le_u32(&mut buf, 100, self.generation);
        put_le_u32(&mut buf, 104, self.file_acl);
        put_le_u32(&mut buf, 108, (self.size >> 32) as u32);
        put_le_u16(&mut buf, 120, (self.uid >> 16) as u16);
        put_le_u16(&mut buf, 122, (self.gid >> 16) as u16);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_slice(bytes, 0, INODE_SIZE)?;
        let mode = le_u16(bytes, 0)?;
        let size_lo = u64::from(le_u32(bytes, 4)?);
        // i_size_high doubles as i_dir_acl for directories.
        let size_hi = if mode & S_IFMT == S_IFDIR {
            0
        } else {
            u64::from(le_u32(bytes, 108)?)
        };
        let mut block = [0_u32; N_BLOCKS];
        for (i, ptr) in block.iter_mut().enumerate() {
            *ptr = le_u32(bytes, 40 + i * 4)?;
        }
        Ok(Self {
            mode,
            uid: u32::from(le_u16(bytes, 2)?) | (u32::from(le_u16(bytes, 120)?) << 16),
            size: size_lo | (size_hi << 32),
            atime: le_u32(bytes, 8)?,
            ctime: le_u32(bytes, 12)?,
            mtime: le_u32(bytes, 16)?,
            dtime: le_u32(bytes, 20)?,
            gid: u32::from(le_u16(bytes, 24)?) | (u32::from(le_u16(bytes, 122)?) << 16),
            links_count: le_u16(bytes, 26)?,
            blocks: le_u32(bytes, 28)?,
            flags: le_u32(bytes, 32)?,
            block,
            generation: le_u32(bytes, 100)?,
            file_acl: le_u32(bytes, 104)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub file_type: u8,
    pub name: String,
}

impl DirEntry {
    pub fn new(inode: u32, file_type: u8, name: impl Into<String>) -> Self {
        Self {
            inode,
            file_type,
            name: name.into(),
        }
    }

    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// On-disk size of a record holding a `name_len` byte name.
pub fn dirent_len(name_len: usize) -> usize {
    (8 + name_len + 3) & !3
}

/// Blocks needed to hold records with the given name lengths.
pub fn dir_block_count(name_lens: impl IntoIterator<Item = usize>, block_size: usize) -> u64 {
    let mut blocks = 1_u64;
    let mut used = 0_usize;
    for len in name_lens {
        let rec = dirent_len(len);
        if used + rec > block_size {
            blocks += 1;
            used = 0;
        }
        used += rec;
    }
    blocks
}

/// Pack entries into directory blocks. The last record of every block is
/// stretched to the block end.
pub fn encode_dir(entries: &[DirEntry], block_size: usize) -> Vec<u8> {
    let blocks = dir_block_count(entries.iter().map(|e| e.name.len()), block_size) as usize;
    let mut out = vec![0_u8; blocks * block_size];
    let mut block_start = 0_usize;
    let mut used = 0_usize;
    let mut last_record: Option<usize> = None;

    let stretch = |out: &mut [u8], record: Option<usize>, block_end: usize| {
        if let Some(at) = record {
            put_le_u16(out, at + 4, (block_end - at) as u16);
        }
    };

    for entry in entries {
        let rec = dirent_len(entry.name.len());
        if used + rec > block_size {
            stretch(&mut out, last_record, block_start + block_size);
            block_start += block_size;
            used = 0;
            last_record = None;
        }
        let at = block_start + used;
        put_le_u32(&mut out, at, entry.inode);
        put_le_u16(&mut out, at + 4, rec as u16);
        out[at + 6] = entry.name.len() as u8;
        out[at + 7] = entry.file_type;
        out[at + 8..at + 8 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        used += rec;
        last_record = Some(at);
    }
    stretch(&mut out, last_record, block_start + block_size);
    if last_record.is_none() && !out.is_empty() {
        // Nothing in the final block: one empty record spanning it.
        put_le_u16(&mut out, block_start + 4, block_size.min(u16::MAX as usize) as u16);
    }
    out
}

/// Decode one directory block, in on-disk order. Zero-inode records are skipped.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0_usize;

    while offset + 8 <= block.len() {
        let inode = le_u32(block, offset)?;
        let rec_len = usize::from(le_u16(block, offset + 4)?);
        let name_len = usize::from(block[offset + 6]);
        let file_type = block[offset + 7];

        if rec_len < 8 || rec_len % 4 != 0 {
            return Err(ImageError::format(format!(
                "directory record at offset {offset} has bad length {rec_len}"
            )));
        }
        let entry_end = offset + rec_len;
        if entry_end > block.len() {
            return Err(ImageError::format(format!(
                "directory record at offset {offset} crosses the block boundary"
            )));
        }
        if inode != 0 {
            if 8 + name_len > rec_len {
                return Err(ImageError::format(format!(
                    "directory record at offset {offset} has a name longer than the record"
                )));
            }
            let name = &block[offset + 8..offset + 8 + name_len];
            entries.push(DirEntry {
                inode,
                file_type,
                name: String::from_utf8_lossy(name).into_owned(),
            });
        }
        offset = entry_end;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_super_groups() {
        let with: Vec<u64> = (0..60).filter(|g| group_has_super(*g, true)).collect();
        assert_eq!(with, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
        assert!(group_has_super(8, false));
    }

    #[test]
    fn inode_encodes_high_halves() {
        let inode = Inode {
            mode: S_IFREG | 0o644,
            uid: 0x0001_0002,
            gid: 1000,
            size: 0x1_0000_0001,
            links_count: 1,
            ..Inode::default()
        };
        let decoded = Inode::decode(&inode.encode()).unwrap();
        assert_eq!(decoded, inode);
        assert_eq!(decoded.kind(), InodeKind::Regular);
        assert_eq!(decoded.permissions(), 0o644);
    }

    #[test]
    fn inline_data_fills_block_area() {
        let mut inode = Inode {
            mode: S_IFLNK | 0o777,
            size: 7,
            ..Inode::default()
        };
        inode.set_inline_data(b"busybox");
        assert!(inode.is_fast_symlink(4096));
        assert_eq!(&inode.inline_data()[..7], b"busybox");
    }

    #[test]
    fn device_nodes_are_abnormal() {
        let inode = Inode {
            mode: S_IFCHR | 0o600,
            ..Inode::default()
        };
        assert_eq!(inode.kind(), InodeKind::Abnormal(S_IFCHR));
    }

    #[test]
    fn dir_blocks_stretch_last_record() {
        let entries = vec![
            DirEntry::new(2, FT_DIR, "."),
            DirEntry::new(2, FT_DIR, ".."),
            DirEntry::new(11, FT_REG_FILE, "hello.txt"),
        ];
        let block = encode_dir(&entries, 1024);
        assert_eq!(block.len(), 1024);
        assert_eq!(le_u16(&block, 4).unwrap(), 12);
        assert_eq!(le_u16(&block, 24 + 4).unwrap() as usize, 1024 - 24);
        assert_eq!(parse_dir_block(&block).unwrap(), entries);
    }

    #[test]
    fn records_never_straddle_blocks() {
        let mut entries = vec![DirEntry::new(2, FT_DIR, "."), DirEntry::new(2, FT_DIR, "..")];
        for i in 0..100 {
            entries.push(DirEntry::new(11 + i, FT_REG_FILE, format!("file-{i:04}")));
        }
        let names = entries.iter().map(|e| e.name.len());
        let blocks = dir_block_count(names, 1024);
        let data = encode_dir(&entries, 1024);
        assert_eq!(data.len() as u64, blocks * 1024);
        assert!(blocks > 1);

        let parsed: Vec<DirEntry> = data
            .chunks_exact(1024)
            .flat_map(|b| parse_dir_block(b).unwrap())
            .collect();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn zero_inode_records_are_skipped() {
        let mut block = vec![0_u8; 64];
        put_le_u16(&mut block, 4, 64);
        assert!(parse_dir_block(&block).unwrap().is_empty());
    }

    #[test]
    fn corrupt_record_length_is_format_error() {
        let mut block = vec![0_u8; 64];
        put_le_u32(&mut block, 0, 2);
        put_le_u16(&mut block, 4, 4);
        assert!(matches!(parse_dir_block(&block), Err(ImageError::Format(_))));
    }
}
