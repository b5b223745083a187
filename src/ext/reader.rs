//! ext2 reader working directly on partition bytes.
//!
//! [`ExtFs`] holds the parsed primary superblock and group descriptors; the
//! bytes themselves are always read through the [`ImageSource`] the caller
//! passes in, so the same handle can serve GPT and boot-partition queries.

use super::layout::max_addressable_blocks;
use super::{
    group_has_super, parse_dir_block, DirEntry, GroupDesc, Inode, InodeKind, Superblock,
    DIND_BLOCK, GROUP_DESC_SIZE, IND_BLOCK, INLINE_DATA_LEN, INODE_SIZE, N_DIRECT, ROOT_INO,
    SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, TIND_BLOCK,
};
use crate::codec::{le_u32, to_usize};
use crate::error::{ImageError, Result};
use crate::source::{resolve_seek, ImageSource};
use std::io::{self, Read, Seek, SeekFrom};

#[derive(Debug, Clone)]
pub struct ExtFs {
    offset: u64,
    sb: Superblock,
    groups: Vec<GroupDesc>,
}

impl ExtFs {
    /// Parse the superblock and group descriptors of the filesystem starting
    /// at `partition_offset`.
    pub fn open(source: &mut dyn ImageSource, partition_offset: u64) -> Result<Self> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        source.read_exact_at(partition_offset + SUPERBLOCK_OFFSET, &mut region)?;
        let sb = Superblock::decode(&region)?;

        let bs = sb.block_size();
        let available = source.len().saturating_sub(partition_offset);
        let fs_bytes = u64::from(sb.blocks_count) * bs;
        if fs_bytes > available {
            return Err(ImageError::format(format!(
                "superblock claims {fs_bytes} bytes but only {available} are present"
            )));
        }
        let group_count = to_usize(sb.group_count(), "group count")?;
        if (group_count as u64) * u64::from(sb.inodes_per_group) < u64::from(sb.inodes_count) {
            return Err(ImageError::format(
                "superblock inode count exceeds what its groups can hold",
            ));
        }
        let gdt_offset = partition_offset + (u64::from(sb.first_data_block) + 1) * bs;
        let mut gdt = vec![0_u8; group_count * GROUP_DESC_SIZE];
        source.read_exact_at(gdt_offset, &mut gdt)?;
        let groups = gdt
            .chunks_exact(GROUP_DESC_SIZE)
            .map(GroupDesc::decode)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            offset: partition_offset,
            sb,
            groups,
        })
    }

    /// The primary superblock as parsed at open.
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn group_descs(&self) -> &[GroupDesc] {
        &self.groups
    }

    pub fn block_size(&self) -> u64 {
        self.sb.block_size()
    }

    /// Groups carrying a superblock copy, primary first.
    pub fn superblock_groups(&self) -> Vec<u64> {
        let sparse = self.sb.sparse_super();
        (0..self.sb.group_count())
            .filter(|g| group_has_super(*g, sparse))
            .collect()
    }

    /// Read superblock copy `copy` from disk: 0 is the primary, 1.. the
    /// backups in group order.
    pub fn read_superblock(&self, source: &mut dyn ImageSource, copy: usize) -> Result<Superblock> {
        let groups = self.superblock_groups();
        let group = *groups.get(copy).ok_or_else(|| {
            ImageError::NotFound(format!(
                "superblock copy {copy} (the filesystem has {})",
                groups.len()
            ))
        })?;
        let at = if group == 0 {
            SUPERBLOCK_OFFSET
        } else {
            (u64::from(self.sb.first_data_block) + group * u64::from(self.sb.blocks_per_group))
                * self.block_size()
        };
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        source.read_exact_at(self.offset + at, &mut region)?;
        Superblock::decode(&region)
    }

    fn read_block(&self, source: &mut dyn ImageSource, block: u32) -> Result<Vec<u8>> {
        if block >= self.sb.blocks_count {
            return Err(ImageError::format(format!(
                "block {block} is beyond the {} block filesystem",
                self.sb.blocks_count
            )));
        }
        let bs = self.block_size();
        let mut buf = vec![0_u8; to_usize(bs, "block size")?];
        source.read_exact_at(self.offset + u64::from(block) * bs, &mut buf)?;
        Ok(buf)
    }

    pub fn read_inode(&self, source: &mut dyn ImageSource, ino: u32) -> Result<Inode> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(ImageError::format(format!(
                "inode {ino} is out of range 1..={}",
                self.sb.inodes_count
            )));
        }
        let index = u64::from(ino - 1);
        let ipg = u64::from(self.sb.inodes_per_group);
        let desc = self.groups[(index / ipg) as usize];
        let at = u64::from(desc.inode_table) * self.block_size()
            + (index % ipg) * self.sb.inode_size();
        let mut raw = [0_u8; INODE_SIZE];
        source.read_exact_at(self.offset + at, &mut raw)?;
        Inode::decode(&raw)
    }

    /// Physical block for every logical block of `inode`; 0 marks a sparse block.
    pub fn block_list(&self, source: &mut dyn ImageSource, inode: &Inode) -> Result<Vec<u32>> {
        let bs = self.block_size();
        let mut remaining = inode.full_size().div_ceil(bs);
        if remaining > max_addressable_blocks(bs) {
            return Err(ImageError::format(format!(
                "inode size {} exceeds what its block pointers can address",
                inode.full_size()
            )));
        }
        // Every logical block gets an entry, holes included.
        if remaining > u64::from(self.sb.blocks_count) {
            return Err(ImageError::Unsupported(format!(
                "inode maps {remaining} blocks, more than the {} block filesystem",
                self.sb.blocks_count
            )));
        }

        let mut out = Vec::with_capacity(to_usize(remaining, "block count")?);
        for ptr in inode.block.iter().take(N_DIRECT) {
            if remaining == 0 {
                break;
            }
            out.push(*ptr);
            remaining -= 1;
        }
        for (slot, level) in [(IND_BLOCK, 1), (DIND_BLOCK, 2), (TIND_BLOCK, 3)] {
            if remaining == 0 {
                break;
            }
            self.collect(source, inode.block[slot], level, &mut remaining, &mut out)?;
        }
        Ok(out)
    }

    fn collect(
        &self,
        source: &mut dyn ImageSource,
        ptr: u32,
        level: u32,
        remaining: &mut u64,
        out: &mut Vec<u32>,
    ) -> Result<()> {
        let per = self.block_size() / 4;
        if ptr == 0 {
            let span = (*remaining).min(per.pow(level));
            out.extend(std::iter::repeat(0).take(span as usize));
            *remaining -= span;
            return Ok(());
        }
        let table = self.read_block(source, ptr)?;
        for i in 0..per as usize {
            if *remaining == 0 {
                break;
            }
            let child = le_u32(&table, i * 4)?;
            if level == 1 {
                out.push(child);
                *remaining -= 1;
            } else {
                self.collect(source, child, level - 1, remaining, out)?;
            }
        }
        Ok(())
    }

    /// Directory entries in on-disk order, `.` and `..` first.
    pub fn readdir(&self, source: &mut dyn ImageSource, ino: u32) -> Result<Vec<DirEntry>> {
        let inode = self.read_inode(source, ino)?;
        if inode.kind() != InodeKind::Directory {
            return Err(ImageError::NotADirectory(format!("inode {ino}")));
        }
        let mut entries = Vec::new();
        for block in self.block_list(source, &inode)? {
            if block == 0 {
                continue;
            }
            entries.extend(parse_dir_block(&self.read_block(source, block)?)?);
        }
        Ok(entries)
    }

    /// Walk `path` from the root inode.
    pub fn resolve_path(&self, source: &mut dyn ImageSource, path: &str) -> Result<u32> {
        let mut ino = ROOT_INO;
        let mut walked = String::new();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            let entries = self.readdir(source, ino).map_err(|err| match err {
                ImageError::NotADirectory(_) => ImageError::NotADirectory(if walked.is_empty() {
                    "/".to_string()
                } else {
                    walked.clone()
                }),
                other => other,
            })?;
            walked.push('/');
            walked.push_str(part);
            ino = entries
                .iter()
                .find(|e| e.name == part)
                .map(|e| e.inode)
                .ok_or_else(|| ImageError::NotFound(walked.clone()))?;
        }
        Ok(ino)
    }

    /// A reader over `[0, full_size)` of the inode's content.
    pub fn inode_reader<'a>(
        &self,
        source: &'a mut dyn ImageSource,
        inode: &Inode,
    ) -> Result<InodeReader<'a>> {
        let bs = self.block_size();
        if inode.is_fast_symlink(bs) {
            if inode.full_size() > INLINE_DATA_LEN as u64 {
                return Err(ImageError::format(format!(
                    "inline symlink claims {} bytes",
                    inode.full_size()
                )));
            }
            return Ok(InodeReader {
                source,
                offset: self.offset,
                block_size: bs,
                blocks: Vec::new(),
                inline: Some(inode.inline_data()),
                size: inode.full_size(),
                pos: 0,
            });
        }
        let blocks = self.block_list(source, inode)?;
        if let Some(bad) = blocks.iter().find(|b| **b >= self.sb.blocks_count) {
            return Err(ImageError::format(format!(
                "data block {bad} is beyond the {} block filesystem",
                self.sb.blocks_count
            )));
        }
        Ok(InodeReader {
            source,
            offset: self.offset,
            block_size: bs,
            blocks,
            inline: None,
            size: inode.full_size(),
            pos: 0,
        })
    }

    pub fn read_link(&self, source: &mut dyn ImageSource, inode: &Inode) -> Result<String> {
        if inode.kind() != InodeKind::Symlink {
            return Err(ImageError::Unsupported("inode is not a symlink".into()));
        }
        let mut target = Vec::new();
        self.inode_reader(source, inode)?.read_to_end(&mut target)?;
        Ok(String::from_utf8_lossy(&target).into_owned())
    }
}

/// Streams an inode's bytes, stopping exactly at its logical size.
pub struct InodeReader<'a> {
    source: &'a mut dyn ImageSource,
    offset: u64,
    block_size: u64,
    blocks: Vec<u32>,
    inline: Option<[u8; INLINE_DATA_LEN]>,
    size: u64,
    pos: u64,
}

impl InodeReader<'_> {
    pub fn full_size(&self) -> u64 {
        self.size
    }
}

impl Read for InodeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let remaining = self.size - self.pos;

        if let Some(inline) = &self.inline {
            let n = (buf.len() as u64).min(remaining) as usize;
            let from = self.pos as usize;
            buf[..n].copy_from_slice(&inline[from..from + n]);
            self.pos += n as u64;
            return Ok(n);
        }

        let index = (self.pos / self.block_size) as usize;
        let within = self.pos % self.block_size;
        let n = (buf.len() as u64)
            .min(self.block_size - within)
            .min(remaining) as usize;
        match self.blocks.get(index).copied() {
            Some(0) => buf[..n].fill(0),
            Some(block) => {
                let at = self.offset + u64::from(block) * self.block_size + within;
                self.source.read_exact_at(at, &mut buf[..n])?;
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("logical block {index} has no mapping"),
                ))
            }
        }
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for InodeReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.size)?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::builder::{build, FsOptions};
    use crate::ext::N_BLOCKS;
    use crate::tree::FileTree;

    fn materialize(tree: &FileTree) -> Vec<u8> {
        let image = build(tree, FsOptions::default(), None).unwrap();
        let mut source = image.into_source().unwrap();
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).unwrap();
        bytes
    }

    fn sample() -> Vec<u8> {
        let mut tree = FileTree::new();
        tree.add_bytes("etc/hostname", b"vm\n".to_vec()).unwrap();
        tree.add_bytes("empty", Vec::new()).unwrap();
        tree.add_symlink("bin/sh", "busybox").unwrap();
        tree.add_symlink("long", "x".repeat(100)).unwrap();
        materialize(&tree)
    }

    #[test]
    fn readdir_starts_with_dot_entries() {
        let mut disk = sample();
        let fs = ExtFs::open(&mut disk, 0).unwrap();
        let entries = fs.readdir(&mut disk, ROOT_INO).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "bin", "empty", "etc", "long"]);
        assert_eq!(entries, fs.readdir(&mut disk, ROOT_INO).unwrap());
    }

    #[test]
    fn resolves_paths_and_reads_content() {
        let mut disk = sample();
        let fs = ExtFs::open(&mut disk, 0).unwrap();
        let ino = fs.resolve_path(&mut disk, "/etc/hostname").unwrap();
        let inode = fs.read_inode(&mut disk, ino).unwrap();
        assert_eq!(inode.full_size(), 3);
        assert_eq!(inode.atime, 0);
        let mut content = Vec::new();
        fs.inode_reader(&mut disk, &inode)
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"vm\n");
    }

    #[test]
    fn resolve_errors_are_specific() {
        let mut disk = sample();
        let fs = ExtFs::open(&mut disk, 0).unwrap();
        assert!(matches!(
            fs.resolve_path(&mut disk, "/etc/missing"),
            Err(ImageError::NotFound(p)) if p == "/etc/missing"
        ));
        assert!(matches!(
            fs.resolve_path(&mut disk, "/empty/child"),
            Err(ImageError::NotADirectory(p)) if p == "/empty"
        ));
    }

    #[test]
    fn symlinks_fast_and_slow() {
        let mut disk = sample();
        let fs = ExtFs::open(&mut disk, 0).unwrap();
        let sh = fs.resolve_path(&mut disk, "bin/sh").unwrap();
        let sh = fs.read_inode(&mut disk, sh).unwrap();
        assert!(sh.is_fast_symlink(fs.block_size()));
        assert_eq!(fs.read_link(&mut disk, &sh).unwrap(), "busybox");

        let long = fs.resolve_path(&mut disk, "long").unwrap();
        let long = fs.read_inode(&mut disk, long).unwrap();
        assert!(!long.is_fast_symlink(fs.block_size()));
        assert_eq!(fs.read_link(&mut disk, &long).unwrap(), "x".repeat(100));
    }

    #[test]
    fn superblock_copies_match_primary() {
        let mut tree = FileTree::new();
        tree.add_bytes("a", vec![1_u8; 8]).unwrap();
        let image = build(&tree, FsOptions::default(), Some(40 * 1024 * 4096)).unwrap();
        let mut source = image.into_source().unwrap();
        let mut disk = Vec::new();
        source.read_to_end(&mut disk).unwrap();

        let fs = ExtFs::open(&mut disk, 0).unwrap();
        assert_eq!(fs.superblock_groups(), vec![0, 1]);
        let backup = fs.read_superblock(&mut disk, 1).unwrap();
        assert_eq!(backup.block_group_nr, 1);
        assert_eq!(backup.blocks_count, fs.superblock().blocks_count);
        assert!(fs.read_superblock(&mut disk, 2).is_err());
    }

    #[test]
    fn bad_magic_is_format_error() {
        let mut disk = vec![0_u8; 8192];
        assert!(matches!(ExtFs::open(&mut disk, 0), Err(ImageError::Format(_))));
    }

    #[test]
    fn truncated_source_is_format_error() {
        let mut disk = sample();
        disk.truncate(disk.len() / 2);
        assert!(matches!(ExtFs::open(&mut disk, 0), Err(ImageError::Format(_))));
    }

    #[test]
    fn oversized_inode_is_rejected_before_mapping() {
        let mut disk = sample();
        let fs = ExtFs::open(&mut disk, 0).unwrap();
        let ino = fs.resolve_path(&mut disk, "etc/hostname").unwrap();
        let mut inode = fs.read_inode(&mut disk, ino).unwrap();
        inode.size = u64::from(fs.superblock().blocks_count + 1) * fs.block_size();
        inode.block = [0; N_BLOCKS];
        assert!(matches!(
            fs.block_list(&mut disk, &inode),
            Err(ImageError::Unsupported(_))
        ));
    }

    #[test]
    fn out_of_range_inode_is_format_error() {
        let mut disk = sample();
        let fs = ExtFs::open(&mut disk, 0).unwrap();
        let too_big = fs.superblock().inodes_count + 1;
        assert!(matches!(fs.read_inode(&mut disk, too_big), Err(ImageError::Format(_))));
    }
}
