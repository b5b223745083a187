//! ext2 image builder.
//!
//! Building is split in two steps. [`plan`] walks the [`FileTree`] once,
//! numbers the inodes and counts every block the tree will need; it is also
//! the preflight, so an inode quota or file size problem is reported before
//! any output exists. [`FsPlan::build`] then fixes the geometry for a target
//! size, allocates blocks in logical order and renders the metadata into a
//! segment map. File contents are never copied; they are referenced.

use super::layout::{
    indirect_blocks, inode_target, max_addressable_blocks, required_inodes, Geometry,
    BLOCKS_PER_GROUP, BLOCK_SIZE, LOG_BLOCK_SIZE,
};
use super::{
    dir_block_count, encode_dir, DirEntry, GroupDesc, Inode, Superblock, DIND_BLOCK,
    EXT2_DYNAMIC_REV, FEATURE_INCOMPAT_FILETYPE, FEATURE_RO_COMPAT_LARGE_FILE,
    FEATURE_RO_COMPAT_SPARSE_SUPER, FIRST_INO, FT_DIR, FT_REG_FILE, FT_SYMLINK, GROUP_DESC_SIZE,
    IND_BLOCK, INLINE_DATA_LEN, INODE_SIZE, LARGE_FILE_SIZE, N_DIRECT, RESERVED_INODES,
    ROOT_INO, SUPERBLOCK_OFFSET, S_IFDIR, S_IFLNK, S_IFREG, TIND_BLOCK,
};
use crate::codec::{narrow_u32, put_le_u32};
use crate::error::{ImageError, Result};
use crate::segment::{Segment, SegmentedSource};
use crate::tree::{Content, DirNode, FileTree, Node, NodeMeta};

pub const DEFAULT_UID: u32 = 1000;
pub const DEFAULT_GID: u32 = 1000;
pub const DEFAULT_DIR_MODE: u16 = 0o755;
pub const DEFAULT_FILE_MODE: u16 = 0o644;
pub const DEFAULT_SYMLINK_MODE: u16 = 0o777;

#[derive(Debug, Clone)]
pub struct FsOptions {
    /// `0` sizes the inode table automatically.
    pub inode_quota: u64,
    /// Written as ctime and mtime. atime is always 0.
    pub timestamp: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            inode_quota: 0,
            timestamp: 0,
            uuid: [0; 16],
            volume_name: "vimg-root".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum Body {
    File { content: Content, size: u64 },
    Dir { entries: Vec<DirEntry>, subdirs: u16 },
    FastSymlink(Vec<u8>),
    SlowSymlink(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Planned {
    ino: u32,
    path: String,
    meta: NodeMeta,
    body: Body,
    data_blocks: u64,
    indirect_blocks: u64,
}

impl Planned {
    fn inode(&self, opts: &FsOptions) -> Inode {
        let (kind, default_mode, size, links) = match &self.body {
            Body::File { size, .. } => (S_IFREG, DEFAULT_FILE_MODE, *size, 1),
            Body::Dir { subdirs, .. } => (
                S_IFDIR,
                DEFAULT_DIR_MODE,
                self.data_blocks * BLOCK_SIZE,
                subdirs.saturating_add(2),
            ),
            Body::FastSymlink(t) | Body::SlowSymlink(t) => {
                (S_IFLNK, DEFAULT_SYMLINK_MODE, t.len() as u64, 1)
            }
        };
        Inode {
            mode: kind | (self.meta.mode.unwrap_or(default_mode) & 0o7777),
            uid: self.meta.uid.unwrap_or(DEFAULT_UID),
            gid: self.meta.gid.unwrap_or(DEFAULT_GID),
            size,
            atime: 0,
            ctime: opts.timestamp,
            mtime: opts.timestamp,
            links_count: links,
            blocks: ((self.data_blocks + self.indirect_blocks) * (BLOCK_SIZE / 512)) as u32,
            ..Inode::default()
        }
    }
}

/// A numbered, sized tree ready to be laid out.
#[derive(Debug, Clone)]
pub struct FsPlan {
    nodes: Vec<Planned>,
    total_blocks: u64,
    required_inodes: u64,
    target_inodes: u64,
    opts: FsOptions,
}

/// A rendered filesystem: its size and the segments that are not zero.
#[derive(Debug, Clone)]
pub struct FsImage {
    pub size: u64,
    pub geometry: Geometry,
    pub segments: Vec<Segment>,
}

impl FsImage {
    pub fn into_source(self) -> Result<SegmentedSource> {
        SegmentedSource::new(self.size, self.segments)
    }
}

/// Largest regular file size the builder can lay out.
pub fn max_file_size() -> u64 {
    let by_pointers = max_addressable_blocks(BLOCK_SIZE);
    let by_i_blocks = u64::from(u32::MAX) / (BLOCK_SIZE / 512);
    // i_blocks also counts the indirect blocks; leave room for them.
    let by_i_blocks = by_i_blocks - by_i_blocks / (BLOCK_SIZE / 4) - 3;
    by_pointers.min(by_i_blocks) * BLOCK_SIZE
}

/// Number the tree's inodes and size every object. Fails fast on an
/// insufficient inode quota or an oversized file.
pub fn plan(tree: &FileTree, opts: FsOptions) -> Result<FsPlan> {
    let required = required_inodes(tree.node_count());
    let target = inode_target(required, opts.inode_quota)?;

    let mut nodes = Vec::new();
    let mut next_ino = FIRST_INO;
    plan_dir(tree.root(), ROOT_INO, ROOT_INO, "", &mut next_ino, &mut nodes)?;

    let total_blocks = nodes
        .iter()
        .map(|n| n.data_blocks + n.indirect_blocks)
        .sum();
    Ok(FsPlan {
        nodes,
        total_blocks,
        required_inodes: required,
        target_inodes: target,
        opts,
    })
}

fn sized(path: &str, data_blocks: u64, bytes: u64) -> Result<(u64, u64)> {
    let max = max_file_size();
    if bytes > max {
        return Err(ImageError::FileTooLarge {
            path: path.to_string(),
            size: bytes,
            max,
        });
    }
    let indirect = indirect_blocks(data_blocks, BLOCK_SIZE).ok_or_else(|| ImageError::FileTooLarge {
        path: path.to_string(),
        size: bytes,
        max,
    })?;
    Ok((data_blocks, indirect))
}

fn plan_dir(
    dir: &DirNode,
    ino: u32,
    parent: u32,
    path: &str,
    next_ino: &mut u32,
    out: &mut Vec<Planned>,
) -> Result<()> {
    let mut entries = vec![DirEntry::new(ino, FT_DIR, "."), DirEntry::new(parent, FT_DIR, "..")];
    let mut children = Vec::with_capacity(dir.children.len());
    let mut subdirs = 0_u16;
    for (name, node) in &dir.children {
        let child_ino = *next_ino;
        *next_ino = next_ino
            .checked_add(1)
            .ok_or_else(|| ImageError::internal("inode numbers exhausted"))?;
        let file_type = match node {
            Node::File(_) => FT_REG_FILE,
            Node::Dir(_) => {
                subdirs = subdirs.checked_add(1).ok_or_else(|| {
                    ImageError::Unsupported(format!("'{path}/' has too many subdirectories"))
                })?;
                FT_DIR
            }
            Node::Symlink(_) => FT_SYMLINK,
        };
        entries.push(DirEntry::new(child_ino, file_type, name.clone()));
        children.push((child_ino, name, node));
    }

    let display = if path.is_empty() { "/" } else { path };
    let blocks = dir_block_count(entries.iter().map(|e| e.name.len()), BLOCK_SIZE as usize);
    let (data_blocks, indirect) = sized(display, blocks, blocks * BLOCK_SIZE)?;
    out.push(Planned {
        ino,
        path: display.to_string(),
        meta: dir.meta,
        body: Body::Dir { entries, subdirs },
        data_blocks,
        indirect_blocks: indirect,
    });

    for (child_ino, name, node) in children {
        let child_path = format!("{path}/{name}");
        match node {
            Node::Dir(sub) => plan_dir(sub, child_ino, ino, &child_path, next_ino, out)?,
            Node::File(file) => {
                let blocks = file.size.div_ceil(BLOCK_SIZE);
                let (data_blocks, indirect) = sized(&child_path, blocks, file.size)?;
                out.push(Planned {
                    ino: child_ino,
                    path: child_path,
                    meta: file.meta,
                    body: Body::File {
                        content: file.content.clone(),
                        size: file.size,
                    },
                    data_blocks,
                    indirect_blocks: indirect,
                });
            }
            Node::Symlink(link) => {
                let target = link.target.as_bytes().to_vec();
                let (body, data_blocks) = if target.len() < INLINE_DATA_LEN {
                    (Body::FastSymlink(target), 0)
                } else if target.len() as u64 <= BLOCK_SIZE {
                    (Body::SlowSymlink(target), 1)
                } else {
                    return Err(ImageError::FileTooLarge {
                        path: child_path,
                        size: target.len() as u64,
                        max: BLOCK_SIZE,
                    });
                };
                out.push(Planned {
                    ino: child_ino,
                    path: child_path,
                    meta: link.meta,
                    body,
                    data_blocks,
                    indirect_blocks: 0,
                });
            }
        }
    }
    Ok(())
}

impl FsPlan {
    pub fn required_inodes(&self) -> u64 {
        self.required_inodes
    }

    pub fn target_inodes(&self) -> u64 {
        self.target_inodes
    }

    /// Whether any regular file needs the upper 32 size bits.
    pub fn has_large_file(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.body, Body::File { size, .. } if size >= LARGE_FILE_SIZE))
    }

    /// Data plus indirect blocks the tree occupies.
    pub fn content_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn min_geometry(&self) -> Result<Geometry> {
        Geometry::minimal(self.total_blocks, self.target_inodes)
    }

    /// Smallest filesystem, in bytes, that holds the tree.
    pub fn min_size(&self) -> Result<u64> {
        Ok(self.min_geometry()?.size_bytes())
    }

    /// Lay the tree out in `size` bytes (rounded down to whole blocks), or in
    /// the minimal size when `None`. Space beyond the minimum stays free.
    pub fn build(&self, size: Option<u64>) -> Result<FsImage> {
        let geometry = match size {
            None => self.min_geometry()?,
            Some(bytes) => {
                let fits = Geometry::for_blocks(bytes / BLOCK_SIZE, self.target_inodes)?
                    .filter(|geo| geo.total_data_capacity() >= self.total_blocks);
                match fits {
                    Some(geo) => geo,
                    None => {
                        let required = self.min_size()?;
                        return Err(ImageError::DiskTooSmall {
                            required,
                            requested: bytes,
                            shortfall: required.saturating_sub(bytes),
                        });
                    }
                }
            }
        };
        Renderer::new(self, geometry).render()
    }
}

/// Hands out data blocks group by group, skipping each group's metadata.
struct Allocator {
    geometry: Geometry,
    group: u64,
    used: Vec<u64>,
}

impl Allocator {
    fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            group: 0,
            used: vec![0; geometry.group_count as usize],
        }
    }

    fn next(&mut self) -> Result<u32> {
        while self.group < self.geometry.group_count
            && self.used[self.group as usize] >= self.geometry.data_capacity(self.group)
        {
            self.group += 1;
        }
        if self.group >= self.geometry.group_count {
            return Err(ImageError::internal("block allocation ran past the last group"));
        }
        let block =
            self.geometry.first_data_block(self.group) + self.used[self.group as usize];
        self.used[self.group as usize] += 1;
        narrow_u32(block, "block number")
    }
}

/// Block pointers for one inode, plus the physical data blocks in logical order.
struct BlockMap {
    pointers: [u32; super::N_BLOCKS],
    data: Vec<u32>,
    indirect: Vec<(u32, Vec<u8>)>,
}

fn map_blocks(alloc: &mut Allocator, count: u64) -> Result<BlockMap> {
    let mut map = BlockMap {
        pointers: [0; super::N_BLOCKS],
        data: Vec::with_capacity(count as usize),
        indirect: Vec::new(),
    };
    let mut remaining = count;

    for slot in map.pointers.iter_mut().take(N_DIRECT) {
        if remaining == 0 {
            break;
        }
        let block = alloc.next()?;
        *slot = block;
        map.data.push(block);
        remaining -= 1;
    }
    for (slot, level) in [(IND_BLOCK, 1), (DIND_BLOCK, 2), (TIND_BLOCK, 3)] {
        if remaining == 0 {
            break;
        }
        map.pointers[slot] = fill_indirect(alloc, level, &mut remaining, &mut map)?;
    }
    if remaining != 0 {
        return Err(ImageError::internal(format!(
            "{remaining} blocks left unmapped past triple indirection"
        )));
    }
    Ok(map)
}

/// Allocate an indirect block of `level`, then what it points to, depth first.
fn fill_indirect(
    alloc: &mut Allocator,
    level: u32,
    remaining: &mut u64,
    map: &mut BlockMap,
) -> Result<u32> {
    let block = alloc.next()?;
    let mut table = vec![0_u8; BLOCK_SIZE as usize];
    for i in 0..(BLOCK_SIZE / 4) as usize {
        if *remaining == 0 {
            break;
        }
        let child = if level == 1 {
            let data = alloc.next()?;
            map.data.push(data);
            *remaining -= 1;
            data
        } else {
            fill_indirect(alloc, level - 1, remaining, map)?
        };
        put_le_u32(&mut table, i * 4, child);
    }
    map.indirect.push((block, table));
    Ok(block)
}

struct Renderer<'a> {
    plan: &'a FsPlan,
    geometry: Geometry,
    segments: Vec<Segment>,
    inode_tables: Vec<Vec<u8>>,
    used_inodes: Vec<u64>,
    used_dirs: Vec<u64>,
}

impl<'a> Renderer<'a> {
    fn new(plan: &'a FsPlan, geometry: Geometry) -> Self {
        let groups = geometry.group_count as usize;
        Self {
            plan,
            geometry,
            segments: Vec::new(),
            inode_tables: vec![Vec::new(); groups],
            used_inodes: vec![0; groups],
            used_dirs: vec![0; groups],
        }
    }

    fn put_inode(&mut self, ino: u32, inode: &Inode) {
        let index = u64::from(ino - 1);
        let group = (index / self.geometry.inodes_per_group) as usize;
        let at = ((index % self.geometry.inodes_per_group) as usize) * INODE_SIZE;
        let table = &mut self.inode_tables[group];
        if table.len() < at + INODE_SIZE {
            table.resize(at + INODE_SIZE, 0);
        }
        table[at..at + INODE_SIZE].copy_from_slice(&inode.encode());
    }

    fn render(mut self) -> Result<FsImage> {
        let geo = self.geometry;
        let bs = BLOCK_SIZE as usize;
        let mut alloc = Allocator::new(geo);

        let plan = self.plan;
        self.used_inodes[0] = RESERVED_INODES;
        for node in &plan.nodes {
            let map = map_blocks(&mut alloc, node.data_blocks)?;
            let mut inode = node.inode(&plan.opts);
            inode.block = map.pointers;

            for (block, table) in map.indirect {
                self.segments
                    .push(Segment::bytes(u64::from(block) * BLOCK_SIZE, table));
            }

            match &node.body {
                Body::File { content, size } => {
                    self.push_file_runs(&map.data, content, *size);
                }
                Body::Dir { entries, .. } => {
                    let bytes = encode_dir(entries, bs);
                    for (block, chunk) in map.data.iter().zip(bytes.chunks_exact(bs)) {
                        self.segments
                            .push(Segment::bytes(u64::from(*block) * BLOCK_SIZE, chunk.to_vec()));
                    }
                    let group = (u64::from(node.ino - 1) / geo.inodes_per_group) as usize;
                    self.used_dirs[group] += 1;
                }
                Body::FastSymlink(target) => inode.set_inline_data(target),
                Body::SlowSymlink(target) => {
                    let block = map.data.first().copied().ok_or_else(|| {
                        ImageError::internal(format!("symlink '{}' has no data block", node.path))
                    })?;
                    self.segments
                        .push(Segment::bytes(u64::from(block) * BLOCK_SIZE, target.clone()));
                }
            }

            self.put_inode(node.ino, &inode);
            if node.ino >= FIRST_INO {
                let group = (u64::from(node.ino - 1) / geo.inodes_per_group) as usize;
                self.used_inodes[group] += 1;
            }
        }

        self.render_metadata(&alloc.used)?;

        Ok(FsImage {
            size: geo.size_bytes(),
            geometry: geo,
            segments: self.segments,
        })
    }

    /// File content as runs of physically contiguous blocks.
    fn push_file_runs(&mut self, blocks: &[u32], content: &Content, size: u64) {
        let mut logical = 0_usize;
        while logical < blocks.len() {
            let mut run = 1;
            while logical + run < blocks.len()
                && blocks[logical + run] == blocks[logical] + run as u32
            {
                run += 1;
            }
            let file_offset = logical as u64 * BLOCK_SIZE;
            let len = (run as u64 * BLOCK_SIZE).min(size - file_offset);
            self.segments.push(Segment::content(
                u64::from(blocks[logical]) * BLOCK_SIZE,
                len,
                content.clone(),
                file_offset,
            ));
            logical += run;
        }
    }

    fn render_metadata(&mut self, used_data: &[u64]) -> Result<()> {
        let geo = self.geometry;
        let bs = BLOCK_SIZE as usize;
        let ipg = geo.inodes_per_group;

        let mut descs = Vec::with_capacity(geo.group_count as usize);
        let mut free_blocks = 0_u64;
        for g in 0..geo.group_count {
            let gi = g as usize;
            let used_blocks = geo.overhead(g) + used_data[gi];
            let group_free = geo.group_blocks(g) - used_blocks;
            let group_free_inodes = ipg - self.used_inodes[gi];
            free_blocks += group_free;

            descs.push(GroupDesc {
                block_bitmap: narrow_u32(geo.block_bitmap(g), "block bitmap")?,
                inode_bitmap: narrow_u32(geo.inode_bitmap(g), "inode bitmap")?,
                inode_table: narrow_u32(geo.inode_table(g), "inode table")?,
                free_blocks_count: narrow_u16(group_free, "free blocks")?,
                free_inodes_count: narrow_u16(group_free_inodes, "free inodes")?,
                used_dirs_count: narrow_u16(self.used_dirs[gi], "used dirs")?,
            });

            let block_bitmap = bitmap(used_blocks, geo.group_blocks(g), bs);
            self.segments
                .push(Segment::bytes(geo.block_bitmap(g) * BLOCK_SIZE, block_bitmap));
            let inode_bitmap = bitmap(self.used_inodes[gi], ipg, bs);
            self.segments
                .push(Segment::bytes(geo.inode_bitmap(g) * BLOCK_SIZE, inode_bitmap));

            let table = std::mem::take(&mut self.inode_tables[gi]);
            if !table.is_empty() {
                self.segments
                    .push(Segment::bytes(geo.inode_table(g) * BLOCK_SIZE, table));
            }
        }

        let mut gdt = vec![0_u8; (geo.gdt_blocks * BLOCK_SIZE) as usize];
        for (i, desc) in descs.iter().enumerate() {
            desc.encode_into(&mut gdt[i * GROUP_DESC_SIZE..(i + 1) * GROUP_DESC_SIZE]);
        }

        let used_inodes: u64 = self.used_inodes.iter().sum();
        let opts = &self.plan.opts;
        let mut ro_compat = FEATURE_RO_COMPAT_SPARSE_SUPER;
        if self.plan.has_large_file() {
            ro_compat |= FEATURE_RO_COMPAT_LARGE_FILE;
        }
        let mut sb = Superblock {
            inodes_count: narrow_u32(geo.inodes_count(), "inode count")?,
            blocks_count: narrow_u32(geo.blocks_count, "block count")?,
            r_blocks_count: 0,
            free_blocks_count: narrow_u32(free_blocks, "free blocks")?,
            free_inodes_count: narrow_u32(geo.inodes_count() - used_inodes, "free inodes")?,
            first_data_block: 0,
            log_block_size: LOG_BLOCK_SIZE,
            blocks_per_group: narrow_u32(BLOCKS_PER_GROUP, "blocks per group")?,
            inodes_per_group: narrow_u32(ipg, "inodes per group")?,
            mtime: 0,
            wtime: opts.timestamp,
            mnt_count: 0,
            max_mnt_count: u16::MAX,
            state: 1,
            errors: 1,
            minor_rev_level: 0,
            lastcheck: opts.timestamp,
            checkinterval: 0,
            creator_os: 0,
            rev_level: EXT2_DYNAMIC_REV,
            def_resuid: 0,
            def_resgid: 0,
            first_ino: FIRST_INO,
            inode_size: INODE_SIZE as u16,
            block_group_nr: 0,
            feature_compat: 0,
            feature_incompat: FEATURE_INCOMPAT_FILETYPE,
            feature_ro_compat: ro_compat,
            uuid: opts.uuid,
            volume_name: opts.volume_name.clone(),
        };

        for g in (0..geo.group_count).filter(|g| geo.has_super(*g)) {
            sb.block_group_nr = narrow_u16(g, "block group number")?;
            let start = geo.group_start(g) * BLOCK_SIZE;
            let sb_at = if g == 0 { SUPERBLOCK_OFFSET } else { start };
            self.segments.push(Segment::bytes(sb_at, sb.encode().to_vec()));
            self.segments
                .push(Segment::bytes(start + BLOCK_SIZE, gdt.clone()));
        }
        Ok(())
    }
}

fn narrow_u16(value: u64, field: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| ImageError::internal(format!("{field} value {value} does not fit in 16 bits")))
}

/// One bitmap block: the first `used` bits set, bits past `valid` set as padding.
fn bitmap(used: u64, valid: u64, block_size: usize) -> Vec<u8> {
    let mut bits = vec![0_u8; block_size];
    let total_bits = (block_size * 8) as u64;
    let mut set = |bit: u64| bits[(bit / 8) as usize] |= 1 << (bit % 8);
    for bit in 0..used.min(total_bits) {
        set(bit);
    }
    for bit in valid.min(total_bits)..total_bits {
        set(bit);
    }
    bits
}

/// Plan and render in one go.
pub fn build(tree: &FileTree, opts: FsOptions, size: Option<u64>) -> Result<FsImage> {
    plan(tree, opts)?.build(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::le_u16;
    use crate::ext::EXT2_MAGIC;
    use std::io::{Read, Seek, SeekFrom};

    fn sample_tree() -> FileTree {
        let mut tree = FileTree::new();
        tree.add_bytes("etc/hostname", b"vm\n".to_vec()).unwrap();
        tree.add_bytes("empty", Vec::new()).unwrap();
        tree.add_symlink("bin/sh", "busybox").unwrap();
        tree
    }

    #[test]
    fn plan_numbers_inodes_from_first_ino() {
        let plan = plan(&sample_tree(), FsOptions::default()).unwrap();
        let inos: Vec<u32> = plan.nodes.iter().map(|n| n.ino).collect();
        // root, then its children in name order: bin, empty, etc
        assert_eq!(inos[0], ROOT_INO);
        assert_eq!(plan.nodes[1].path, "/bin");
        assert_eq!(plan.nodes[1].ino, 11);
        assert_eq!(plan.required_inodes(), 10 + 5);
    }

    #[test]
    fn insufficient_quota_fails_in_plan() {
        let opts = FsOptions {
            inode_quota: 1,
            ..FsOptions::default()
        };
        let err = plan(&sample_tree(), opts).unwrap_err();
        assert!(matches!(err, ImageError::InsufficientInodes { .. }));
    }

    #[test]
    fn rendered_superblock_is_valid() {
        let image = build(&sample_tree(), FsOptions::default(), None).unwrap();
        let mut source = image.into_source().unwrap();
        let mut region = vec![0_u8; 1024];
        source.seek(SeekFrom::Start(1024)).unwrap();
        source.read_exact(&mut region).unwrap();
        assert_eq!(le_u16(&region, 56).unwrap(), EXT2_MAGIC);
        let sb = Superblock::decode(&region).unwrap();
        assert_eq!(sb.block_size(), 4096);
        assert_eq!(sb.first_ino, 11);
        assert_eq!(sb.free_inodes_count, sb.inodes_count - 15);
    }

    #[test]
    fn explicit_size_below_minimum_is_disk_too_small() {
        let plan = plan(&sample_tree(), FsOptions::default()).unwrap();
        let min = plan.min_size().unwrap();
        let err = plan.build(Some(min - BLOCK_SIZE)).unwrap_err();
        assert!(matches!(err, ImageError::DiskTooSmall { required, .. } if required == min));
        let bigger = plan.build(Some(min + 64 * BLOCK_SIZE)).unwrap();
        assert_eq!(bigger.size, min + 64 * BLOCK_SIZE);
    }

    #[test]
    fn file_runs_skip_indirect_blocks() {
        let mut tree = FileTree::new();
        tree.add_bytes("big", vec![7_u8; (13 * BLOCK_SIZE) as usize]).unwrap();
        let image = build(&tree, FsOptions::default(), None).unwrap();
        let runs: Vec<&Segment> = image
            .segments
            .iter()
            .filter(|s| matches!(s.data, crate::segment::SegmentData::Content { .. }))
            .collect();
        // 12 direct blocks, then the indirect block, then block 13.
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len, 12 * BLOCK_SIZE);
        assert_eq!(runs[1].len, BLOCK_SIZE);
        assert_eq!(runs[1].start, runs[0].end() + BLOCK_SIZE);
    }

    #[test]
    fn files_past_two_gib_set_large_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let host = temp.path().join("sparse.bin");
        std::fs::File::create(&host)
            .unwrap()
            .set_len(3 << 30)
            .unwrap();
        let mut tree = sample_tree();
        tree.add_host_file("var/big", &host).unwrap();

        let small = build(&sample_tree(), FsOptions::default(), None).unwrap();
        let large = build(&tree, FsOptions::default(), None).unwrap();
        for (image, expected) in [(small, false), (large, true)] {
            let mut source = image.into_source().unwrap();
            let mut region = vec![0_u8; 1024];
            source.seek(SeekFrom::Start(SUPERBLOCK_OFFSET)).unwrap();
            source.read_exact(&mut region).unwrap();
            let sb = Superblock::decode(&region).unwrap();
            assert_eq!(sb.large_file(), expected);
            assert!(sb.sparse_super());
        }
    }

    #[test]
    fn bitmap_pads_past_valid_bits() {
        let bits = bitmap(3, 10, 4);
        assert_eq!(bits[0], 0b0000_0111);
        assert_eq!(bits[1], 0b1111_1100);
        assert_eq!(bits[2], 0xFF);
    }
}
