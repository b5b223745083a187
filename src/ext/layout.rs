//! Block-group geometry for the filesystem builder.
//!
//! Per group, in block order:
//!
//! ```text
//! [superblock + GDT, only in groups with a backup] [block bitmap] [inode bitmap] [inode table] [data ...]
//! ```
//!
//! Group 0's superblock sits at byte 1024 of block 0, the other copies at the
//! start of their group's first block.

use super::{group_has_super, GROUP_DESC_SIZE, INODE_SIZE, RESERVED_INODES};
use crate::error::{ImageError, Result};

pub const BLOCK_SIZE: u64 = 4096;
pub const LOG_BLOCK_SIZE: u32 = 2;
pub const BLOCKS_PER_GROUP: u64 = 8 * BLOCK_SIZE;
pub const MAX_INODES_PER_GROUP: u64 = 8 * BLOCK_SIZE;
/// Inodes per inode-table block; inodes per group is kept a multiple of this.
pub const INODES_PER_BLOCK: u64 = BLOCK_SIZE / INODE_SIZE as u64;

/// Inodes the tree needs: the reserved range plus one per non-root node.
pub fn required_inodes(node_count: u64) -> u64 {
    RESERVED_INODES + node_count.saturating_sub(1)
}

/// Resolve the inode quota. `0` means automatic (required + 25 %).
pub fn inode_target(required: u64, quota: u64) -> Result<u64> {
    if quota == 0 {
        return Ok(required + required.div_ceil(4));
    }
    if quota < required {
        return Err(ImageError::InsufficientInodes { required, quota });
    }
    Ok(quota)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub blocks_count: u64,
    pub group_count: u64,
    pub inodes_per_group: u64,
    pub gdt_blocks: u64,
}

impl Geometry {
    /// Geometry for exactly `group_count` groups holding `target_inodes`, or
    /// `None` when the inodes cannot fit.
    fn with_groups(group_count: u64, target_inodes: u64, blocks_count: u64) -> Option<Self> {
        let per_group = target_inodes.div_ceil(group_count);
        let inodes_per_group = per_group.div_ceil(INODES_PER_BLOCK) * INODES_PER_BLOCK;
        if inodes_per_group > MAX_INODES_PER_GROUP {
            return None;
        }
        let gdt_blocks = (group_count * GROUP_DESC_SIZE as u64).div_ceil(BLOCK_SIZE);
        Some(Self {
            blocks_count,
            group_count,
            inodes_per_group,
            gdt_blocks,
        })
    }

    /// Smallest geometry whose data regions hold `data_blocks`.
    ///
    /// Metadata overhead grows with the group count, so iterate to a fixed point.
    pub fn minimal(data_blocks: u64, target_inodes: u64) -> Result<Self> {
        let mut groups = 1_u64;
        loop {
            let Some(mut geo) = Self::with_groups(groups, target_inodes, 0) else {
                groups += 1;
                continue;
            };
            let overhead: u64 = (0..groups).map(|g| geo.overhead(g)).sum();
            let total = data_blocks + overhead;
            let needed = total.div_ceil(BLOCKS_PER_GROUP).max(1);
            if needed > groups {
                groups = needed;
                continue;
            }
            // The last group must at least hold its own metadata.
            let last_start = (groups - 1) * BLOCKS_PER_GROUP;
            geo.blocks_count = total.max(last_start + geo.overhead(groups - 1) + 1);
            geo.check_limits()?;
            return Ok(geo);
        }
    }

    /// Geometry filling exactly `blocks_count` blocks (a trailing group too
    /// small for its own metadata is dropped). `None` when the inodes cannot fit.
    pub fn for_blocks(blocks_count: u64, target_inodes: u64) -> Result<Option<Self>> {
        if blocks_count == 0 {
            return Ok(None);
        }
        let mut groups = blocks_count.div_ceil(BLOCKS_PER_GROUP);
        let mut blocks = blocks_count;
        loop {
            let Some(mut geo) = Self::with_groups(groups, target_inodes, blocks) else {
                return Ok(None);
            };
            let last_start = (groups - 1) * BLOCKS_PER_GROUP;
            if groups > 1 && blocks - last_start <= geo.overhead(groups - 1) {
                groups -= 1;
                blocks = last_start;
                continue;
            }
            if blocks <= geo.overhead(0) {
                return Ok(None);
            }
            geo.blocks_count = blocks;
            geo.check_limits()?;
            return Ok(Some(geo));
        }
    }

    fn check_limits(&self) -> Result<()> {
        if self.blocks_count > u64::from(u32::MAX) || self.inodes_count() > u64::from(u32::MAX) {
            return Err(ImageError::SizeLimit {
                format: "ext2",
                size: self.size_bytes(),
                max: u64::from(u32::MAX) * BLOCK_SIZE,
            });
        }
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.blocks_count * BLOCK_SIZE
    }

    pub fn inodes_count(&self) -> u64 {
        self.inodes_per_group * self.group_count
    }

    pub fn inode_table_blocks(&self) -> u64 {
        self.inodes_per_group / INODES_PER_BLOCK
    }

    pub fn has_super(&self, group: u64) -> bool {
        group_has_super(group, true)
    }

    pub fn group_start(&self, group: u64) -> u64 {
        group * BLOCKS_PER_GROUP
    }

    pub fn group_blocks(&self, group: u64) -> u64 {
        (self.blocks_count - self.group_start(group)).min(BLOCKS_PER_GROUP)
    }

    /// Blocks taken by superblock/GDT copies in `group`.
    pub fn super_blocks(&self, group: u64) -> u64 {
        if self.has_super(group) {
            1 + self.gdt_blocks
        } else {
            0
        }
    }

    pub fn overhead(&self, group: u64) -> u64 {
        self.super_blocks(group) + 2 + self.inode_table_blocks()
    }

    pub fn block_bitmap(&self, group: u64) -> u64 {
        self.group_start(group) + self.super_blocks(group)
    }

    pub fn inode_bitmap(&self, group: u64) -> u64 {
        self.block_bitmap(group) + 1
    }

    pub fn inode_table(&self, group: u64) -> u64 {
        self.block_bitmap(group) + 2
    }

    pub fn first_data_block(&self, group: u64) -> u64 {
        self.group_start(group) + self.overhead(group)
    }

    pub fn data_capacity(&self, group: u64) -> u64 {
        self.group_blocks(group).saturating_sub(self.overhead(group))
    }

    pub fn total_data_capacity(&self) -> u64 {
        (0..self.group_count).map(|g| self.data_capacity(g)).sum()
    }
}

/// Indirect blocks needed to map `data_blocks` blocks, or `None` past
/// triple-indirect reach.
pub fn indirect_blocks(data_blocks: u64, block_size: u64) -> Option<u64> {
    let per = block_size / 4;
    let direct = super::N_DIRECT as u64;
    if data_blocks <= direct {
        return Some(0);
    }
    let rest = data_blocks - direct;
    if rest <= per {
        return Some(1);
    }
    let rest = rest - per;
    if rest <= per * per {
        return Some(2 + rest.div_ceil(per));
    }
    let rest = rest - per * per;
    if rest <= per * per * per {
        // Single + double (full) + triple with its second and third levels.
        return Some(1 + (1 + per) + 1 + rest.div_ceil(per * per) + rest.div_ceil(per));
    }
    None
}

/// Largest block count an inode can address.
pub fn max_addressable_blocks(block_size: u64) -> u64 {
    let per = block_size / 4;
    super::N_DIRECT as u64 + per + per * per + per * per * per
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_quota_adds_headroom() {
        assert_eq!(inode_target(13, 0).unwrap(), 17);
        assert_eq!(inode_target(13, 100).unwrap(), 100);
    }

    #[test]
    fn small_quota_is_rejected() {
        let required = required_inodes(4);
        assert_eq!(required, 13);
        let err = inode_target(required, 1).unwrap_err();
        assert!(matches!(err, ImageError::InsufficientInodes { required: 13, quota: 1 }));
    }

    #[test]
    fn minimal_single_group() {
        let geo = Geometry::minimal(10, 20).unwrap();
        assert_eq!(geo.group_count, 1);
        assert_eq!(geo.inodes_per_group, 32);
        assert_eq!(geo.gdt_blocks, 1);
        // sb + gdt + 2 bitmaps + 1 inode table block + 10 data blocks
        assert_eq!(geo.blocks_count, 15);
        assert_eq!(geo.total_data_capacity(), 10);
    }

    #[test]
    fn minimal_spills_into_second_group() {
        let geo = Geometry::minimal(BLOCKS_PER_GROUP, 20).unwrap();
        assert_eq!(geo.group_count, 2);
        assert!(geo.total_data_capacity() >= BLOCKS_PER_GROUP);
        assert_eq!(geo.first_data_block(1), BLOCKS_PER_GROUP + 5);
    }

    #[test]
    fn many_inodes_force_more_groups() {
        let geo = Geometry::minimal(1, MAX_INODES_PER_GROUP * 2 + 1).unwrap();
        assert_eq!(geo.group_count, 3);
        assert!(geo.inodes_count() > MAX_INODES_PER_GROUP * 2);
        assert!(geo.data_capacity(2) >= 1);
    }

    #[test]
    fn explicit_size_drops_tiny_tail_group() {
        let geo = Geometry::for_blocks(BLOCKS_PER_GROUP + 3, 20).unwrap().unwrap();
        assert_eq!(geo.group_count, 1);
        assert_eq!(geo.blocks_count, BLOCKS_PER_GROUP);

        let geo = Geometry::for_blocks(BLOCKS_PER_GROUP + 100, 20).unwrap().unwrap();
        assert_eq!(geo.group_count, 2);
        assert_eq!(geo.data_capacity(1), 100 - 5);
    }

    #[test]
    fn indirect_overhead() {
        assert_eq!(indirect_blocks(12, 4096), Some(0));
        assert_eq!(indirect_blocks(13, 4096), Some(1));
        assert_eq!(indirect_blocks(12 + 1024, 4096), Some(1));
        assert_eq!(indirect_blocks(12 + 1024 + 1, 4096), Some(3));
        assert_eq!(indirect_blocks(12 + 1024 + 1025, 4096), Some(4));
        assert_eq!(indirect_blocks(max_addressable_blocks(4096) + 1, 4096), None);
    }
}
