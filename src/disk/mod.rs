//! Disk assembly: partition placement, sizing and the final virtual disk.
//!
//! ```text
//! LBA 0..34          protective MBR, primary GPT
//! LBA 34..2048       unused
//! LBA 2048..         vimg-os   (boot partition)
//! ..                 vimg-root (ext2, up to the last usable LBA)
//! last 33 sectors    backup entry array, backup GPT header
//! ```

pub mod boot;

use crate::codec::align_up;
use crate::config::DiskSize;
use crate::error::{ImageError, Result};
use crate::ext::builder::FsImage;
use crate::gpt::{
    self, GptEntry, Guid, ATTR_LEGACY_BIOS_BOOTABLE, BACKUP_SECTORS,
    FIRST_PARTITION_OFFSET_SECTORS, OS_PARTITION, PRIMARY_SECTORS, ROOT_PARTITION, SECTOR_SIZE,
};
use crate::segment::{Segment, SegmentedSource};
use boot::BootPartition;

/// Where everything goes on the disk. All LBAs are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLayout {
    pub total_bytes: u64,
    pub boot_first_lba: u64,
    pub boot_last_lba: u64,
    pub root_first_lba: u64,
    pub root_last_lba: u64,
}

impl DiskLayout {
    /// Size the disk for a boot partition of `boot_size` bytes and a
    /// filesystem of at least `fs_min_size` bytes, rounded up to `alignment`.
    pub fn plan(
        boot_size: u64,
        fs_min_size: u64,
        requested: DiskSize,
        alignment: u64,
    ) -> Result<Self> {
        if alignment == 0 || alignment % SECTOR_SIZE != 0 {
            return Err(ImageError::internal(format!(
                "disk alignment {alignment} is not a whole number of sectors"
            )));
        }
        if boot_size == 0 || boot_size % SECTOR_SIZE != 0 {
            return Err(ImageError::internal(format!(
                "boot partition size {boot_size} is not a whole number of sectors"
            )));
        }
        let boot_first_lba = FIRST_PARTITION_OFFSET_SECTORS;
        let root_first_lba = boot_first_lba + boot_size / SECTOR_SIZE;
        let fs_sectors = fs_min_size.div_ceil(SECTOR_SIZE);
        let minimum = align_up(
            (root_first_lba + fs_sectors + BACKUP_SECTORS) * SECTOR_SIZE,
            alignment,
        );

        let total_bytes = match requested {
            DiskSize::Auto => minimum,
            DiskSize::Extra(extra) => align_up(minimum.saturating_add(extra), alignment),
            DiskSize::Exact(bytes) if bytes < minimum => {
                return Err(ImageError::DiskTooSmall {
                    required: minimum,
                    requested: bytes,
                    shortfall: minimum - bytes,
                })
            }
            DiskSize::Exact(bytes) => align_up(bytes, alignment),
        };
        let total_sectors = total_bytes / SECTOR_SIZE;

        Ok(Self {
            total_bytes,
            boot_first_lba,
            boot_last_lba: root_first_lba - 1,
            root_first_lba,
            root_last_lba: total_sectors - BACKUP_SECTORS - 1,
        })
    }

    pub fn disk_sectors(&self) -> u64 {
        self.total_bytes / SECTOR_SIZE
    }

    pub fn boot_bytes(&self) -> u64 {
        (self.boot_last_lba + 1 - self.boot_first_lba) * SECTOR_SIZE
    }

    /// Bytes available to the filesystem.
    pub fn root_bytes(&self) -> u64 {
        (self.root_last_lba + 1 - self.root_first_lba) * SECTOR_SIZE
    }

    pub fn partitions(&self, seed: &[u8]) -> Vec<GptEntry> {
        vec![
            GptEntry {
                type_guid: Guid::BIOS_BOOT,
                unique_guid: Guid::derive(seed, "os"),
                first_lba: self.boot_first_lba,
                last_lba: self.boot_last_lba,
                attributes: ATTR_LEGACY_BIOS_BOOTABLE,
                name: OS_PARTITION.to_string(),
            },
            GptEntry {
                type_guid: Guid::LINUX_FS,
                unique_guid: Guid::derive(seed, "root"),
                first_lba: self.root_first_lba,
                last_lba: self.root_last_lba,
                attributes: 0,
                name: ROOT_PARTITION.to_string(),
            },
        ]
    }
}

/// Combine the partition table, boot partition and filesystem into one disk.
pub fn assemble(
    boot: &BootPartition,
    fs: FsImage,
    layout: &DiskLayout,
    seed: &[u8],
) -> Result<SegmentedSource> {
    if boot.size() != layout.boot_bytes() {
        return Err(ImageError::internal(format!(
            "boot partition is {} bytes but the layout reserves {}",
            boot.size(),
            layout.boot_bytes()
        )));
    }
    if fs.size > layout.root_bytes() {
        return Err(ImageError::internal(format!(
            "filesystem is {} bytes but the root partition holds {}",
            fs.size,
            layout.root_bytes()
        )));
    }

    let sectors = layout.disk_sectors();
    let partitions = layout.partitions(seed);
    let disk_guid = Guid::derive(seed, "disk");
    let primary = gpt::encode_primary(&partitions, sectors, disk_guid)?;
    let backup = gpt::encode_backup(&partitions, sectors, disk_guid)?;
    debug_assert_eq!(primary.len() as u64, PRIMARY_SECTORS * SECTOR_SIZE);

    let mut segments = vec![
        Segment::bytes(0, primary),
        Segment::bytes((sectors - BACKUP_SECTORS) * SECTOR_SIZE, backup),
    ];
    segments.extend(boot.segments(layout.boot_first_lba * SECTOR_SIZE));
    let root_base = layout.root_first_lba * SECTOR_SIZE;
    segments.extend(fs.segments.into_iter().map(|s| s.shifted(root_base)));
    SegmentedSource::new(layout.total_bytes, segments)
}
