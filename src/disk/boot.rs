//! Boot partition: a flat directory of kernel files.
//!
//! ```text
//! 0     magic "VIMGBOOT"
//! 8     version (u32 le)
//! 12    file count (u32 le)
//! 16    records, 64 bytes each:
//!         0   name, NUL padded (48 bytes)
//!         48  byte offset from the partition start (u64 le)
//!         56  byte length (u64 le)
//! 4096  file data, each file starting on a sector boundary
//! ```

use crate::codec::{align_up, le_u32, le_u64, put_le_u32, put_le_u64, trim_nul_padded};
use crate::error::{ImageError, Result};
use crate::gpt::SECTOR_SIZE;
use crate::segment::Segment;
use crate::source::ImageSource;
use crate::tree::Content;
use std::collections::BTreeSet;

pub const BOOT_MAGIC: [u8; 8] = *b"VIMGBOOT";
pub const BOOT_VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 4096;
const RECORDS_OFFSET: usize = 16;
const RECORD_SIZE: usize = 64;
pub const MAX_NAME_LEN: usize = 48;
pub const MAX_FILES: usize = (HEADER_SIZE as usize - RECORDS_OFFSET) / RECORD_SIZE;
/// Free space left after the last file.
pub const SLACK: u64 = 1024 * 1024;
/// The partition is sized in whole units of this.
pub const SIZE_ALIGN: u64 = 1024 * 1024;
/// Name of the serialized VM configuration inside the partition.
pub const CONFIG_FILE: &str = "config.json";

/// A file to place in the boot partition.
#[derive(Debug, Clone)]
pub struct BootFile {
    pub name: String,
    pub content: Content,
    pub size: u64,
}

impl BootFile {
    pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            content: Content::bytes(data),
        }
    }
}

/// One record of the boot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub name: String,
    /// From the start of the partition.
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct BootPartition {
    files: Vec<(BootEntry, Content)>,
    size: u64,
}

impl BootPartition {
    pub fn new(files: Vec<BootFile>) -> Result<Self> {
        if files.len() > MAX_FILES {
            return Err(ImageError::InvalidConfig(format!(
                "boot partition holds at most {MAX_FILES} files, got {}",
                files.len()
            )));
        }
        let mut seen = BTreeSet::new();
        let mut offset = HEADER_SIZE;
        let mut laid_out = Vec::with_capacity(files.len());
        for file in files {
            if file.name.is_empty() || file.name.len() > MAX_NAME_LEN || file.name.contains('\0') {
                return Err(ImageError::InvalidConfig(format!(
                    "boot file name '{}' must be 1 to {MAX_NAME_LEN} bytes",
                    file.name
                )));
            }
            if !seen.insert(file.name.clone()) {
                return Err(ImageError::InvalidConfig(format!(
                    "boot file '{}' is listed twice",
                    file.name
                )));
            }
            let entry = BootEntry {
                name: file.name,
                offset,
                size: file.size,
            };
            offset = align_up(offset + file.size, SECTOR_SIZE);
            laid_out.push((entry, file.content));
        }
        Ok(Self {
            files: laid_out,
            size: align_up(offset + SLACK, SIZE_ALIGN),
        })
    }

    /// Partition size in bytes; always whole sectors.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entries(&self) -> impl Iterator<Item = &BootEntry> {
        self.files.iter().map(|(entry, _)| entry)
    }

    fn header(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; HEADER_SIZE as usize];
        buf[..8].copy_from_slice(&BOOT_MAGIC);
        put_le_u32(&mut buf, 8, BOOT_VERSION);
        put_le_u32(&mut buf, 12, self.files.len() as u32);
        for (i, (entry, _)) in self.files.iter().enumerate() {
            let at = RECORDS_OFFSET + i * RECORD_SIZE;
            buf[at..at + entry.name.len()].copy_from_slice(entry.name.as_bytes());
            put_le_u64(&mut buf, at + MAX_NAME_LEN, entry.offset);
            put_le_u64(&mut buf, at + MAX_NAME_LEN + 8, entry.size);
        }
        buf
    }

    /// The partition's segments, placed at disk byte `base`.
    pub fn segments(&self, base: u64) -> Vec<Segment> {
        let mut segments = vec![Segment::bytes(base, self.header())];
        for (entry, content) in &self.files {
            segments.push(Segment::content(
                base + entry.offset,
                entry.size,
                content.clone(),
                0,
            ));
        }
        segments
    }
}

/// Parse the directory of a boot partition. `source` is the partition itself.
pub fn read_directory(source: &mut dyn ImageSource) -> Result<Vec<BootEntry>> {
    if source.len() < HEADER_SIZE {
        return Err(ImageError::format("boot partition is smaller than its header"));
    }
    let mut buf = vec![0_u8; HEADER_SIZE as usize];
    source.read_exact_at(0, &mut buf)?;
    if buf[..8] != BOOT_MAGIC {
        return Err(ImageError::format("boot partition magic missing"));
    }
    let version = le_u32(&buf, 8)?;
    if version != BOOT_VERSION {
        return Err(ImageError::format(format!(
            "unsupported boot partition version {version}"
        )));
    }
    let count = le_u32(&buf, 12)? as usize;
    if count > MAX_FILES {
        return Err(ImageError::format(format!(
            "boot directory claims {count} files"
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = RECORDS_OFFSET + i * RECORD_SIZE;
        let name = trim_nul_padded(&buf[at..at + MAX_NAME_LEN]);
        let offset = le_u64(&buf, at + MAX_NAME_LEN)?;
        let size = le_u64(&buf, at + MAX_NAME_LEN + 8)?;
        let in_bounds = offset >= HEADER_SIZE
            && offset
                .checked_add(size)
                .is_some_and(|end| end <= source.len());
        if name.is_empty() || !in_bounds {
            return Err(ImageError::format(format!(
                "boot directory record {i} ('{name}') is out of bounds"
            )));
        }
        entries.push(BootEntry { name, offset, size });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentedSource;

    fn partition() -> BootPartition {
        BootPartition::new(vec![
            BootFile::bytes("vmlinuz", vec![0xAB; 1000]),
            BootFile::bytes(CONFIG_FILE, b"{}".to_vec()),
        ])
        .unwrap()
    }

    #[test]
    fn files_are_sector_aligned() {
        let boot = partition();
        let entries: Vec<_> = boot.entries().cloned().collect();
        assert_eq!(entries[0].offset, 4096);
        assert_eq!(entries[1].offset, 4096 + 1024);
        assert_eq!(boot.size(), 2 * 1024 * 1024);
    }

    #[test]
    fn directory_reads_back() {
        let boot = partition();
        let mut disk = SegmentedSource::new(boot.size(), boot.segments(0)).unwrap();
        let entries = read_directory(&mut disk).unwrap();
        assert_eq!(entries, boot.entries().cloned().collect::<Vec<_>>());

        let mut data = vec![0_u8; 2];
        disk.read_exact_at(entries[1].offset, &mut data).unwrap();
        assert_eq!(&data, b"{}");
    }

    #[test]
    fn bad_magic_is_format_error() {
        let mut blank = vec![0_u8; 8192];
        assert!(matches!(
            read_directory(&mut blank),
            Err(ImageError::Format(_))
        ));
    }

    #[test]
    fn rejects_duplicate_and_long_names() {
        let dup = BootPartition::new(vec![
            BootFile::bytes("a", vec![1]),
            BootFile::bytes("a", vec![2]),
        ]);
        assert!(matches!(dup, Err(ImageError::InvalidConfig(_))));

        let long = BootPartition::new(vec![BootFile::bytes("x".repeat(49), vec![1])]);
        assert!(matches!(long, Err(ImageError::InvalidConfig(_))));
    }
}
