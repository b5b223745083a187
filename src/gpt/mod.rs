//! GUID partition table codec.
//!
//! Layout written by [`encode_primary`] (34 sectors at the start of the disk):
//!
//! | LBA | Content |
//! |-----|---------|
//! | 0 | protective MBR |
//! | 1 | primary header |
//! | 2..34 | entry array (128 entries x 128 bytes) |
//!
//! [`encode_backup`] produces the mirror (33 sectors) that ends the disk: the
//! entry array followed by the backup header in the very last sector.

mod guid;

pub use guid::Guid;

use crate::codec::{ensure_slice, le_u32, le_u64, put_le_u16, put_le_u32, put_le_u64, read_fixed};
use crate::error::{ImageError, Result};
use crate::source::ImageSource;
use std::io::Write;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// First partition starts at this offset (1MB for GPT + alignment).
pub const FIRST_PARTITION_OFFSET_SECTORS: u64 = 2048;

pub const SIGNATURE: [u8; 8] = *b"EFI PART";
pub const REVISION: u32 = 0x0001_0000;
pub const HEADER_SIZE: u32 = 92;
pub const ENTRY_COUNT: u32 = 128;
pub const ENTRY_SIZE: u32 = 128;

/// Sectors taken by the entry array.
pub const ENTRY_ARRAY_SECTORS: u64 = (ENTRY_COUNT as u64 * ENTRY_SIZE as u64) / SECTOR_SIZE;
/// MBR + header + entry array.
pub const PRIMARY_SECTORS: u64 = 2 + ENTRY_ARRAY_SECTORS;
/// Entry array + header.
pub const BACKUP_SECTORS: u64 = 1 + ENTRY_ARRAY_SECTORS;

/// Attribute bit 2: legacy BIOS bootable.
pub const ATTR_LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;

/// Name of the kernel bundle partition.
pub const OS_PARTITION: &str = "vimg-os";
/// Name of the filesystem partition.
pub const ROOT_PARTITION: &str = "vimg-root";

const NAME_UNITS: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    /// Inclusive.
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn sectors(&self) -> u64 {
        self.last_lba + 1 - self.first_lba
    }

    pub fn byte_offset(&self) -> u64 {
        self.first_lba * SECTOR_SIZE
    }

    pub fn byte_len(&self) -> u64 {
        self.sectors() * SECTOR_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    fn primary(disk_sectors: u64, disk_guid: Guid, entries_crc32: u32) -> Self {
        Self {
            revision: REVISION,
            header_size: HEADER_SIZE,
            header_crc32: 0,
            current_lba: 1,
            backup_lba: disk_sectors - 1,
            first_usable_lba: PRIMARY_SECTORS,
            last_usable_lba: disk_sectors - BACKUP_SECTORS - 1,
            disk_guid,
            entries_lba: 2,
            entry_count: ENTRY_COUNT,
            entry_size: ENTRY_SIZE,
            entries_crc32,
        }
    }

    fn backup(&self) -> Self {
        Self {
            current_lba: self.backup_lba,
            backup_lba: self.current_lba,
            entries_lba: self.backup_lba - ENTRY_ARRAY_SECTORS,
            ..self.clone()
        }
    }

    /// Serialize into a full sector with the header CRC filled in.
    pub fn encode(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0_u8; SECTOR_SIZE as usize];
        buf[0..8].copy_from_slice(&SIGNATURE);
        put_le_u32(&mut buf, 8, self.revision);
        put_le_u32(&mut buf, 12, self.header_size);
        put_le_u64(&mut buf, 24, self.current_lba);
        put_le_u64(&mut buf, 32, self.backup_lba);
        put_le_u64(&mut buf, 40, self.first_usable_lba);
        put_le_u64(&mut buf, 48, self.last_usable_lba);
        buf[56..72].copy_from_slice(&self.disk_guid.0);
        put_le_u64(&mut buf, 72, self.entries_lba);
        put_le_u32(&mut buf, 80, self.entry_count);
        put_le_u32(&mut buf, 84, self.entry_size);
        put_le_u32(&mut buf, 88, self.entries_crc32);
        let crc = crc32fast::hash(&buf[..HEADER_SIZE as usize]);
        put_le_u32(&mut buf, 16, crc);
        buf
    }

    /// Parse and validate a header read from `lba`.
    pub fn decode(buf: &[u8], lba: u64) -> Result<Self> {
        let signature: [u8; 8] = read_fixed(buf, 0)?;
        if signature != SIGNATURE {
            return Err(ImageError::format(format!(
                "no GPT signature at LBA {lba}"
            )));
        }
        let header_size = le_u32(buf, 12)?;
        if !(HEADER_SIZE..=SECTOR_SIZE as u32).contains(&header_size) {
            return Err(ImageError::format(format!(
                "GPT header size {header_size} is out of range"
            )));
        }

        let stored = le_u32(buf, 16)?;
        let mut scratch = ensure_slice(buf, 0, header_size as usize)?.to_vec();
        scratch[16..20].fill(0);
        let computed = crc32fast::hash(&scratch);
        if stored != computed {
            return Err(ImageError::Checksum {
                what: "GPT header",
                stored,
                computed,
            });
        }

        let header = Self {
            revision: le_u32(buf, 8)?,
            header_size,
            header_crc32: stored,
            current_lba: le_u64(buf, 24)?,
            backup_lba: le_u64(buf, 32)?,
            first_usable_lba: le_u64(buf, 40)?,
            last_usable_lba: le_u64(buf, 48)?,
            disk_guid: Guid(read_fixed(buf, 56)?),
            entries_lba: le_u64(buf, 72)?,
            entry_count: le_u32(buf, 80)?,
            entry_size: le_u32(buf, 84)?,
            entries_crc32: le_u32(buf, 88)?,
        };
        if header.current_lba != lba {
            return Err(ImageError::format(format!(
                "GPT header at LBA {lba} claims to live at LBA {}",
                header.current_lba
            )));
        }
        if header.entry_size < ENTRY_SIZE || header.entry_size % 8 != 0 {
            return Err(ImageError::format(format!(
                "GPT entry size {} is invalid",
                header.entry_size
            )));
        }
        if header.entry_count == 0 || header.entry_count > 4096 {
            return Err(ImageError::format(format!(
                "GPT entry count {} is invalid",
                header.entry_count
            )));
        }
        Ok(header)
    }

    pub fn entry_array_bytes(&self) -> u64 {
        u64::from(self.entry_count) * u64::from(self.entry_size)
    }
}

fn check_layout(partitions: &[GptEntry], disk_sectors: u64) -> Result<()> {
    if disk_sectors < PRIMARY_SECTORS + BACKUP_SECTORS + 1 {
        return Err(ImageError::InvalidConfig(format!(
            "a {disk_sectors} sector disk cannot hold a partition table"
        )));
    }
    if partitions.len() > ENTRY_COUNT as usize {
        return Err(ImageError::InvalidConfig(format!(
            "{} partitions exceed the {ENTRY_COUNT} entry table",
            partitions.len()
        )));
    }
    let last_usable = disk_sectors - BACKUP_SECTORS - 1;

    let mut ranges: Vec<(u64, u64, &str)> = partitions
        .iter()
        .map(|p| (p.first_lba, p.last_lba, p.name.as_str()))
        .collect();
    ranges.sort_unstable();
    let mut prev_last: Option<u64> = None;
    for (first, last, name) in ranges {
        if first > last || first < PRIMARY_SECTORS || last > last_usable {
            return Err(ImageError::InvalidConfig(format!(
                "partition '{name}' ({first}..={last}) is outside usable LBAs {PRIMARY_SECTORS}..={last_usable}"
            )));
        }
        if prev_last.is_some_and(|prev| first <= prev) {
            return Err(ImageError::InvalidConfig(format!(
                "partition '{name}' overlaps its predecessor"
            )));
        }
        prev_last = Some(last);
    }
    Ok(())
}

fn encode_entries(partitions: &[GptEntry]) -> Result<Vec<u8>> {
    let mut array = vec![0_u8; (ENTRY_ARRAY_SECTORS * SECTOR_SIZE) as usize];
    for (i, part) in partitions.iter().enumerate() {
        let entry = &mut array[i * ENTRY_SIZE as usize..(i + 1) * ENTRY_SIZE as usize];
        entry[0..16].copy_from_slice(&part.type_guid.0);
        entry[16..32].copy_from_slice(&part.unique_guid.0);
        put_le_u64(entry, 32, part.first_lba);
        put_le_u64(entry, 40, part.last_lba);
        put_le_u64(entry, 48, part.attributes);

        let units: Vec<u16> = part.name.encode_utf16().collect();
        if units.len() > NAME_UNITS {
            return Err(ImageError::InvalidConfig(format!(
                "partition name '{}' is longer than {NAME_UNITS} UTF-16 units",
                part.name
            )));
        }
        for (j, unit) in units.iter().enumerate() {
            put_le_u16(entry, 56 + j * 2, *unit);
        }
    }
    Ok(array)
}

/// Protective MBR: one 0xEE partition covering the disk (capped at 32 bits).
pub fn protective_mbr(disk_sectors: u64) -> [u8; SECTOR_SIZE as usize] {
    let mut mbr = [0_u8; SECTOR_SIZE as usize];
    let entry = &mut mbr[446..462];
    entry[1] = 0x00;
    entry[2] = 0x02;
    entry[3] = 0x00;
    entry[4] = 0xEE;
    entry[5] = 0xFF;
    entry[6] = 0xFF;
    entry[7] = 0xFF;
    put_le_u32(entry, 8, 1);
    let size = (disk_sectors - 1).min(u64::from(u32::MAX)) as u32;
    put_le_u32(entry, 12, size);
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

/// Protective MBR, primary header and entry array.
pub fn encode_primary(
    partitions: &[GptEntry],
    disk_sectors: u64,
    disk_guid: Guid,
) -> Result<Vec<u8>> {
    check_layout(partitions, disk_sectors)?;
    let entries = encode_entries(partitions)?;
    let header = GptHeader::primary(disk_sectors, disk_guid, crc32fast::hash(&entries));

    let mut out = Vec::with_capacity((PRIMARY_SECTORS * SECTOR_SIZE) as usize);
    out.extend_from_slice(&protective_mbr(disk_sectors));
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&entries);
    Ok(out)
}

/// Backup entry array and backup header, to be placed at
/// `(disk_sectors - BACKUP_SECTORS) * SECTOR_SIZE`.
pub fn encode_backup(
    partitions: &[GptEntry],
    disk_sectors: u64,
    disk_guid: Guid,
) -> Result<Vec<u8>> {
    check_layout(partitions, disk_sectors)?;
    let entries = encode_entries(partitions)?;
    let header = GptHeader::primary(disk_sectors, disk_guid, crc32fast::hash(&entries)).backup();

    let mut out = Vec::with_capacity((BACKUP_SECTORS * SECTOR_SIZE) as usize);
    out.extend_from_slice(&entries);
    out.extend_from_slice(&header.encode());
    Ok(out)
}

/// Write the primary structures to the start of a sink.
pub fn write_gpt<W: Write>(
    writer: &mut W,
    partitions: &[GptEntry],
    disk_sectors: u64,
    disk_guid: Guid,
) -> Result<()> {
    let primary = encode_primary(partitions, disk_sectors, disk_guid)?;
    writer.write_all(&primary)?;
    Ok(())
}

fn read_sector(source: &mut dyn ImageSource, lba: u64) -> Result<[u8; SECTOR_SIZE as usize]> {
    let mut buf = [0_u8; SECTOR_SIZE as usize];
    let offset = lba
        .checked_mul(SECTOR_SIZE)
        .filter(|off| off + SECTOR_SIZE <= source.len())
        .ok_or_else(|| ImageError::format(format!("LBA {lba} is beyond the end of the disk")))?;
    source.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

fn check_against_disk(header: &GptHeader, disk_sectors: u64) -> Result<()> {
    let array_sectors = header.entry_array_bytes().div_ceil(SECTOR_SIZE);
    let array_end = header.entries_lba.saturating_add(array_sectors);
    if array_end > disk_sectors || header.last_usable_lba >= disk_sectors {
        return Err(ImageError::format(format!(
            "GPT header describes structures beyond the {disk_sectors} sector disk"
        )));
    }
    Ok(())
}

/// The primary header at LBA 1.
pub fn read_header(source: &mut dyn ImageSource) -> Result<GptHeader> {
    let disk_sectors = source.len() / SECTOR_SIZE;
    if disk_sectors < 2 {
        return Err(ImageError::format("disk is too small for a partition table"));
    }
    let buf = read_sector(source, 1)?;
    let header = GptHeader::decode(&buf, 1)?;
    check_against_disk(&header, disk_sectors)?;
    Ok(header)
}

/// The backup header in the last sector of the disk.
pub fn read_backup_header(source: &mut dyn ImageSource) -> Result<GptHeader> {
    let disk_sectors = source.len() / SECTOR_SIZE;
    if disk_sectors < 2 {
        return Err(ImageError::format("disk is too small for a partition table"));
    }
    let lba = disk_sectors - 1;
    let buf = read_sector(source, lba)?;
    let header = GptHeader::decode(&buf, lba)?;
    check_against_disk(&header, disk_sectors)?;
    Ok(header)
}

/// Read and CRC-check the entry array `header` points at. Unused slots are dropped.
pub fn read_entries(source: &mut dyn ImageSource, header: &GptHeader) -> Result<Vec<GptEntry>> {
    let len = crate::codec::to_usize(header.entry_array_bytes(), "GPT entry array size")?;
    let mut array = vec![0_u8; len];
    source.read_exact_at(header.entries_lba * SECTOR_SIZE, &mut array)?;

    let computed = crc32fast::hash(&array);
    if computed != header.entries_crc32 {
        return Err(ImageError::Checksum {
            what: "GPT entry array",
            stored: header.entries_crc32,
            computed,
        });
    }

    let mut entries = Vec::new();
    for raw in array.chunks_exact(header.entry_size as usize) {
        let type_guid = Guid(read_fixed(raw, 0)?);
        if type_guid.is_nil() {
            continue;
        }
        let first_lba = le_u64(raw, 32)?;
        let last_lba = le_u64(raw, 40)?;
        if last_lba < first_lba {
            return Err(ImageError::format(format!(
                "GPT entry ends (LBA {last_lba}) before it starts (LBA {first_lba})"
            )));
        }
        let units: Vec<u16> = raw[56..56 + NAME_UNITS * 2]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|unit| *unit != 0)
            .collect();
        entries.push(GptEntry {
            type_guid,
            unique_guid: Guid(read_fixed(raw, 16)?),
            first_lba,
            last_lba,
            attributes: le_u64(raw, 48)?,
            name: String::from_utf16_lossy(&units),
        });
    }
    Ok(entries)
}

pub fn find_entry<'a>(entries: &'a [GptEntry], name: &str) -> Option<&'a GptEntry> {
    entries.iter().find(|entry| entry.name == name)
}
