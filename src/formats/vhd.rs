//! Virtual Hard Disk (VHD), fixed and dynamic.
//!
//! Fixed: the raw disk followed by a 512-byte footer.
//!
//! Dynamic:
//!
//! ```text
//! 0       footer copy
//! 512     dynamic header (1024 bytes)
//! 1536    block allocation table, one u32 sector offset per block
//! ...     blocks: 512-byte sector bitmap + 2 MiB of data, holes left out
//! end     footer
//! ```
//!
//! All integers are big endian.

use super::{
    allocated_units, check_range, read_file_at, read_mapped, read_unit, WriteOptions, WriteSeek,
};
use crate::codec::{align_up, be_u32, be_u64, put_be_u16, put_be_u32, put_be_u64};
use crate::error::{ImageError, Result};
use crate::logging::Progress;
use crate::segment::DiskSource;
use crate::source::{FileSource, ImageSource};
use std::fs::File;
use std::io;

pub const FOOTER_COOKIE: [u8; 8] = *b"conectix";
pub const DYNAMIC_COOKIE: [u8; 8] = *b"cxsparse";
pub const FOOTER_SIZE: u64 = 512;
const DYNAMIC_HEADER_SIZE: u64 = 1024;
const BAT_OFFSET: u64 = FOOTER_SIZE + DYNAMIC_HEADER_SIZE;
pub const BLOCK_SIZE: u64 = 2 * 1024 * 1024;
/// One bit per data sector, rounded to a whole sector.
const BITMAP_SIZE: u64 = 512;
const UNUSED: u32 = u32::MAX;

const VERSION: u32 = 0x0001_0000;
const FEATURES_RESERVED: u32 = 2;
const DISK_TYPE_FIXED: u32 = 2;
const DISK_TYPE_DYNAMIC: u32 = 3;
const CREATOR_APP: [u8; 4] = *b"vimg";
const CREATOR_HOST: [u8; 4] = *b"Wi2k";

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 00:00 UTC).
fn vhd_epoch() -> Result<i64> {
    let date = time::Date::from_calendar_date(2000, time::Month::January, 1)
        .map_err(|e| ImageError::internal(format!("VHD epoch: {e}")))?;
    Ok(date.midnight().assume_utc().unix_timestamp())
}

fn vhd_timestamp(unix: i64) -> Result<u32> {
    let secs = unix.saturating_sub(vhd_epoch()?).max(0);
    Ok(u32::try_from(secs).unwrap_or(u32::MAX))
}

/// Cylinder/head/sector geometry for `size` bytes.
pub fn chs_geometry(size: u64) -> (u16, u8, u8) {
    let total = (size / 512).min(65535 * 16 * 255);
    let (spt, heads, cyl_times_heads) = if total >= 65535 * 16 * 63 {
        (255, 16, total / 255)
    } else {
        let mut spt = 17;
        let mut cth = total / spt;
        let mut heads = cth.div_ceil(1024).max(4);
        if cth >= heads * 1024 || heads > 16 {
            spt = 31;
            heads = 16;
            cth = total / spt;
        }
        if cth >= heads * 1024 {
            spt = 63;
            heads = 16;
            cth = total / spt;
        }
        (spt, heads, cth)
    };
    ((cyl_times_heads / heads) as u16, heads as u8, spt as u8)
}

/// One's complement of the byte sum, computed with the checksum field zeroed.
fn checksum(buf: &[u8], field: usize) -> u32 {
    let sum = buf
        .iter()
        .enumerate()
        .filter(|(i, _)| !(field..field + 4).contains(i))
        .fold(0_u32, |acc, (_, b)| acc.wrapping_add(u32::from(*b)));
    !sum
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub data_offset: u64,
    pub timestamp: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub disk_type: u32,
    pub uuid: [u8; 16],
}

impl Footer {
    fn new(size: u64, disk_type: u32, opts: &WriteOptions) -> Result<Self> {
        Ok(Self {
            data_offset: if disk_type == DISK_TYPE_FIXED {
                u64::MAX
            } else {
                FOOTER_SIZE
            },
            timestamp: vhd_timestamp(opts.timestamp)?,
            original_size: size,
            current_size: size,
            disk_type,
            uuid: opts.uuid,
        })
    }

    pub fn encode(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut buf = [0_u8; FOOTER_SIZE as usize];
        buf[..8].copy_from_slice(&FOOTER_COOKIE);
        put_be_u32(&mut buf, 8, FEATURES_RESERVED);
        put_be_u32(&mut buf, 12, VERSION);
        put_be_u64(&mut buf, 16, self.data_offset);
        put_be_u32(&mut buf, 24, self.timestamp);
        buf[28..32].copy_from_slice(&CREATOR_APP);
        put_be_u32(&mut buf, 32, VERSION);
        buf[36..40].copy_from_slice(&CREATOR_HOST);
        put_be_u64(&mut buf, 40, self.original_size);
        put_be_u64(&mut buf, 48, self.current_size);
        let (cyl, heads, spt) = chs_geometry(self.current_size);
        put_be_u16(&mut buf, 56, cyl);
        buf[58] = heads;
        buf[59] = spt;
        put_be_u32(&mut buf, 60, self.disk_type);
        buf[68..84].copy_from_slice(&self.uuid);
        let sum = checksum(&buf, 64);
        put_be_u32(&mut buf, 64, sum);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE as usize || buf[..8] != FOOTER_COOKIE {
            return Err(ImageError::format("VHD footer cookie missing"));
        }
        let stored = be_u32(buf, 64)?;
        let computed = checksum(&buf[..FOOTER_SIZE as usize], 64);
        if stored != computed {
            return Err(ImageError::Checksum {
                what: "VHD footer",
                stored,
                computed,
            });
        }
        let mut uuid = [0_u8; 16];
        uuid.copy_from_slice(&buf[68..84]);
        Ok(Self {
            data_offset: be_u64(buf, 16)?,
            timestamp: be_u32(buf, 24)?,
            original_size: be_u64(buf, 40)?,
            current_size: be_u64(buf, 48)?,
            disk_type: be_u32(buf, 60)?,
            uuid,
        })
    }
}

pub fn write_fixed(
    source: &mut dyn DiskSource,
    sink: &mut dyn WriteSeek,
    opts: &WriteOptions,
    progress: &mut dyn Progress,
) -> Result<()> {
    let footer = Footer::new(source.size(), DISK_TYPE_FIXED, opts)?;
    super::raw::write(source, sink, progress)?;
    sink.write_all(&footer.encode())?;
    Ok(())
}

fn dynamic_header(max_entries: u32) -> [u8; DYNAMIC_HEADER_SIZE as usize] {
    let mut buf = [0_u8; DYNAMIC_HEADER_SIZE as usize];
    buf[..8].copy_from_slice(&DYNAMIC_COOKIE);
    put_be_u64(&mut buf, 8, u64::MAX);
    put_be_u64(&mut buf, 16, BAT_OFFSET);
    put_be_u32(&mut buf, 24, VERSION);
    put_be_u32(&mut buf, 28, max_entries);
    put_be_u32(&mut buf, 32, BLOCK_SIZE as u32);
    let sum = checksum(&buf, 36);
    put_be_u32(&mut buf, 36, sum);
    buf
}

pub fn write_dynamic(
    source: &mut dyn DiskSource,
    sink: &mut dyn WriteSeek,
    opts: &WriteOptions,
    progress: &mut dyn Progress,
) -> Result<()> {
    let size = source.size();
    let footer = Footer::new(size, DISK_TYPE_DYNAMIC, opts)?.encode();
    let blocks = size.div_ceil(BLOCK_SIZE);
    let max_entries = u32::try_from(blocks).map_err(|_| ImageError::SizeLimit {
        format: "vhd-dynamic",
        size,
        max: u64::from(u32::MAX) * BLOCK_SIZE,
    })?;

    // Pass 1: which blocks are stored, and where.
    let stored = allocated_units(&*source, BLOCK_SIZE);
    let bat_len = align_up(blocks * 4, 512);
    let first_block = BAT_OFFSET + bat_len;
    let stride = BITMAP_SIZE + BLOCK_SIZE;
    let mut bat = vec![0xFF_u8; bat_len as usize];
    for (slot, block) in stored.iter().enumerate() {
        let sector = (first_block + slot as u64 * stride) / 512;
        let sector = u32::try_from(sector).map_err(|_| ImageError::SizeLimit {
            format: "vhd-dynamic",
            size,
            max: u64::from(u32::MAX) * 512,
        })?;
        put_be_u32(&mut bat, (*block * 4) as usize, sector);
    }

    // Pass 2: stream it out.
    sink.write_all(&footer)?;
    sink.write_all(&dynamic_header(max_entries))?;
    sink.write_all(&bat)?;
    let bitmap = vec![0xFF_u8; BITMAP_SIZE as usize];
    let mut data = vec![0_u8; BLOCK_SIZE as usize];
    for block in &stored {
        read_unit(source, *block, &mut data)?;
        sink.write_all(&bitmap)?;
        sink.write_all(&data)?;
        progress.set((*block + 1) * BLOCK_SIZE);
    }
    sink.write_all(&footer)?;
    Ok(())
}

/// A fixed VHD reads as the raw disk in front of its footer.
pub fn open_fixed(mut file: File) -> Result<FileSource> {
    let len = file.metadata()?.len();
    if len < FOOTER_SIZE {
        return Err(ImageError::format("file is too short for a VHD footer"));
    }
    let mut buf = [0_u8; FOOTER_SIZE as usize];
    read_file_at(&mut file, len - FOOTER_SIZE, &mut buf)?;
    let footer = Footer::decode(&buf)?;
    if footer.disk_type != DISK_TYPE_FIXED {
        return Err(ImageError::format(format!(
            "VHD disk type {} is not fixed",
            footer.disk_type
        )));
    }
    if footer.current_size > len - FOOTER_SIZE {
        return Err(ImageError::format(
            "VHD footer claims more data than the file holds",
        ));
    }
    Ok(FileSource::with_len(file, footer.current_size))
}

#[derive(Debug)]
pub struct DynamicVhdReader {
    file: File,
    footer: Footer,
    bat: Vec<u32>,
    block_size: u64,
    bitmap_size: u64,
}

impl DynamicVhdReader {
    pub fn open(mut file: File) -> Result<Self> {
        let mut buf = [0_u8; FOOTER_SIZE as usize];
        read_file_at(&mut file, 0, &mut buf)?;
        let footer = Footer::decode(&buf)?;
        if footer.disk_type != DISK_TYPE_DYNAMIC {
            return Err(ImageError::Unsupported(format!(
                "VHD disk type {} (only fixed and dynamic disks are read)",
                footer.disk_type
            )));
        }

        let mut header = [0_u8; DYNAMIC_HEADER_SIZE as usize];
        read_file_at(&mut file, footer.data_offset, &mut header)?;
        if header[..8] != DYNAMIC_COOKIE {
            return Err(ImageError::format("VHD dynamic header cookie missing"));
        }
        let stored = be_u32(&header, 36)?;
        let computed = checksum(&header, 36);
        if stored != computed {
            return Err(ImageError::Checksum {
                what: "VHD dynamic header",
                stored,
                computed,
            });
        }
        let table_offset = be_u64(&header, 16)?;
        let entries = u64::from(be_u32(&header, 28)?);
        let block_size = u64::from(be_u32(&header, 32)?);
        if block_size == 0 || block_size % 512 != 0 {
            return Err(ImageError::format(format!("VHD block size {block_size}")));
        }
        if entries * block_size < footer.current_size {
            return Err(ImageError::format(
                "VHD block table does not cover the disk",
            ));
        }

        let mut raw = vec![0_u8; (entries * 4) as usize];
        read_file_at(&mut file, table_offset, &mut raw)?;
        let bat = raw
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let bitmap_size = align_up(block_size / 512 / 8, 512);
        Ok(Self {
            file,
            footer,
            bat,
            block_size,
            bitmap_size,
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }
}

impl ImageSource for DynamicVhdReader {
    fn len(&self) -> u64 {
        self.footer.current_size
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.len())?;
        let Self {
            file,
            bat,
            block_size,
            bitmap_size,
            ..
        } = self;
        read_mapped(offset, buf, *block_size, |index, within, out| {
            match bat.get(index as usize).copied() {
                None | Some(UNUSED) => {
                    out.fill(0);
                    Ok(())
                }
                Some(sector) => {
                    let at = u64::from(sector) * 512 + *bitmap_size + within;
                    read_file_at(file, at, out)
                }
            }
        })
    }
}
