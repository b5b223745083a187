//! VMware hosted sparse extents: monolithic sparse (version 1) and
//! stream-optimized (version 3).
//!
//! Monolithic sparse, in sectors:
//!
//! ```text
//! 0           header
//! 1..21       text descriptor
//! 21..        grain directory, then every grain table
//! overhead..  grains (64 KiB, uncompressed), holes left out
//! ```
//!
//! Stream-optimized puts the tables after the data so the file can be written
//! front to back: header (grain directory "at end"), descriptor, then
//! marker-prefixed deflated grains, grain tables, the grain directory, a
//! footer copy of the header and an end-of-stream marker.

use super::{
    allocated_units, check_range, read_file_at, read_mapped, read_unit, WriteOptions, WriteSeek,
};
use crate::codec::{align_up, le_u16, le_u32, le_u64, put_le_u16, put_le_u32, put_le_u64};
use crate::error::{ImageError, Result};
use crate::formats::ImageFormat;
use crate::logging::Progress;
use crate::segment::DiskSource;
use crate::source::ImageSource;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, Read, Write};

pub const MAGIC: [u8; 4] = *b"KDMV";
pub const GRAIN_SIZE: u64 = 64 * 1024;
const SECTOR: u64 = 512;
const GRAIN_SECTORS: u64 = GRAIN_SIZE / SECTOR;
const GTES_PER_GT: u64 = 512;
const GT_SECTORS: u64 = GTES_PER_GT * 4 / SECTOR;
const DESCRIPTOR_OFFSET: u64 = 1;
const DESCRIPTOR_SECTORS: u64 = 20;
const GD_AT_END: u64 = u64::MAX;

const FLAG_NEWLINE_TEST: u32 = 1;
const FLAG_COMPRESSED: u32 = 1 << 16;
const FLAG_MARKERS: u32 = 1 << 17;
const COMPRESS_DEFLATE: u16 = 1;

const MARKER_EOS: u32 = 0;
const MARKER_GT: u32 = 1;
const MARKER_GD: u32 = 2;
const MARKER_FOOTER: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub version: u32,
    pub flags: u32,
    /// Sectors.
    pub capacity: u64,
    /// Sectors.
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub gtes_per_gt: u32,
    pub gd_offset: u64,
    pub overhead: u64,
    pub compress: u16,
}

impl SparseHeader {
    pub fn encode(&self) -> [u8; SECTOR as usize] {
        let mut buf = [0_u8; SECTOR as usize];
        buf[..4].copy_from_slice(&MAGIC);
        put_le_u32(&mut buf, 4, self.version);
        put_le_u32(&mut buf, 8, self.flags);
        put_le_u64(&mut buf, 12, self.capacity);
        put_le_u64(&mut buf, 20, self.grain_size);
        put_le_u64(&mut buf, 28, self.descriptor_offset);
        put_le_u64(&mut buf, 36, self.descriptor_size);
        put_le_u32(&mut buf, 44, self.gtes_per_gt);
        put_le_u64(&mut buf, 48, 0);
        put_le_u64(&mut buf, 56, self.gd_offset);
        put_le_u64(&mut buf, 64, self.overhead);
        buf[72] = 0;
        buf[73] = b'\n';
        buf[74] = b' ';
        buf[75] = b'\r';
        buf[76] = b'\n';
        put_le_u16(&mut buf, 77, self.compress);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR as usize || buf[..4] != MAGIC {
            return Err(ImageError::format("VMDK sparse header magic missing"));
        }
        let header = Self {
            version: le_u32(buf, 4)?,
            flags: le_u32(buf, 8)?,
            capacity: le_u64(buf, 12)?,
            grain_size: le_u64(buf, 20)?,
            descriptor_offset: le_u64(buf, 28)?,
            descriptor_size: le_u64(buf, 36)?,
            gtes_per_gt: le_u32(buf, 44)?,
            gd_offset: le_u64(buf, 56)?,
            overhead: le_u64(buf, 64)?,
            compress: le_u16(buf, 77)?,
        };
        if !(1..=3).contains(&header.version) {
            return Err(ImageError::Unsupported(format!(
                "VMDK sparse version {}",
                header.version
            )));
        }
        if header.grain_size == 0 || header.gtes_per_gt == 0 {
            return Err(ImageError::format("VMDK grain geometry is zero"));
        }
        Ok(header)
    }

    fn grains(&self) -> u64 {
        self.capacity.div_ceil(self.grain_size)
    }

    fn tables(&self) -> u64 {
        self.grains().div_ceil(u64::from(self.gtes_per_gt))
    }

    fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

fn descriptor(opts: &WriteOptions, capacity: u64, create_type: &str) -> Result<Vec<u8>> {
    let cid = u32::from_le_bytes([opts.uuid[0], opts.uuid[1], opts.uuid[2], opts.uuid[3]]);
    let cylinders = (capacity / (16 * 63)).min(16383);
    let text = format!(
        "# Disk DescriptorFile\n\
         version=1\n\
         CID={cid:08x}\n\
         parentCID=ffffffff\n\
         createType=\"{create_type}\"\n\
         \n\
         # Extent description\n\
         RW {capacity} SPARSE \"{name}.vmdk\"\n\
         \n\
         # The Disk Data Base\n\
         #DDB\n\
         \n\
         ddb.virtualHWVersion = \"4\"\n\
         ddb.geometry.cylinders = \"{cylinders}\"\n\
         ddb.geometry.heads = \"16\"\n\
         ddb.geometry.sectors = \"63\"\n\
         ddb.adapterType = \"ide\"\n",
        name = opts.name,
    );
    let mut bytes = text.into_bytes();
    let limit = (DESCRIPTOR_SECTORS * SECTOR) as usize;
    if bytes.len() > limit {
        return Err(ImageError::InvalidConfig(format!(
            "VMDK descriptor is {} bytes, more than the {limit} reserved",
            bytes.len()
        )));
    }
    bytes.resize(limit, 0);
    Ok(bytes)
}

fn capacity_sectors(size: u64) -> u64 {
    size.div_ceil(SECTOR)
}

fn pad_to_sector(sink: &mut dyn WriteSeek, written: u64) -> Result<u64> {
    let padded = align_up(written, SECTOR);
    if padded > written {
        sink.write_all(&vec![0_u8; (padded - written) as usize])?;
    }
    Ok(padded / SECTOR)
}

fn sector_u32(sector: u64, size: u64) -> Result<u32> {
    u32::try_from(sector).map_err(|_| ImageError::SizeLimit {
        format: "vmdk",
        size,
        max: u64::from(u32::MAX) * SECTOR,
    })
}

pub fn write_sparse(
    source: &mut dyn DiskSource,
    sink: &mut dyn WriteSeek,
    opts: &WriteOptions,
    progress: &mut dyn Progress,
) -> Result<()> {
    let size = source.size();
    let capacity = capacity_sectors(size);
    let grains = capacity.div_ceil(GRAIN_SECTORS);
    let tables = grains.div_ceil(GTES_PER_GT);
    let gd_offset = DESCRIPTOR_OFFSET + DESCRIPTOR_SECTORS;
    let gd_sectors = (tables * 4).div_ceil(SECTOR);
    let gt_offset = gd_offset + gd_sectors;
    let overhead = align_up(gt_offset + tables * GT_SECTORS, GRAIN_SECTORS);

    // Pass 1: grain placement.
    let stored = allocated_units(&*source, GRAIN_SIZE);
    let mut gd = vec![0_u8; (gd_sectors * SECTOR) as usize];
    for table in 0..tables {
        put_le_u32(&mut gd, (table * 4) as usize, sector_u32(gt_offset + table * GT_SECTORS, size)?);
    }
    let mut gts = vec![0_u8; (tables * GT_SECTORS * SECTOR) as usize];
    for (slot, grain) in stored.iter().enumerate() {
        let sector = overhead + slot as u64 * GRAIN_SECTORS;
        put_le_u32(&mut gts, (grain * 4) as usize, sector_u32(sector, size)?);
    }

    // Pass 2.
    let header = SparseHeader {
        version: 1,
        flags: FLAG_NEWLINE_TEST,
        capacity,
        grain_size: GRAIN_SECTORS,
        descriptor_offset: DESCRIPTOR_OFFSET,
        descriptor_size: DESCRIPTOR_SECTORS,
        gtes_per_gt: GTES_PER_GT as u32,
        gd_offset,
        overhead,
        compress: 0,
    };
    sink.write_all(&header.encode())?;
    sink.write_all(&descriptor(opts, capacity, "monolithicSparse")?)?;
    sink.write_all(&gd)?;
    sink.write_all(&gts)?;
    let written = (gt_offset + tables * GT_SECTORS) * SECTOR;
    sink.write_all(&vec![0_u8; (overhead * SECTOR - written) as usize])?;

    let mut grain = vec![0_u8; GRAIN_SIZE as usize];
    for index in &stored {
        read_unit(source, *index, &mut grain)?;
        sink.write_all(&grain)?;
        progress.set((index + 1) * GRAIN_SIZE);
    }
    Ok(())
}

fn marker(value: u64, kind: u32) -> [u8; SECTOR as usize] {
    let mut buf = [0_u8; SECTOR as usize];
    put_le_u64(&mut buf, 0, value);
    put_le_u32(&mut buf, 12, kind);
    buf
}

pub fn write_stream(
    source: &mut dyn DiskSource,
    sink: &mut dyn WriteSeek,
    opts: &WriteOptions,
    progress: &mut dyn Progress,
) -> Result<()> {
    let size = source.size();
    let capacity = capacity_sectors(size);
    let grains = capacity.div_ceil(GRAIN_SECTORS);
    let tables = grains.div_ceil(GTES_PER_GT);
    let gd_sectors = (tables * 4).div_ceil(SECTOR);
    let overhead = align_up(DESCRIPTOR_OFFSET + DESCRIPTOR_SECTORS, GRAIN_SECTORS);

    // Pass 1: only the grain set is known up front; positions follow from
    // the compressed sizes as the stream is written.
    let stored = allocated_units(&*source, GRAIN_SIZE);

    let mut header = SparseHeader {
        version: 3,
        flags: FLAG_NEWLINE_TEST | FLAG_COMPRESSED | FLAG_MARKERS,
        capacity,
        grain_size: GRAIN_SECTORS,
        descriptor_offset: DESCRIPTOR_OFFSET,
        descriptor_size: DESCRIPTOR_SECTORS,
        gtes_per_gt: GTES_PER_GT as u32,
        gd_offset: GD_AT_END,
        overhead,
        compress: COMPRESS_DEFLATE,
    };
    sink.write_all(&header.encode())?;
    sink.write_all(&descriptor(opts, capacity, "streamOptimized")?)?;
    let written = (DESCRIPTOR_OFFSET + DESCRIPTOR_SECTORS) * SECTOR;
    sink.write_all(&vec![0_u8; (overhead * SECTOR - written) as usize])?;
    let mut cursor = overhead;

    let mut gt_entries = vec![0_u32; (tables * GTES_PER_GT) as usize];
    let mut grain = vec![0_u8; GRAIN_SIZE as usize];
    for index in &stored {
        read_unit(source, *index, &mut grain)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&grain)?;
        let compressed = encoder.finish()?;

        gt_entries[*index as usize] = sector_u32(cursor, size)?;
        let mut head = [0_u8; 12];
        put_le_u64(&mut head, 0, index * GRAIN_SECTORS);
        put_le_u32(&mut head, 8, compressed.len() as u32);
        sink.write_all(&head)?;
        sink.write_all(&compressed)?;
        cursor += pad_to_sector(sink, 12 + compressed.len() as u64)?;
        progress.set((index + 1) * GRAIN_SIZE);
    }

    let mut gd = vec![0_u8; (gd_sectors * SECTOR) as usize];
    for (table, entries) in gt_entries.chunks(GTES_PER_GT as usize).enumerate() {
        if entries.iter().all(|e| *e == 0) {
            continue;
        }
        sink.write_all(&marker(GT_SECTORS, MARKER_GT))?;
        cursor += 1;
        put_le_u32(&mut gd, table * 4, sector_u32(cursor, size)?);
        let mut gt = vec![0_u8; (GT_SECTORS * SECTOR) as usize];
        for (i, entry) in entries.iter().enumerate() {
            put_le_u32(&mut gt, i * 4, *entry);
        }
        sink.write_all(&gt)?;
        cursor += GT_SECTORS;
    }

    sink.write_all(&marker(gd_sectors, MARKER_GD))?;
    cursor += 1;
    header.gd_offset = cursor;
    sink.write_all(&gd)?;

    sink.write_all(&marker(1, MARKER_FOOTER))?;
    sink.write_all(&header.encode())?;
    sink.write_all(&marker(0, MARKER_EOS))?;
    Ok(())
}

/// Tell monolithic sparse from stream-optimized by the header flags.
pub fn detect_flavor(file: &mut File) -> Result<ImageFormat> {
    let mut buf = [0_u8; SECTOR as usize];
    read_file_at(file, 0, &mut buf)?;
    let header = SparseHeader::decode(&buf)?;
    Ok(if header.compressed() {
        ImageFormat::StreamOptimizedVmdk
    } else {
        ImageFormat::Vmdk
    })
}

#[derive(Debug)]
pub struct VmdkReader {
    file: File,
    header: SparseHeader,
    /// Sector of each grain, flattened across grain tables. 0 is a hole.
    grain_table: Vec<u32>,
    cached: Option<(u64, Vec<u8>)>,
}

impl VmdkReader {
    pub fn open(mut file: File) -> Result<Self> {
        let mut buf = [0_u8; SECTOR as usize];
        read_file_at(&mut file, 0, &mut buf)?;
        let mut header = SparseHeader::decode(&buf)?;
        if header.gd_offset == GD_AT_END {
            // Footer: second-to-last sector, before the end-of-stream marker.
            let len = file.metadata()?.len();
            if len < 3 * SECTOR {
                return Err(ImageError::format("stream VMDK is missing its footer"));
            }
            read_file_at(&mut file, len - 2 * SECTOR, &mut buf)?;
            header = SparseHeader::decode(&buf)?;
            if header.gd_offset == GD_AT_END {
                return Err(ImageError::format("VMDK footer has no grain directory"));
            }
        }
        if header.compressed() && header.compress != COMPRESS_DEFLATE {
            return Err(ImageError::Unsupported(format!(
                "VMDK compression algorithm {}",
                header.compress
            )));
        }

        let tables = header.tables();
        let per_gt = u64::from(header.gtes_per_gt);
        let mut gd = vec![0_u8; (tables * 4) as usize];
        read_file_at(&mut file, header.gd_offset * SECTOR, &mut gd)?;
        let mut grain_table = vec![0_u32; (tables * per_gt) as usize];
        let mut gt = vec![0_u8; (per_gt * 4) as usize];
        for table in 0..tables as usize {
            let at = le_u32(&gd, table * 4)?;
            if at == 0 {
                continue;
            }
            read_file_at(&mut file, u64::from(at) * SECTOR, &mut gt)?;
            for i in 0..per_gt as usize {
                grain_table[table * per_gt as usize + i] = le_u32(&gt, i * 4)?;
            }
        }
        grain_table.truncate(header.grains() as usize);

        Ok(Self {
            file,
            header,
            grain_table,
            cached: None,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    fn grain_bytes(&self) -> u64 {
        self.header.grain_size * SECTOR
    }

    fn inflate(&mut self, index: u64, sector: u32) -> io::Result<()> {
        if matches!(&self.cached, Some((cached, _)) if *cached == index) {
            return Ok(());
        }
        let at = u64::from(sector) * SECTOR;
        let mut head = [0_u8; 12];
        read_file_at(&mut self.file, at, &mut head)?;
        let len = u32::from_le_bytes([head[8], head[9], head[10], head[11]]) as usize;
        let mut compressed = vec![0_u8; len];
        read_file_at(&mut self.file, at + 12, &mut compressed)?;

        let grain_bytes = self.grain_bytes() as usize;
        let mut data = Vec::with_capacity(grain_bytes);
        ZlibDecoder::new(compressed.as_slice())
            .take(grain_bytes as u64)
            .read_to_end(&mut data)?;
        data.resize(grain_bytes, 0);
        self.cached = Some((index, data));
        Ok(())
    }
}

impl ImageSource for VmdkReader {
    fn len(&self) -> u64 {
        self.header.capacity * SECTOR
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.len())?;
        let grain_bytes = self.grain_bytes();
        let compressed = self.header.compressed();
        read_mapped(offset, buf, grain_bytes, |index, within, out| {
            // 0 is unallocated, 1 is an explicitly zeroed grain.
            match self.grain_table.get(index as usize).copied() {
                None | Some(0) | Some(1) => {
                    out.fill(0);
                    Ok(())
                }
                Some(sector) if compressed => {
                    self.inflate(index, sector)?;
                    if let Some((_, data)) = &self.cached {
                        let from = within as usize;
                        out.copy_from_slice(&data[from..from + out.len()]);
                    }
                    Ok(())
                }
                Some(sector) => {
                    read_file_at(&mut self.file, u64::from(sector) * SECTOR + within, out)
                }
            }
        })
    }
}
