//! Container formats.
//!
//! Every writer takes a [`DiskSource`] and runs in two passes. The first pass
//! only consults the hole map to decide which units (clusters, grains,
//! blocks, chunks) get stored and where every table entry points. The second
//! pass streams headers, tables and data in file order. Nothing already
//! written is revisited.
//!
//! Readers expose the logical disk inside a container as an [`ImageSource`].

pub mod qcow2;
pub mod raw;
pub mod vhd;
pub mod vmdk;
pub mod xva;

use crate::error::{ImageError, Result};
use crate::logging::Progress;
use crate::segment::DiskSource;
use crate::source::{FileSource, ImageSource};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::str::FromStr;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Raw,
    Vmdk,
    StreamOptimizedVmdk,
    Vhd,
    VhdDynamic,
    Qcow2,
    Xva,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 7] = [
        ImageFormat::Raw,
        ImageFormat::Vmdk,
        ImageFormat::StreamOptimizedVmdk,
        ImageFormat::Vhd,
        ImageFormat::VhdDynamic,
        ImageFormat::Qcow2,
        ImageFormat::Xva,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Vmdk => "vmdk",
            Self::StreamOptimizedVmdk => "stream-optimized-vmdk",
            Self::Vhd => "vhd",
            Self::VhdDynamic => "vhd-dynamic",
            Self::Qcow2 => "qcow2",
            Self::Xva => "xva",
        }
    }

    pub fn supported_names() -> Vec<&'static str> {
        Self::ALL.iter().map(|f| f.name()).collect()
    }

    /// Resolve a user-supplied format name. `sparse` is an alias for
    /// `stream-optimized-vmdk`.
    pub fn parse(name: &str) -> Result<Self> {
        let wanted = name.trim().to_ascii_lowercase();
        if wanted == "sparse" {
            return Ok(Self::StreamOptimizedVmdk);
        }
        Self::ALL
            .into_iter()
            .find(|f| f.name() == wanted)
            .ok_or_else(|| ImageError::UnknownFormat {
                name: name.to_string(),
                supported: Self::supported_names(),
            })
    }

    /// The disk size is rounded up to a multiple of this.
    pub fn alignment(self) -> u64 {
        match self {
            Self::Raw | Self::Vhd | Self::Xva => MIB,
            Self::Vmdk | Self::StreamOptimizedVmdk => vmdk::GRAIN_SIZE,
            Self::VhdDynamic => vhd::BLOCK_SIZE,
            Self::Qcow2 => qcow2::CLUSTER_SIZE,
        }
    }

    /// Largest disk the container can describe.
    pub fn max_size(self) -> Option<u64> {
        match self {
            Self::Raw | Self::Xva => None,
            Self::Vmdk | Self::StreamOptimizedVmdk => Some(2 * TIB),
            Self::Vhd | Self::VhdDynamic => Some(2040 * GIB),
            Self::Qcow2 => Some(qcow2::MAX_SIZE),
        }
    }

    pub fn check_size(self, size: u64) -> Result<()> {
        match self.max_size() {
            Some(max) if size > max => Err(ImageError::SizeLimit {
                format: self.name(),
                size,
                max,
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageFormat {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Output of a container writer.
pub trait WriteSeek: Write + Seek {}

impl<T: Write + Seek + ?Sized> WriteSeek for T {}

/// Values stamped into container headers.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Unix seconds.
    pub timestamp: i64,
    pub uuid: [u8; 16],
    pub name: String,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            timestamp: 0,
            uuid: [0; 16],
            name: "vimg".to_string(),
        }
    }
}

/// Write `source` into `sink` as `format`.
pub fn write_image(
    format: ImageFormat,
    source: &mut dyn DiskSource,
    sink: &mut dyn WriteSeek,
    opts: &WriteOptions,
    progress: &mut dyn Progress,
) -> Result<()> {
    format.check_size(source.size())?;
    match format {
        ImageFormat::Raw => raw::write(source, sink, progress),
        ImageFormat::Vmdk => vmdk::write_sparse(source, sink, opts, progress),
        ImageFormat::StreamOptimizedVmdk => vmdk::write_stream(source, sink, opts, progress),
        ImageFormat::Vhd => vhd::write_fixed(source, sink, opts, progress),
        ImageFormat::VhdDynamic => vhd::write_dynamic(source, sink, opts, progress),
        ImageFormat::Qcow2 => qcow2::write(source, sink, progress),
        ImageFormat::Xva => xva::write(source, sink, opts, progress),
    }?;
    progress.finish();
    sink.flush()?;
    Ok(())
}

/// Guess the container format of an image file.
///
/// Probe order: qcow2, vmdk, dynamic vhd (footer copy at 0), xva (tar
/// starting with `ova.xml`), fixed vhd (footer at the end), then raw.
pub fn detect(file: &mut File) -> Result<ImageFormat> {
    let len = file.metadata()?.len();
    let mut head = [0_u8; 512];
    let got = read_up_to(file, 0, &mut head)?;
    let head = &head[..got];

    if head.starts_with(&qcow2::MAGIC) {
        return Ok(ImageFormat::Qcow2);
    }
    if head.starts_with(&vmdk::MAGIC) {
        return vmdk::detect_flavor(file);
    }
    if head.starts_with(&vhd::FOOTER_COOKIE) {
        return Ok(ImageFormat::VhdDynamic);
    }
    if xva::looks_like_xva(head) {
        return Ok(ImageFormat::Xva);
    }
    if len >= 512 {
        let mut tail = [0_u8; 8];
        read_up_to(file, len - 512, &mut tail)?;
        if tail == vhd::FOOTER_COOKIE {
            return Ok(ImageFormat::Vhd);
        }
    }
    Ok(ImageFormat::Raw)
}

/// Expose the logical disk inside `file`.
pub fn open_reader(format: ImageFormat, file: File) -> Result<Box<dyn ImageSource>> {
    Ok(match format {
        ImageFormat::Raw => Box::new(FileSource::new(file)?),
        ImageFormat::Vmdk | ImageFormat::StreamOptimizedVmdk => {
            Box::new(vmdk::VmdkReader::open(file)?)
        }
        ImageFormat::Vhd => Box::new(vhd::open_fixed(file)?),
        ImageFormat::VhdDynamic => Box::new(vhd::DynamicVhdReader::open(file)?),
        ImageFormat::Qcow2 => Box::new(qcow2::Qcow2Reader::open(file)?),
        ImageFormat::Xva => Box::new(xva::XvaReader::open(file)?),
    })
}

/// Fill `buf` from the logical disk at `offset`.
pub(crate) fn read_disk(source: &mut dyn DiskSource, offset: u64, buf: &mut [u8]) -> Result<()> {
    source.seek(SeekFrom::Start(offset))?;
    source.read_exact(buf)?;
    Ok(())
}

/// Indices of the `unit`-sized pieces of `source` that hold data. The last
/// piece may be short.
pub(crate) fn allocated_units(source: &dyn DiskSource, unit: u64) -> Vec<u64> {
    let size = source.size();
    let count = size.div_ceil(unit);
    (0..count)
        .filter(|i| {
            let start = i * unit;
            !source.region_is_hole(start, unit.min(size - start))
        })
        .collect()
}

/// Read unit `index` into `buf`, zero-padding past the end of the disk.
pub(crate) fn read_unit(
    source: &mut dyn DiskSource,
    index: u64,
    buf: &mut [u8],
) -> Result<()> {
    let unit = buf.len() as u64;
    let start = index * unit;
    let avail = source.size().saturating_sub(start).min(unit) as usize;
    read_disk(source, start, &mut buf[..avail])?;
    buf[avail..].fill(0);
    Ok(())
}

/// Positioned read from a container file.
pub(crate) fn read_file_at(file: &mut File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

fn read_up_to(file: &mut File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Split a logical read at `offset` into per-unit pieces and hand each to
/// `fetch(unit_index, offset_within_unit, out)`.
pub(crate) fn read_mapped(
    offset: u64,
    buf: &mut [u8],
    unit: u64,
    mut fetch: impl FnMut(u64, u64, &mut [u8]) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let mut done = 0_usize;
    while done < buf.len() {
        let pos = offset + done as u64;
        let index = pos / unit;
        let within = pos % unit;
        let n = ((unit - within) as usize).min(buf.len() - done);
        fetch(index, within, &mut buf[done..done + n])?;
        done += n;
    }
    Ok(())
}

pub(crate) fn past_end(offset: u64, len: usize, size: u64) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("read of {len} bytes at {offset} is past the {size} byte disk"),
    )
}

pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> std::io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(past_end(offset, len, size)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_format_lists_every_name() {
        let err = ImageFormat::parse("iso").unwrap_err();
        match &err {
            ImageError::UnknownFormat { name, supported } => {
                assert_eq!(name, "iso");
                assert_eq!(
                    supported,
                    &vec![
                        "raw",
                        "vmdk",
                        "stream-optimized-vmdk",
                        "vhd",
                        "vhd-dynamic",
                        "qcow2",
                        "xva"
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("stream-optimized-vmdk"));
    }

    #[test]
    fn names_round_trip_and_alias() {
        for format in ImageFormat::ALL {
            assert_eq!(ImageFormat::parse(format.name()).unwrap(), format);
        }
        assert_eq!(
            "sparse".parse::<ImageFormat>().unwrap(),
            ImageFormat::StreamOptimizedVmdk
        );
    }

    #[test]
    fn size_limits() {
        assert!(ImageFormat::Raw.check_size(u64::MAX).is_ok());
        assert!(matches!(
            ImageFormat::Vhd.check_size(2041 * GIB),
            Err(ImageError::SizeLimit { format: "vhd", .. })
        ));
    }

    #[test]
    fn mapped_reads_split_on_unit_boundaries() {
        let mut calls = Vec::new();
        let mut buf = [0_u8; 10];
        read_mapped(6, &mut buf, 4, |index, within, out| {
            calls.push((index, within, out.len()));
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, vec![(1, 2, 2), (2, 0, 4), (3, 0, 4)]);
    }
}
