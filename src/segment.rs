//! Segment-mapped virtual disks for the build side.
//!
//! The filesystem builder and the disk assembler never materialize a whole
//! disk in memory. They describe it as a sorted list of [`Segment`]s, each
//! backed by a metadata buffer or a range of a file's content. Anything not
//! covered by a segment reads as zeros and is reported as a hole, which is
//! what lets the sparse container writers skip it.

use crate::error::{ImageError, Result};
use crate::source::{resolve_seek, ImageSource};
use crate::tree::Content;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

/// "Which parts of this disk are all zero?"
pub trait HoleSource {
    /// Logical size in bytes.
    fn size(&self) -> u64;

    /// True when `[offset, offset + len)` is known to read as zeros.
    ///
    /// May return false for zero-filled data; must never return true for data
    /// that is not zero.
    fn region_is_hole(&self, offset: u64, len: u64) -> bool;
}

/// A readable, seekable disk that can report holes. Container writers take this.
pub trait DiskSource: Read + Seek + HoleSource {}

impl<T: Read + Seek + HoleSource + ?Sized> DiskSource for T {}

impl<T: AsRef<[u8]>> HoleSource for Cursor<T> {
    fn size(&self) -> u64 {
        self.get_ref().as_ref().len() as u64
    }

    fn region_is_hole(&self, offset: u64, len: u64) -> bool {
        let data = self.get_ref().as_ref();
        let start = offset.min(data.len() as u64) as usize;
        let end = offset.saturating_add(len).min(data.len() as u64) as usize;
        data[start..end].iter().all(|b| *b == 0)
    }
}

#[derive(Debug, Clone)]
pub enum SegmentData {
    /// Metadata rendered in memory.
    Bytes(Arc<[u8]>),
    /// Bytes of a file starting at `offset` within it.
    Content { content: Content, offset: u64 },
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub start: u64,
    pub len: u64,
    pub data: SegmentData,
}

impl Segment {
    pub fn bytes(start: u64, data: impl Into<Vec<u8>>) -> Self {
        let data: Arc<[u8]> = Arc::from(data.into());
        Self {
            start,
            len: data.len() as u64,
            data: SegmentData::Bytes(data),
        }
    }

    pub fn content(start: u64, len: u64, content: Content, offset: u64) -> Self {
        Self {
            start,
            len,
            data: SegmentData::Content { content, offset },
        }
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// The same segment moved `delta` bytes later on the disk.
    pub fn shifted(mut self, delta: u64) -> Self {
        self.start += delta;
        self
    }
}

/// A virtual disk made of non-overlapping segments over an implicit zero background.
pub struct SegmentedSource {
    size: u64,
    segments: Vec<Segment>,
    pos: u64,
    open_file: Option<(PathBuf, File)>,
}

impl SegmentedSource {
    /// Sort and validate `segments`. Overlaps or segments past `size` are
    /// layout bugs and fail with [`ImageError::Internal`].
    pub fn new(size: u64, mut segments: Vec<Segment>) -> Result<Self> {
        segments.retain(|s| s.len > 0);
        segments.sort_by_key(|s| s.start);

        let mut prev_end = 0;
        for seg in &segments {
            let end = seg
                .start
                .checked_add(seg.len)
                .ok_or_else(|| ImageError::internal("segment end overflows"))?;
            if seg.start < prev_end {
                return Err(ImageError::internal(format!(
                    "segment at {} overlaps the previous one ending at {prev_end}",
                    seg.start
                )));
            }
            if end > size {
                return Err(ImageError::internal(format!(
                    "segment {}..{end} extends past the {size} byte disk",
                    seg.start
                )));
            }
            if let SegmentData::Bytes(data) = &seg.data {
                if data.len() as u64 != seg.len {
                    return Err(ImageError::internal(format!(
                        "segment at {} claims {} bytes but holds {}",
                        seg.start,
                        seg.len,
                        data.len()
                    )));
                }
            }
            prev_end = end;
        }

        Ok(Self {
            size,
            segments,
            pos: 0,
            open_file: None,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    /// Index of the first segment ending after `pos`.
    fn first_after(&self, pos: u64) -> usize {
        self.segments.partition_point(|s| s.end() <= pos)
    }

    fn read_host(&mut self, path: &PathBuf, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let reuse = matches!(&self.open_file, Some((open, _)) if open == path);
        if !reuse {
            let file = File::open(path).map_err(|e| {
                io::Error::new(e.kind(), format!("'{}': {e}", path.display()))
            })?;
            self.open_file = Some((path.clone(), file));
        }
        let Some((_, file)) = self.open_file.as_mut() else {
            return Err(io::Error::other("host file handle missing"));
        };
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    e.kind(),
                    format!("'{}' is shorter than when it was sized", path.display()),
                )
            } else {
                e
            }
        })
    }
}

impl Read for SegmentedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.size - self.pos);
        let idx = self.first_after(self.pos);

        let n = match self.segments.get(idx) {
            Some(seg) if seg.start <= self.pos => {
                let within = self.pos - seg.start;
                let n = want.min(seg.len - within) as usize;
                match seg.data.clone() {
                    SegmentData::Bytes(data) => {
                        let from = within as usize;
                        buf[..n].copy_from_slice(&data[from..from + n]);
                    }
                    SegmentData::Content {
                        content: Content::Bytes(data),
                        offset,
                    } => {
                        let from = (offset + within) as usize;
                        let src = data.get(from..from + n).ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "in-memory file is shorter than its segment",
                            )
                        })?;
                        buf[..n].copy_from_slice(src);
                    }
                    SegmentData::Content {
                        content: Content::Host(path),
                        offset,
                    } => self.read_host(&path, offset + within, &mut buf[..n])?,
                }
                n
            }
            Some(seg) => {
                let n = want.min(seg.start - self.pos) as usize;
                buf[..n].fill(0);
                n
            }
            None => {
                let n = want as usize;
                buf[..n].fill(0);
                n
            }
        };

        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SegmentedSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.size)?;
        Ok(self.pos)
    }
}

impl ImageSource for SegmentedSource {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

impl HoleSource for SegmentedSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn region_is_hole(&self, offset: u64, len: u64) -> bool {
        let end = offset.saturating_add(len);
        for seg in &self.segments[self.first_after(offset)..] {
            if seg.start >= end {
                break;
            }
            let from = offset.max(seg.start) - seg.start;
            let to = end.min(seg.end()) - seg.start;
            let (data, base) = match &seg.data {
                SegmentData::Bytes(data) => (data, 0),
                SegmentData::Content {
                    content: Content::Bytes(data),
                    offset,
                } => (data, *offset),
                // Host files are not read just to look for zeros.
                SegmentData::Content { .. } => return false,
            };
            let range = (base + from) as usize..(base + to) as usize;
            match data.get(range) {
                Some(bytes) if crate::codec::is_zero(bytes) => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn gaps_read_as_zero() {
        let mut disk = SegmentedSource::new(
            32,
            vec![Segment::bytes(24, vec![2; 4]), Segment::bytes(4, vec![1; 4])],
        )
        .unwrap();
        let mut out = Vec::new();
        disk.read_to_end(&mut out).unwrap();
        let mut expected = vec![0_u8; 32];
        expected[4..8].fill(1);
        expected[24..28].fill(2);
        assert_eq!(out, expected);

        assert!(disk.region_is_hole(8, 16));
        assert!(!disk.region_is_hole(0, 5));
        assert!(disk.region_is_hole(28, 4));
    }

    #[test]
    fn zero_metadata_counts_as_hole() {
        let disk = SegmentedSource::new(16, vec![Segment::bytes(0, vec![0; 8])]).unwrap();
        assert!(disk.region_is_hole(0, 16));
    }

    #[test]
    fn zero_in_memory_content_counts_as_hole() {
        let mut data = vec![0_u8; 64];
        data[40] = 7;
        let disk = SegmentedSource::new(
            128,
            vec![Segment::content(64, 64, Content::bytes(data), 0)],
        )
        .unwrap();
        assert!(disk.region_is_hole(0, 104));
        assert!(!disk.region_is_hole(100, 8));
    }

    #[test]
    fn overlap_is_internal_error() {
        let err = SegmentedSource::new(
            16,
            vec![Segment::bytes(0, vec![1; 8]), Segment::bytes(4, vec![1; 8])],
        )
        .err()
        .unwrap();
        assert!(matches!(err, ImageError::Internal(_)));
    }

    #[test]
    fn host_content_is_read_lazily() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        std::fs::write(&path, b"0123456789").unwrap();
        let mut disk = SegmentedSource::new(
            8,
            vec![Segment::content(2, 4, Content::Host(path), 3)],
        )
        .unwrap();
        let mut out = [0_u8; 8];
        disk.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"\0\x003456\0\0");
        assert!(!disk.region_is_hole(0, 3));
    }

    #[test]
    fn shrunk_host_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        std::fs::write(&path, b"01").unwrap();
        let mut disk =
            SegmentedSource::new(8, vec![Segment::content(0, 8, Content::Host(path), 0)]).unwrap();
        let mut out = [0_u8; 8];
        assert!(disk.read_exact(&mut out).is_err());
    }
}
