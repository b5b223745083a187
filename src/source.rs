//! Random-access byte sources for the read side.
//!
//! [`ImageSource`] is the narrow interface the GPT codec, the filesystem
//! reader and the introspector read through. Container readers implement it
//! to translate logical disk offsets into their backing storage, so nothing
//! above this layer knows which format is underneath.

use crate::error::{ImageError, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

pub trait ImageSource {
    /// Logical size in bytes.
    fn len(&self) -> u64;

    /// Fill `buf` from `offset`. Reading past `len()` is an error.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ImageSource + ?Sized> ImageSource for Box<T> {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl ImageSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| past_end(offset))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.as_slice().len())
            .ok_or_else(|| past_end(offset))?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

/// A plain file read as a flat disk.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ImageError::resource(path, e))?;
        Self::new(file)
    }

    pub fn new(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Like [`FileSource::new`] but with an explicit logical length, for
    /// formats that carry trailing metadata after the disk bytes.
    pub fn with_len(file: File, len: u64) -> Self {
        Self { file, len }
    }

    pub fn into_inner(self) -> File {
        self.file
    }
}

impl ImageSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.len)
        {
            return Err(past_end(offset));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }
}

/// A window `[start, start + len)` of another source, readable both as an
/// [`ImageSource`] and as a streaming `Read + Seek`.
pub struct PartitionReader<'a> {
    inner: &'a mut dyn ImageSource,
    start: u64,
    len: u64,
    pos: u64,
}

impl<'a> PartitionReader<'a> {
    pub fn new(inner: &'a mut dyn ImageSource, start: u64, len: u64) -> Result<Self> {
        let end = start
            .checked_add(len)
            .ok_or_else(|| ImageError::format("partition range overflows"))?;
        if end > inner.len() {
            return Err(ImageError::format(format!(
                "range {start}..{end} extends past the end of a {} byte disk",
                inner.len()
            )));
        }
        Ok(Self {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }
}

impl ImageSource for PartitionReader<'_> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.len)
        {
            return Err(past_end(offset));
        }
        self.inner.read_exact_at(self.start + offset, buf)
    }
}

impl Read for PartitionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.inner.read_exact_at(self.start + self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for PartitionReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.len)?;
        Ok(self.pos)
    }
}

/// Shared `SeekFrom` arithmetic for in-crate `Seek` impls.
pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, len: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
    };
    target.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek to a negative or overflowing position",
        )
    })
}

fn past_end(offset: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read at offset {offset} runs past the end of the source"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_reader_is_scoped() {
        let mut disk: Vec<u8> = (0..=255).collect();
        let mut part = PartitionReader::new(&mut disk, 16, 32).unwrap();
        let mut buf = Vec::new();
        part.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 32);
        assert_eq!(buf[0], 16);

        part.seek(SeekFrom::End(-1)).unwrap();
        let mut one = [0_u8; 1];
        part.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 47);

        let mut over = [0_u8; 2];
        assert!(part.read_exact_at(31, &mut over).is_err());
    }

    #[test]
    fn partition_past_disk_end_is_rejected() {
        let mut disk = vec![0_u8; 64];
        assert!(PartitionReader::new(&mut disk, 32, 64).is_err());
    }
}
