//! Raw disk images: the logical disk byte for byte.
//!
//! Holes are skipped with a seek, so on filesystems with sparse file support
//! the output only occupies the space its data needs.

use super::{read_disk, WriteSeek};
use crate::error::Result;
use crate::logging::Progress;
use crate::segment::DiskSource;
use std::io::SeekFrom;

const CHUNK: u64 = 1024 * 1024;

pub fn write(
    source: &mut dyn DiskSource,
    sink: &mut dyn WriteSeek,
    progress: &mut dyn Progress,
) -> Result<()> {
    let size = source.size();
    let mut buf = vec![0_u8; CHUNK as usize];
    let mut offset = 0;
    let mut ends_in_hole = false;

    while offset < size {
        let len = CHUNK.min(size - offset);
        if source.region_is_hole(offset, len) {
            sink.seek(SeekFrom::Current(len as i64))?;
            ends_in_hole = true;
        } else {
            let chunk = &mut buf[..len as usize];
            read_disk(source, offset, chunk)?;
            sink.write_all(chunk)?;
            ends_in_hole = false;
        }
        offset += len;
        progress.set(offset);
    }

    // Seeking alone does not extend the output.
    if ends_in_hole {
        sink.seek(SeekFrom::Current(-1))?;
        sink.write_all(&[0])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{Logger, NullLogger};
    use crate::segment::{Segment, SegmentedSource};
    use std::io::Cursor;

    #[test]
    fn trailing_hole_still_sets_length() {
        let mut disk =
            SegmentedSource::new(3 * CHUNK, vec![Segment::bytes(10, b"data".to_vec())]).unwrap();
        let mut out = Cursor::new(Vec::new());
        write(&mut disk, &mut out, &mut *NullLogger.progress("raw", 0)).unwrap();
        let out = out.into_inner();
        assert_eq!(out.len() as u64, 3 * CHUNK);
        assert_eq!(&out[10..14], b"data");
        assert!(out[14..].iter().all(|b| *b == 0));
    }
}
