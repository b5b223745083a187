//! XVA: the Xen export archive.
//!
//! A tar archive holding `ova.xml` (VM and disk metadata) followed by the
//! disk cut into 1 MiB chunks named `Ref:1/00000000`, `Ref:1/00000001`, ...,
//! each followed by a `.checksum` member with the chunk's SHA-1 in hex.
//! All-zero chunks are left out, except the last one, which marks the end of
//! the disk.

use super::{allocated_units, check_range, read_file_at, read_mapped, read_unit, WriteOptions, WriteSeek};
use crate::error::{ImageError, Result};
use crate::gpt::Guid;
use crate::logging::Progress;
use crate::segment::DiskSource;
use crate::source::ImageSource;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Read};

pub const CHUNK_SIZE: u64 = 1024 * 1024;
const MANIFEST: &str = "ova.xml";
const DISK_REF: &str = "Ref:1";

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn uuid_string(uuid: &[u8; 16]) -> String {
    let h = hex(uuid);
    format!("{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..])
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn member(name: &str, value: &str) -> String {
    format!("<member><name>{name}</name><value>{value}</value></member>")
}

fn manifest(size: u64, opts: &WriteOptions) -> String {
    let name = xml_escape(&opts.name);
    let uuid = uuid_string(&opts.uuid);
    let vdi_uuid = uuid_string(&Guid::derive(&opts.uuid, "vdi").0);
    let vm = [
        member("name_label", &name),
        member("uuid", &uuid),
        member("is_a_template", "<boolean>0</boolean>"),
        member("VBDs", "<array><data><value>Ref:2</value></data></array>"),
    ]
    .concat();
    let vbd = [
        member("VM", "Ref:0"),
        member("VDI", DISK_REF),
        member("userdevice", "0"),
        member("bootable", "<boolean>1</boolean>"),
        member("mode", "RW"),
        member("type", "Disk"),
    ]
    .concat();
    let vdi = [
        member("name_label", &format!("{name} disk")),
        member("uuid", &vdi_uuid),
        member("virtual_size", &size.to_string()),
        member("type", "system"),
        member("read_only", "<boolean>0</boolean>"),
    ]
    .concat();
    let object = |class: &str, id: &str, snapshot: &str| {
        format!(
            "<value><struct>{}{}{}</struct></value>",
            member("class", class),
            member("id", id),
            member("snapshot", &format!("<struct>{snapshot}</struct>")),
        )
    };
    format!(
        "<?xml version=\"1.0\" ?>\n<value><struct>{}{}</struct></value>\n",
        member(
            "version",
            &format!(
                "<struct>{}{}</struct>",
                member("xapi_major", "1"),
                member("export_vsn", "2")
            )
        ),
        member(
            "objects",
            &format!(
                "<array><data>{}{}{}</data></array>",
                object("VM", "Ref:0", &vm),
                object("VBD", "Ref:2", &vbd),
                object("VDI", DISK_REF, &vdi),
            )
        ),
    )
}

fn append(
    builder: &mut tar::Builder<&mut dyn WriteSeek>,
    path: &str,
    data: &[u8],
    mtime: u64,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

pub fn write(
    source: &mut dyn DiskSource,
    sink: &mut dyn WriteSeek,
    opts: &WriteOptions,
    progress: &mut dyn Progress,
) -> Result<()> {
    let size = source.size();
    let chunks = size.div_ceil(CHUNK_SIZE);

    // Pass 1.
    let mut stored = allocated_units(&*source, CHUNK_SIZE);
    if chunks > 0 && stored.last() != Some(&(chunks - 1)) {
        stored.push(chunks - 1);
    }

    // Pass 2.
    let mtime = u64::try_from(opts.timestamp).unwrap_or(0);
    let mut builder = tar::Builder::new(sink);
    append(&mut builder, MANIFEST, manifest(size, opts).as_bytes(), mtime)?;
    let mut chunk = vec![0_u8; CHUNK_SIZE as usize];
    for index in &stored {
        read_unit(source, *index, &mut chunk)?;
        let name = format!("{DISK_REF}/{index:08}");
        append(&mut builder, &name, &chunk, mtime)?;
        let digest = hex(&Sha1::digest(&chunk));
        append(&mut builder, &format!("{name}.checksum"), digest.as_bytes(), mtime)?;
        progress.set((index + 1) * CHUNK_SIZE);
    }
    builder.into_inner()?;
    Ok(())
}

/// A tar archive whose first member is `ova.xml`.
pub fn looks_like_xva(head: &[u8]) -> bool {
    head.len() >= 262
        && head.starts_with(MANIFEST.as_bytes())
        && head[MANIFEST.len()] == 0
        && &head[257..262] == b"ustar"
}

/// Pull `virtual_size` out of the manifest.
fn virtual_size(xml: &str) -> Option<u64> {
    let key = "<name>virtual_size</name>";
    let rest = &xml[xml.find(key)? + key.len()..];
    let start = rest.find("<value>")? + "<value>".len();
    let end = rest[start..].find("</value>")? + start;
    rest[start..end].trim().parse().ok()
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    offset: u64,
    len: u64,
}

#[derive(Debug)]
pub struct XvaReader {
    file: File,
    size: u64,
    chunks: BTreeMap<u64, Chunk>,
    checksums: BTreeMap<u64, String>,
    verified: BTreeSet<u64>,
}

impl XvaReader {
    pub fn open(mut file: File) -> Result<Self> {
        let mut chunks = BTreeMap::new();
        let mut checksums = BTreeMap::new();
        let mut declared = None;
        {
            let mut archive = tar::Archive::new(&mut file);
            for entry in archive.entries()? {
                let mut entry = entry?;
                let path = entry.path()?.to_string_lossy().into_owned();
                if path == MANIFEST {
                    let mut xml = String::new();
                    entry.read_to_string(&mut xml)?;
                    declared = virtual_size(&xml);
                    continue;
                }
                let Some(rest) = path.strip_prefix(DISK_REF).and_then(|r| r.strip_prefix('/')) else {
                    continue;
                };
                if let Some(stem) = rest.strip_suffix(".checksum") {
                    let Ok(index) = stem.parse::<u64>() else { continue };
                    let mut text = String::new();
                    entry.read_to_string(&mut text)?;
                    checksums.insert(index, text.trim().to_ascii_lowercase());
                } else if let Ok(index) = rest.parse::<u64>() {
                    chunks.insert(
                        index,
                        Chunk {
                            offset: entry.raw_file_position(),
                            len: entry.size(),
                        },
                    );
                }
            }
        }

        let from_chunks = chunks
            .keys()
            .next_back()
            .map(|last| (last + 1) * CHUNK_SIZE)
            .unwrap_or(0);
        let size = declared.unwrap_or(from_chunks);
        if chunks.is_empty() && size > 0 {
            return Err(ImageError::format("XVA archive holds no disk chunks"));
        }
        if let Some((index, chunk)) = chunks.iter().find(|(_, c)| c.len > CHUNK_SIZE) {
            return Err(ImageError::format(format!(
                "XVA chunk {index} is {} bytes",
                chunk.len
            )));
        }
        Ok(Self {
            file,
            size,
            chunks,
            checksums,
            verified: BTreeSet::new(),
        })
    }

    fn verify(&mut self, index: u64, chunk: Chunk) -> io::Result<()> {
        if self.verified.contains(&index) {
            return Ok(());
        }
        if let Some(expected) = self.checksums.get(&index) {
            let mut data = vec![0_u8; chunk.len as usize];
            read_file_at(&mut self.file, chunk.offset, &mut data)?;
            let actual = hex(&Sha1::digest(&data));
            if &actual != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("XVA chunk {index} checksum mismatch: stored {expected}, computed {actual}"),
                ));
            }
        }
        self.verified.insert(index);
        Ok(())
    }
}

impl ImageSource for XvaReader {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.size)?;
        read_mapped(offset, buf, CHUNK_SIZE, |index, within, out| {
            let Some(chunk) = self.chunks.get(&index).copied() else {
                out.fill(0);
                return Ok(());
            };
            self.verify(index, chunk)?;
            // Chunks may be shorter than CHUNK_SIZE; the rest reads as zero.
            let avail = chunk.len.saturating_sub(within).min(out.len() as u64) as usize;
            read_file_at(&mut self.file, chunk.offset + within, &mut out[..avail])?;
            out[avail..].fill(0);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{Logger, NullLogger};
    use crate::segment::{Segment, SegmentedSource};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn build(temp: &TempDir) -> std::path::PathBuf {
        let mut disk = SegmentedSource::new(
            4 * CHUNK_SIZE,
            vec![Segment::bytes(CHUNK_SIZE + 9, b"payload".to_vec())],
        )
        .unwrap();
        let path = temp.path().join("disk.xva");
        let mut out = File::create(&path).unwrap();
        let opts = WriteOptions {
            name: "demo <vm>".into(),
            ..WriteOptions::default()
        };
        write(&mut disk, &mut out, &opts, &mut *NullLogger.progress("xva", 0)).unwrap();
        out.flush().unwrap();
        path
    }

    #[test]
    fn manifest_declares_size_and_escapes_name() {
        let xml = manifest(42, &WriteOptions {
            name: "a&b".into(),
            ..WriteOptions::default()
        });
        assert_eq!(virtual_size(&xml), Some(42));
        assert!(xml.contains("a&amp;b"));
    }

    #[test]
    fn vm_and_disk_have_distinct_uuids() {
        let opts = WriteOptions {
            uuid: [7; 16],
            ..WriteOptions::default()
        };
        let xml = manifest(42, &opts);
        let uuids: Vec<&str> = xml
            .split("<name>uuid</name><value>")
            .skip(1)
            .filter_map(|rest| rest.split('<').next())
            .collect();
        assert_eq!(uuids.len(), 2);
        assert_eq!(uuids[0], uuid_string(&[7; 16]));
        assert_ne!(uuids[0], uuids[1]);
    }

    #[test]
    fn round_trip_keeps_last_chunk_only_among_holes() {
        let temp = TempDir::new().unwrap();
        let path = build(&temp);
        let mut file = File::open(&path).unwrap();
        let mut head = [0_u8; 512];
        file.read_exact(&mut head).unwrap();
        assert!(looks_like_xva(&head));

        let mut reader = XvaReader::open(File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.len(), 4 * CHUNK_SIZE);
        let stored: Vec<_> = reader.chunks.keys().copied().collect();
        assert_eq!(stored, vec![1, 3]);

        let mut buf = [0_u8; 7];
        reader.read_exact_at(CHUNK_SIZE + 9, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        reader.read_exact_at(2 * CHUNK_SIZE, &mut buf).unwrap();
        assert_eq!(buf, [0; 7]);
    }

    #[test]
    fn corrupt_chunk_fails_checksum() {
        let temp = TempDir::new().unwrap();
        let path = build(&temp);
        let mut reader = XvaReader::open(File::open(&path).unwrap()).unwrap();
        let chunk = reader.chunks[&1];

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(chunk.offset + 9)).unwrap();
        file.write_all(b"X").unwrap();
        drop(file);

        let mut buf = [0_u8; 1];
        let err = reader.read_exact_at(CHUNK_SIZE + 9, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
