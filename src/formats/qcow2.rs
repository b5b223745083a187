//! QCOW2, version 2, 64 KiB clusters.
//!
//! Clusters, in order: header, L1 table, refcount table, refcount blocks,
//! L2 tables (only those covering data), data clusters (holes left out).
//! The number of refcount blocks depends on the total cluster count, which
//! includes the refcount blocks themselves, so the layout is computed as a
//! fixed point before anything is written.

use super::{allocated_units, check_range, read_file_at, read_mapped, read_unit, WriteSeek};
use crate::codec::{be_u32, be_u64, put_be_u16, put_be_u32, put_be_u64, to_usize};
use crate::error::{ImageError, Result};
use crate::logging::Progress;
use crate::segment::DiskSource;
use crate::source::ImageSource;
use std::collections::BTreeSet;
use std::fs::File;
use std::io;

pub const MAGIC: [u8; 4] = *b"QFI\xfb";
const VERSION: u32 = 2;
const CLUSTER_BITS: u32 = 16;
pub const CLUSTER_SIZE: u64 = 1 << CLUSTER_BITS;
const HEADER_LEN: usize = 72;
const L2_ENTRIES: u64 = CLUSTER_SIZE / 8;
/// 16-bit refcounts.
const REFCOUNTS_PER_BLOCK: u64 = CLUSTER_SIZE / 2;
const OFLAG_COPIED: u64 = 1 << 63;
const OFLAG_COMPRESSED: u64 = 1 << 62;
const OFLAG_ZERO: u64 = 1;
const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub const MAX_SIZE: u64 = 1 << 61;

/// Cluster indices of every table, decided before writing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Layout {
    l1_size: u64,
    l1_clusters: u64,
    refcount_table: u64,
    refcount_table_clusters: u64,
    refcount_blocks: u64,
    refcount_block_count: u64,
    l2_tables: u64,
    /// L1 indices that get an L2 table, in order.
    l2_for: Vec<u64>,
    data: u64,
    total_clusters: u64,
}

impl Layout {
    fn plan(size: u64, stored: &[u64]) -> Result<Self> {
        let l1_size = size.div_ceil(CLUSTER_SIZE * L2_ENTRIES);
        if l1_size > u64::from(u32::MAX) {
            return Err(ImageError::SizeLimit {
                format: "qcow2",
                size,
                max: u64::from(u32::MAX) * CLUSTER_SIZE * L2_ENTRIES,
            });
        }
        let l1_clusters = (l1_size * 8).div_ceil(CLUSTER_SIZE).max(1);
        let l2_for: Vec<u64> = stored
            .iter()
            .map(|c| c / L2_ENTRIES)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let fixed = 1 + l1_clusters + l2_for.len() as u64 + stored.len() as u64;

        let mut rb = 1_u64;
        let mut rt = 1_u64;
        loop {
            let total = fixed + rt + rb;
            let need_rb = total.div_ceil(REFCOUNTS_PER_BLOCK);
            let need_rt = (need_rb * 8).div_ceil(CLUSTER_SIZE);
            if need_rb <= rb && need_rt <= rt {
                break;
            }
            rb = rb.max(need_rb);
            rt = rt.max(need_rt);
        }

        let refcount_table = 1 + l1_clusters;
        let refcount_blocks = refcount_table + rt;
        let l2_tables = refcount_blocks + rb;
        let data = l2_tables + l2_for.len() as u64;
        Ok(Self {
            l1_size,
            l1_clusters,
            refcount_table,
            refcount_table_clusters: rt,
            refcount_blocks,
            refcount_block_count: rb,
            l2_tables,
            l2_for,
            data,
            total_clusters: data + stored.len() as u64,
        })
    }

    fn offset(cluster: u64) -> u64 {
        cluster * CLUSTER_SIZE
    }
}

fn header(size: u64, layout: &Layout) -> Vec<u8> {
    let mut buf = vec![0_u8; CLUSTER_SIZE as usize];
    buf[..4].copy_from_slice(&MAGIC);
    put_be_u32(&mut buf, 4, VERSION);
    put_be_u32(&mut buf, 20, CLUSTER_BITS);
    put_be_u64(&mut buf, 24, size);
    put_be_u32(&mut buf, 36, layout.l1_size as u32);
    put_be_u64(&mut buf, 40, Layout::offset(1));
    put_be_u64(&mut buf, 48, Layout::offset(layout.refcount_table));
    put_be_u32(&mut buf, 56, layout.refcount_table_clusters as u32);
    buf
}

pub fn write(
    source: &mut dyn DiskSource,
    sink: &mut dyn WriteSeek,
    progress: &mut dyn Progress,
) -> Result<()> {
    let size = source.size();

    // Pass 1.
    let stored = allocated_units(&*source, CLUSTER_SIZE);
    let layout = Layout::plan(size, &stored)?;

    let mut l1 = vec![0_u8; (layout.l1_clusters * CLUSTER_SIZE) as usize];
    for (i, l1_index) in layout.l2_for.iter().enumerate() {
        let table = Layout::offset(layout.l2_tables + i as u64);
        put_be_u64(&mut l1, (*l1_index * 8) as usize, table | OFLAG_COPIED);
    }

    let mut refcount_table = vec![0_u8; (layout.refcount_table_clusters * CLUSTER_SIZE) as usize];
    for i in 0..layout.refcount_block_count {
        let block = Layout::offset(layout.refcount_blocks + i);
        put_be_u64(&mut refcount_table, (i * 8) as usize, block);
    }
    let mut refcounts = vec![0_u8; (layout.refcount_block_count * CLUSTER_SIZE) as usize];
    for cluster in 0..layout.total_clusters {
        put_be_u16(&mut refcounts, (cluster * 2) as usize, 1);
    }

    let mut l2 = vec![0_u8; (layout.l2_for.len() as u64 * CLUSTER_SIZE) as usize];
    for (slot, cluster) in stored.iter().enumerate() {
        let table = layout
            .l2_for
            .binary_search(&(cluster / L2_ENTRIES))
            .map_err(|_| ImageError::internal("qcow2 cluster without an L2 table"))?;
        let at = table as u64 * CLUSTER_SIZE + (cluster % L2_ENTRIES) * 8;
        let data = Layout::offset(layout.data + slot as u64);
        put_be_u64(&mut l2, at as usize, data | OFLAG_COPIED);
    }

    // Pass 2.
    sink.write_all(&header(size, &layout))?;
    sink.write_all(&l1)?;
    sink.write_all(&refcount_table)?;
    sink.write_all(&refcounts)?;
    sink.write_all(&l2)?;
    let mut buf = vec![0_u8; CLUSTER_SIZE as usize];
    for cluster in &stored {
        read_unit(source, *cluster, &mut buf)?;
        sink.write_all(&buf)?;
        progress.set((cluster + 1) * CLUSTER_SIZE);
    }
    Ok(())
}

#[derive(Debug)]
pub struct Qcow2Reader {
    file: File,
    size: u64,
    version: u32,
    cluster_size: u64,
    l1: Vec<u64>,
    l2_cache: Option<(u64, Vec<u64>)>,
}

impl Qcow2Reader {
    pub fn open(mut file: File) -> Result<Self> {
        let mut buf = [0_u8; HEADER_LEN];
        read_file_at(&mut file, 0, &mut buf)?;
        if buf[..4] != MAGIC {
            return Err(ImageError::format("qcow2 magic missing"));
        }
        let version = be_u32(&buf, 4)?;
        if version != 2 && version != 3 {
            return Err(ImageError::Unsupported(format!("qcow2 version {version}")));
        }
        if be_u64(&buf, 8)? != 0 {
            return Err(ImageError::Unsupported(
                "qcow2 images with a backing file".into(),
            ));
        }
        let cluster_bits = be_u32(&buf, 20)?;
        if !(9..=21).contains(&cluster_bits) {
            return Err(ImageError::format(format!(
                "qcow2 cluster bits {cluster_bits}"
            )));
        }
        if be_u32(&buf, 32)? != 0 {
            return Err(ImageError::Unsupported("encrypted qcow2 images".into()));
        }
        let size = be_u64(&buf, 24)?;
        let cluster_size = 1_u64 << cluster_bits;
        let l1_size = u64::from(be_u32(&buf, 36)?);
        let l1_offset = be_u64(&buf, 40)?;
        let covered = l1_size
            .checked_mul(cluster_size / 8)
            .and_then(|n| n.checked_mul(cluster_size));
        if covered.is_some_and(|c| c < size) {
            return Err(ImageError::format("qcow2 L1 table does not cover the disk"));
        }
        let file_len = file.metadata()?.len();
        let l1_bytes = l1_size * 8;
        if l1_offset.checked_add(l1_bytes).map_or(true, |end| end > file_len) {
            return Err(ImageError::format(format!(
                "qcow2 L1 table of {l1_size} entries at {l1_offset} runs past the {file_len} byte file"
            )));
        }

        let mut raw = vec![0_u8; to_usize(l1_bytes, "L1 table size")?];
        read_file_at(&mut file, l1_offset, &mut raw)?;
        let l1 = raw
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Ok(Self {
            file,
            size,
            version,
            cluster_size,
            l1,
            l2_cache: None,
        })
    }

    fn l2_entry(&mut self, cluster: u64) -> io::Result<u64> {
        let per_table = self.cluster_size / 8;
        let l1_index = cluster / per_table;
        let table = self.l1.get(l1_index as usize).copied().unwrap_or(0) & OFFSET_MASK;
        if table == 0 {
            return Ok(0);
        }
        if !matches!(&self.l2_cache, Some((cached, _)) if *cached == l1_index) {
            let mut raw = vec![0_u8; self.cluster_size as usize];
            read_file_at(&mut self.file, table, &mut raw)?;
            let entries = raw
                .chunks_exact(8)
                .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            self.l2_cache = Some((l1_index, entries));
        }
        Ok(self
            .l2_cache
            .as_ref()
            .and_then(|(_, entries)| entries.get((cluster % per_table) as usize).copied())
            .unwrap_or(0))
    }
}

impl ImageSource for Qcow2Reader {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.size)?;
        let cluster_size = self.cluster_size;
        read_mapped(offset, buf, cluster_size, |cluster, within, out| {
            let entry = self.l2_entry(cluster)?;
            if entry & OFLAG_COMPRESSED != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "compressed qcow2 clusters are not supported",
                ));
            }
            let data = entry & OFFSET_MASK;
            if data == 0 || (self.version >= 3 && entry & OFLAG_ZERO != 0) {
                out.fill(0);
                return Ok(());
            }
            read_file_at(&mut self.file, data + within, out)
        })
    }
}
