//! Read-side front door: open a finished image and query it.
//!
//! An [`Image`] owns the logical disk reader for whatever container the file
//! turned out to be. Partition-table and filesystem metadata are parsed on
//! first use and cached for the lifetime of the handle. Every query takes
//! `&mut self` because reads move the underlying file position.

pub mod decompile;
pub mod query;

pub use decompile::{decompile, DecompileOptions, DecompileReport};
pub use query::{DuSummary, FileStat, Listing, TreeEntry};

use crate::disk::boot::{self, BootEntry};
use crate::error::{ImageError, Result};
use crate::ext::reader::{ExtFs, InodeReader};
use crate::ext::{DirEntry, Inode, Superblock};
use crate::formats::{self, ImageFormat};
use crate::gpt::{self, GptEntry, GptHeader, OS_PARTITION, ROOT_PARTITION};
use crate::source::{ImageSource, PartitionReader};
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct Image {
    path: PathBuf,
    format: ImageFormat,
    source: Box<dyn ImageSource>,
    gpt: Option<(GptHeader, Vec<GptEntry>)>,
    fs: Option<ExtFs>,
}

impl Image {
    /// Open `path`, detecting its container format.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| ImageError::resource(path, e))?;
        let format = formats::detect(&mut file)?;
        Self::open_as(path, format, file)
    }

    /// Open `path` as `format`, skipping detection.
    pub fn open_with_format(path: &Path, format: ImageFormat) -> Result<Self> {
        let file = File::open(path).map_err(|e| ImageError::resource(path, e))?;
        Self::open_as(path, format, file)
    }

    fn open_as(path: &Path, format: ImageFormat, file: File) -> Result<Self> {
        let source = formats::open_reader(format, file)?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
            source,
            gpt: None,
            fs: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Logical disk size in bytes.
    pub fn size(&self) -> u64 {
        self.source.len()
    }

    /// The whole logical disk.
    pub fn disk(&mut self) -> &mut dyn ImageSource {
        &mut *self.source
    }

    fn load_gpt(&mut self) -> Result<&(GptHeader, Vec<GptEntry>)> {
        if self.gpt.is_none() {
            let header = gpt::read_header(&mut *self.source)?;
            let entries = gpt::read_entries(&mut *self.source, &header)?;
            self.gpt = Some((header, entries));
        }
        self.gpt
            .as_ref()
            .ok_or_else(|| ImageError::internal("partition table cache is empty"))
    }

    pub fn gpt_header(&mut self) -> Result<GptHeader> {
        Ok(self.load_gpt()?.0.clone())
    }

    /// The mirror at the end of the disk, with its own entry array checked.
    pub fn backup_gpt_header(&mut self) -> Result<GptHeader> {
        let header = gpt::read_backup_header(&mut *self.source)?;
        gpt::read_entries(&mut *self.source, &header)?;
        Ok(header)
    }

    pub fn gpt_entries(&mut self) -> Result<Vec<GptEntry>> {
        Ok(self.load_gpt()?.1.clone())
    }

    pub fn gpt_entry(&mut self, name: &str) -> Result<GptEntry> {
        let (_, entries) = self.load_gpt()?;
        gpt::find_entry(entries, name)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(format!("partition '{name}'")))
    }

    /// A reader over one partition's bytes.
    pub fn partition_reader(&mut self, name: &str) -> Result<PartitionReader<'_>> {
        let entry = self.gpt_entry(name)?;
        PartitionReader::new(&mut *self.source, entry.byte_offset(), entry.byte_len())
    }

    /// Files in the boot partition's directory.
    pub fn kernel_files(&mut self) -> Result<Vec<BootEntry>> {
        let mut partition = self.partition_reader(OS_PARTITION)?;
        boot::read_directory(&mut partition)
    }

    pub fn kernel_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .kernel_files()?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| ImageError::NotFound(format!("boot file '{name}'")))?;
        let len = crate::codec::to_usize(entry.size, "boot file size")?;
        let mut data = vec![0_u8; len];
        self.partition_reader(OS_PARTITION)?
            .read_exact_at(entry.offset, &mut data)?;
        Ok(data)
    }

    /// The root filesystem and the disk it lives on, parsed on first use.
    fn fs_parts(&mut self) -> Result<(&ExtFs, &mut dyn ImageSource)> {
        if self.fs.is_none() {
            let entry = self.gpt_entry(ROOT_PARTITION)?;
            self.fs = Some(ExtFs::open(&mut *self.source, entry.byte_offset())?);
        }
        match &self.fs {
            Some(fs) => Ok((fs, &mut *self.source)),
            None => Err(ImageError::internal("filesystem cache is empty")),
        }
    }

    pub fn filesystem(&mut self) -> Result<&ExtFs> {
        Ok(self.fs_parts()?.0)
    }

    /// Superblock copy `copy`; `0` is the primary.
    pub fn superblock(&mut self, copy: usize) -> Result<Superblock> {
        let (fs, source) = self.fs_parts()?;
        fs.read_superblock(source, copy)
    }

    pub fn read_inode(&mut self, ino: u32) -> Result<Inode> {
        let (fs, source) = self.fs_parts()?;
        fs.read_inode(source, ino)
    }

    pub fn readdir(&mut self, ino: u32) -> Result<Vec<DirEntry>> {
        let (fs, source) = self.fs_parts()?;
        fs.readdir(source, ino)
    }

    pub fn resolve_path(&mut self, path: &str) -> Result<u32> {
        let (fs, source) = self.fs_parts()?;
        fs.resolve_path(source, path)
    }

    pub fn inode_reader(&mut self, inode: &Inode) -> Result<InodeReader<'_>> {
        let (fs, source) = self.fs_parts()?;
        fs.inode_reader(source, inode)
    }

    pub fn read_link(&mut self, inode: &Inode) -> Result<String> {
        let (fs, source) = self.fs_parts()?;
        fs.read_link(source, inode)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::build::{self, BuildOptions, CancelToken, KernelOptions};
    use crate::config::VmConfig;
    use crate::disk::boot::{BootFile, CONFIG_FILE};
    use crate::kernel::{KernelBundle, StaticKernelResolver};
    use crate::logging::NullLogger;
    use crate::package::MemoryPackage;
    use crate::tree::FileTree;
    use tempfile::TempDir;

    /// Build `tree` into a raw image inside `temp` and open it.
    pub(crate) fn image_of(temp: &TempDir, tree: FileTree) -> Image {
        let path = temp.path().join("fixture.img");
        let package = MemoryPackage::new(VmConfig::default(), tree);
        let resolver = StaticKernelResolver::new().with(KernelBundle {
            version: "6.6.1".into(),
            files: vec![BootFile::bytes("vmlinuz", b"kernel image".to_vec())],
        });
        let opts = BuildOptions {
            package: &package,
            format: ImageFormat::Raw,
            kernel: KernelOptions {
                resolver: &resolver,
                version: None,
                extra_args: Vec::new(),
            },
            logger: &NullLogger,
            timestamp: Some(1_600_000_000),
        };
        build::build_to_path(&CancelToken::new(), &path, &opts).unwrap();
        Image::open(&path).unwrap()
    }

    fn sample() -> FileTree {
        let mut tree = FileTree::new();
        tree.add_bytes("hello.txt", b"hello".to_vec()).unwrap();
        tree
    }

    #[test]
    fn open_detects_raw_and_reads_partitions() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        assert_eq!(image.format(), ImageFormat::Raw);
        let names: Vec<_> = image.gpt_entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![OS_PARTITION.to_string(), ROOT_PARTITION.to_string()]);
        assert!(matches!(image.gpt_entry("swap"), Err(ImageError::NotFound(_))));
    }

    #[test]
    fn backup_header_mirrors_primary() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let primary = image.gpt_header().unwrap();
        let backup = image.backup_gpt_header().unwrap();
        assert_eq!(primary.backup_lba, backup.current_lba);
        assert_eq!(backup.backup_lba, primary.current_lba);
        assert_eq!(primary.entries_crc32, backup.entries_crc32);
        assert_eq!(primary.disk_guid, backup.disk_guid);
    }

    #[test]
    fn kernel_files_include_config() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let names: Vec<_> = image.kernel_files().unwrap().into_iter().map(|e| e.name).collect();
        assert!(names.contains(&"vmlinuz".to_string()));
        assert!(names.contains(&CONFIG_FILE.to_string()));
        assert_eq!(image.kernel_file("vmlinuz").unwrap(), b"kernel image");

        let config = VmConfig::from_json(&image.kernel_file(CONFIG_FILE).unwrap()).unwrap();
        assert_eq!(config.kernel, "6.6.1");
    }

    #[test]
    fn superblock_copies_agree() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let primary = image.superblock(0).unwrap();
        assert_eq!(primary.volume_name, "vimg-root");
        assert_eq!(primary.wtime, 1_600_000_000);
        let ino = image.resolve_path("/hello.txt").unwrap();
        assert_eq!(image.read_inode(ino).unwrap().full_size(), 5);
    }
}
