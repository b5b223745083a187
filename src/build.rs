//! Build orchestration: package in, container image out.
//!
//! Stages run in order and each one's errors are wrapped with its name:
//!
//! | Stage | Work |
//! |-------|------|
//! | `config` | read and validate the package configuration and file tree |
//! | `kernel` | resolve the kernel bundle |
//! | `filesystem` | preflight the tree (inodes, file sizes) and size the filesystem |
//! | `disk` | lay out the boot partition and GPT, render the filesystem |
//! | `container` | stream the disk into the output format |
//!
//! Everything up to `container` touches no output, so a request that cannot
//! succeed fails before a single byte is written.

use crate::config::{DiskSize, VmConfig};
use crate::disk::boot::{BootFile, BootPartition, CONFIG_FILE};
use crate::disk::{self, DiskLayout};
use crate::error::{ImageError, Result};
use crate::ext::builder::{self, FsOptions};
use crate::formats::{self, ImageFormat, WriteOptions, WriteSeek};
use crate::gpt::Guid;
use crate::kernel::KernelResolver;
use crate::logging::Logger;
use crate::package::PackageReader;
use crate::segment::SegmentedSource;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

/// Cooperative cancellation, checked before each stage and after the
/// container is written.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ImageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct KernelOptions<'a> {
    pub resolver: &'a dyn KernelResolver,
    /// Overrides the configured version.
    pub version: Option<String>,
    /// Appended to the configured kernel arguments.
    pub extra_args: Vec<String>,
}

pub struct BuildOptions<'a> {
    pub package: &'a dyn PackageReader,
    pub format: ImageFormat,
    pub kernel: KernelOptions<'a>,
    pub logger: &'a dyn Logger,
    /// Unix seconds stamped into the image. `None` uses the current time.
    pub timestamp: Option<i64>,
}

/// What a build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub format: ImageFormat,
    pub kernel_version: String,
    /// Logical disk size.
    pub disk_size: u64,
    pub fs_size: u64,
    pub inodes: u64,
    pub required_inodes: u64,
}

/// A fully laid-out disk waiting to be written.
pub struct PreparedImage {
    disk: SegmentedSource,
    write_opts: WriteOptions,
    report: BuildReport,
}

impl PreparedImage {
    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    /// Run the `container` stage.
    pub fn write(
        mut self,
        cancel: &CancelToken,
        sink: &mut dyn WriteSeek,
        logger: &dyn Logger,
    ) -> Result<BuildReport> {
        stage("container", cancel, || {
            let mut progress = logger.progress(self.report.format.name(), self.report.disk_size);
            formats::write_image(
                self.report.format,
                &mut self.disk,
                sink,
                &self.write_opts,
                &mut *progress,
            )
        })?;
        cancel.check()?;
        logger.info(&format!(
            "wrote {} image: {} byte disk, {} byte filesystem",
            self.report.format, self.report.disk_size, self.report.fs_size
        ));
        Ok(self.report)
    }
}

fn stage<T>(name: &'static str, cancel: &CancelToken, f: impl FnOnce() -> Result<T>) -> Result<T> {
    cancel.check()?;
    f().map_err(|e| e.in_stage(name))
}

/// Run every stage except `container`.
pub fn prepare(cancel: &CancelToken, opts: &BuildOptions<'_>) -> Result<PreparedImage> {
    let logger = opts.logger;
    let timestamp = opts
        .timestamp
        .unwrap_or_else(|| OffsetDateTime::now_utc().unix_timestamp());

    let (mut config, tree, digest) = stage("config", cancel, || {
        let config = opts.package.config()?;
        config.validate()?;
        let tree = opts.package.file_tree()?;
        let digest = opts.package.digest()?;
        Ok((config, tree, digest))
    })?;
    logger.info(&format!(
        "package '{}': {} nodes, {} bytes of file data",
        config.name,
        tree.node_count(),
        tree.file_bytes()
    ));

    let bundle = stage("kernel", cancel, || {
        let version = opts
            .kernel
            .version
            .clone()
            .unwrap_or_else(|| config.kernel.clone());
        opts.kernel.resolver.resolve(&version)
    })?;
    logger.info(&format!(
        "kernel {} ({} files)",
        bundle.version,
        bundle.files.len()
    ));
    config.kernel = bundle.version.clone();
    config
        .kernel_args
        .extend(opts.kernel.extra_args.iter().cloned());

    let plan = stage("filesystem", cancel, || {
        let fs_opts = FsOptions {
            inode_quota: config.inodes,
            timestamp: u32::try_from(timestamp.max(0)).unwrap_or(u32::MAX),
            uuid: Guid::derive(&digest, "fs").0,
            ..FsOptions::default()
        };
        builder::plan(&tree, fs_opts)
    })?;
    logger.debug(&format!(
        "filesystem needs {} inodes, using {}",
        plan.required_inodes(),
        plan.target_inodes()
    ));

    let (disk, fs_size, total) = stage("disk", cancel, || {
        let boot = BootPartition::new(boot_files(bundle.files.clone(), &config)?)?;
        let layout = DiskLayout::plan(
            boot.size(),
            plan.min_size()?,
            config.disk_size,
            opts.format.alignment(),
        )?;
        opts.format.check_size(layout.total_bytes)?;
        let fs = match config.disk_size {
            DiskSize::Auto => plan.build(None)?,
            DiskSize::Exact(_) | DiskSize::Extra(_) => plan.build(Some(layout.root_bytes()))?,
        };
        let fs_size = fs.size;
        let disk = disk::assemble(&boot, fs, &layout, &digest)?;
        Ok((disk, fs_size, layout.total_bytes))
    })?;

    Ok(PreparedImage {
        disk,
        write_opts: WriteOptions {
            timestamp,
            uuid: Guid::derive(&digest, "image").0,
            name: config.name.clone(),
        },
        report: BuildReport {
            format: opts.format,
            kernel_version: bundle.version,
            disk_size: total,
            fs_size,
            inodes: plan.target_inodes(),
            required_inodes: plan.required_inodes(),
        },
    })
}

fn boot_files(mut files: Vec<BootFile>, config: &VmConfig) -> Result<Vec<BootFile>> {
    files.push(BootFile::bytes(CONFIG_FILE, config.to_json()?));
    Ok(files)
}

/// Build an image into `sink`.
pub fn build(
    cancel: &CancelToken,
    sink: &mut dyn WriteSeek,
    opts: &BuildOptions<'_>,
) -> Result<BuildReport> {
    prepare(cancel, opts)?.write(cancel, sink, opts.logger)
}

/// Build an image at `path`.
///
/// The image is written to `<path>.partial` under an exclusive lock and
/// renamed into place on success. On failure the partial file is removed and
/// `path` is left untouched.
pub fn build_to_path(
    cancel: &CancelToken,
    path: &Path,
    opts: &BuildOptions<'_>,
) -> Result<BuildReport> {
    let prepared = prepare(cancel, opts)?;

    let partial = partial_path(path);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&partial)
        .map_err(|e| ImageError::resource(&partial, e))?;
    if file.try_lock_exclusive().is_err() {
        return Err(ImageError::resource(
            &partial,
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "output is locked by another build",
            ),
        ));
    }
    file.set_len(0)
        .map_err(|e| ImageError::resource(&partial, e))?;

    let result = write_locked(prepared, cancel, &file, opts.logger);
    drop(file);
    match result {
        Ok(report) => {
            fs::rename(&partial, path).map_err(|e| ImageError::resource(path, e))?;
            Ok(report)
        }
        Err(err) => {
            if let Err(e) = fs::remove_file(&partial) {
                opts.logger.warn(&format!(
                    "could not remove '{}': {e}",
                    partial.display()
                ));
            }
            Err(err)
        }
    }
}

fn write_locked(
    prepared: PreparedImage,
    cancel: &CancelToken,
    file: &fs::File,
    logger: &dyn Logger,
) -> Result<BuildReport> {
    let mut sink = BufWriter::new(file);
    let report = prepared.write(cancel, &mut sink, logger)?;
    sink.into_inner()
        .map_err(|e| ImageError::Io(e.into_error()))?
        .sync_all()?;
    Ok(report)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
