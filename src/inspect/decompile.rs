//! Rebuild a host directory tree from an image's root filesystem.
//!
//! Phase 1 walks depth first in on-disk order, creating directories and
//! regular files and collecting symlinks. Phase 2 creates the symlinks, so a
//! link may point at anything in the tree regardless of walk order.

use super::query::ensure_parent;
use super::Image;
use crate::error::{ImageError, Result};
use crate::ext::{Inode, InodeKind, ROOT_INO};
use crate::logging::Logger;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct DecompileOptions {
    /// Skip files and symlinks whose access time is still 0, i.e. never read
    /// since the image was built. Directories are always created.
    pub touched_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecompileReport {
    pub dirs: u64,
    pub files: u64,
    pub symlinks: u64,
    pub bytes: u64,
    /// Special inodes and unsafe names left out, plus untouched objects when
    /// filtering.
    pub skipped: u64,
}

/// Extract the whole root filesystem of `image` into `dest`.
pub fn decompile(
    image: &mut Image,
    dest: &Path,
    opts: DecompileOptions,
    logger: &dyn Logger,
) -> Result<DecompileReport> {
    let report = extract(image, ROOT_INO, dest, &opts, logger)?;
    logger.info(&format!(
        "decompiled {}: {} dirs, {} files ({} bytes), {} symlinks, {} skipped",
        image.path().display(),
        report.dirs,
        report.files,
        report.bytes,
        report.symlinks,
        report.skipped
    ));
    Ok(report)
}

fn safe_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

/// Extract the directory `start` into `dest`.
pub(crate) fn extract(
    image: &mut Image,
    start: u32,
    dest: &Path,
    opts: &DecompileOptions,
    logger: &dyn Logger,
) -> Result<DecompileReport> {
    let mut report = DecompileReport::default();
    fs::create_dir_all(dest).map_err(|e| ImageError::resource(dest, e))?;

    // Phase 1.
    let mut links: Vec<(PathBuf, String)> = Vec::new();
    let mut seen = HashSet::from([start]);
    let mut work = vec![(start, dest.to_path_buf())];
    while let Some((dir, host_dir)) = work.pop() {
        let mut subdirs = Vec::new();
        for entry in image.readdir(dir)? {
            if entry.is_dot_or_dotdot() {
                continue;
            }
            let host = host_dir.join(&entry.name);
            if !safe_name(&entry.name) {
                logger.warn(&format!(
                    "skipping entry with unusable name {:?} in {}",
                    entry.name,
                    host_dir.display()
                ));
                report.skipped += 1;
                continue;
            }
            let inode = image.read_inode(entry.inode)?;
            let kind = inode.kind();
            if opts.touched_only && kind != InodeKind::Directory && inode.atime == 0 {
                report.skipped += 1;
                continue;
            }
            match kind {
                InodeKind::Directory => {
                    if !seen.insert(entry.inode) {
                        logger.warn(&format!(
                            "directory inode {} linked twice, skipping {}",
                            entry.inode,
                            host.display()
                        ));
                        report.skipped += 1;
                        continue;
                    }
                    fs::create_dir_all(&host).map_err(|e| ImageError::resource(&host, e))?;
                    report.dirs += 1;
                    subdirs.push((entry.inode, host));
                }
                InodeKind::Regular => {
                    report.bytes += write_file(image, &inode, &host)?;
                    report.files += 1;
                }
                InodeKind::Symlink => {
                    links.push((host, image.read_link(&inode)?));
                }
                InodeKind::Abnormal(bits) => {
                    logger.warn(&format!(
                        "skipping {}: special file type {bits:#o}",
                        host.display()
                    ));
                    report.skipped += 1;
                }
            }
        }
        work.extend(subdirs.into_iter().rev());
    }

    // Phase 2.
    for (host, target) in links {
        symlink(&target, &host).map_err(|e| ImageError::resource(&host, e))?;
        report.symlinks += 1;
    }
    Ok(report)
}

/// Copy bytes `[0, full_size)` of a regular file to `target`, keeping its
/// permission bits. Returns the byte count.
pub(crate) fn write_file(image: &mut Image, inode: &Inode, target: &Path) -> Result<u64> {
    ensure_parent(target)?;
    let file = File::create(target).map_err(|e| ImageError::resource(target, e))?;
    let mut out = BufWriter::new(file);
    let mut reader = image.inode_reader(inode)?;
    let copied = io::copy(&mut reader, &mut out).map_err(|e| ImageError::resource(target, e))?;
    if copied != inode.full_size() {
        return Err(ImageError::format(format!(
            "{} yielded {copied} of {} bytes",
            target.display(),
            inode.full_size()
        )));
    }
    out.flush().map_err(|e| ImageError::resource(target, e))?;
    let perms = fs::Permissions::from_mode(u32::from(inode.permissions()));
    fs::set_permissions(target, perms).map_err(|e| ImageError::resource(target, e))?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::tests::image_of;
    use crate::logging::{Level, MemoryLogger, NullLogger};
    use crate::tree::FileTree;
    use tempfile::TempDir;

    #[test]
    fn symlinks_resolve_after_extraction() {
        let temp = TempDir::new().unwrap();
        let mut tree = FileTree::new();
        tree.add_symlink("a/link", "../z/target").unwrap();
        tree.add_bytes("z/target", b"found".to_vec()).unwrap();
        let mut image = image_of(&temp, tree);

        let out = temp.path().join("out");
        let report = decompile(&mut image, &out, DecompileOptions::default(), &NullLogger).unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.symlinks, 1);
        assert_eq!(fs::read(out.join("a/link")).unwrap(), b"found");
    }

    #[test]
    fn touched_only_keeps_directories() {
        let temp = TempDir::new().unwrap();
        let mut tree = FileTree::new();
        tree.add_bytes("etc/motd", b"hi".to_vec()).unwrap();
        tree.add_symlink("etc/issue", "motd").unwrap();
        let mut image = image_of(&temp, tree);

        let out = temp.path().join("out");
        let logger = MemoryLogger::new();
        let report = decompile(
            &mut image,
            &out,
            DecompileOptions { touched_only: true },
            &logger,
        )
        .unwrap();
        assert!(out.join("etc").is_dir());
        assert!(!out.join("etc/motd").exists());
        assert_eq!(report.skipped, 2);
        assert_eq!(logger.at(Level::Info).len(), 1);
    }

    #[test]
    fn empty_files_and_dirs_survive() {
        let temp = TempDir::new().unwrap();
        let mut tree = FileTree::new();
        tree.add_bytes("empty", Vec::new()).unwrap();
        tree.add_dir("nothing/here").unwrap();
        let mut image = image_of(&temp, tree);

        let out = temp.path().join("out");
        decompile(&mut image, &out, DecompileOptions::default(), &NullLogger).unwrap();
        assert_eq!(fs::metadata(out.join("empty")).unwrap().len(), 0);
        assert!(out.join("nothing/here").is_dir());
    }

    #[test]
    fn unsafe_names_are_rejected() {
        assert!(safe_name("ok"));
        assert!(!safe_name(".."));
        assert!(!safe_name("a/b"));
        assert!(!safe_name(""));
    }
}
