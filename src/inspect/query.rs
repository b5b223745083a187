//! The queries behind `ls`, `stat`, `cat`, `tree`, `du`, `md5` and `cp`.
//!
//! Everything here returns plain data; printing is the binary's business.

use super::decompile::{self, DecompileOptions};
use super::Image;
use crate::error::{ImageError, Result};
use crate::ext::reader::InodeReader;
use crate::ext::{Inode, InodeKind, S_IFMT};
use crate::logging::Logger;
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::Path;

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub ino: u32,
    pub kind: InodeKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: String,
    pub ino: u32,
    pub kind: InodeKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Bytes actually allocated, from the 512-byte sector count.
    pub allocated: u64,
    pub links: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Slash-separated, relative to the walk's start.
    pub path: String,
    pub depth: usize,
    pub ino: u32,
    pub kind: InodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DuSummary {
    /// Immediate children of the queried directory with their subtree totals.
    pub entries: Vec<(String, u64)>,
    pub total: u64,
}

/// `ls -l` style mode column.
pub fn mode_string(mode: u16) -> String {
    let kind = match mode & S_IFMT {
        crate::ext::S_IFDIR => 'd',
        crate::ext::S_IFLNK => 'l',
        crate::ext::S_IFREG => '-',
        crate::ext::S_IFCHR => 'c',
        crate::ext::S_IFBLK => 'b',
        crate::ext::S_IFIFO => 'p',
        crate::ext::S_IFSOCK => 's',
        _ => '?',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

impl Image {
    fn listing(&mut self, name: &str, ino: u32) -> Result<Listing> {
        let inode = self.read_inode(ino)?;
        Ok(Listing {
            name: name.to_string(),
            ino,
            kind: inode.kind(),
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.full_size(),
            mtime: inode.mtime,
        })
    }

    /// Entries of the directory at `path` in on-disk order, or the single
    /// object at `path` when it is not a directory. `.` and `..` appear only
    /// when `all` is set.
    pub fn list(&mut self, path: &str, all: bool) -> Result<Vec<Listing>> {
        let ino = self.resolve_path(path)?;
        let inode = self.read_inode(ino)?;
        if inode.kind() != InodeKind::Directory {
            let name = path.rsplit('/').find(|p| !p.is_empty()).unwrap_or(path);
            return Ok(vec![self.listing(name, ino)?]);
        }
        let mut out = Vec::new();
        for entry in self.readdir(ino)? {
            if entry.is_dot_or_dotdot() && !all {
                continue;
            }
            out.push(self.listing(&entry.name, entry.inode)?);
        }
        Ok(out)
    }

    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        let ino = self.resolve_path(path)?;
        let inode = self.read_inode(ino)?;
        let link_target = match inode.kind() {
            InodeKind::Symlink => Some(self.read_link(&inode)?),
            _ => None,
        };
        Ok(FileStat {
            path: path.to_string(),
            ino,
            kind: inode.kind(),
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.full_size(),
            allocated: u64::from(inode.blocks) * 512,
            links: inode.links_count,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            link_target,
        })
    }

    fn regular_file(&mut self, path: &str) -> Result<Inode> {
        let ino = self.resolve_path(path)?;
        let inode = self.read_inode(ino)?;
        match inode.kind() {
            InodeKind::Regular => Ok(inode),
            InodeKind::Directory => Err(ImageError::Unsupported(format!("{path} is a directory"))),
            other => Err(ImageError::Unsupported(format!(
                "{path} is not a regular file ({other:?})"
            ))),
        }
    }

    /// Stream the contents of the regular file at `path`.
    pub fn cat(&mut self, path: &str) -> Result<InodeReader<'_>> {
        let inode = self.regular_file(path)?;
        self.inode_reader(&inode)
    }

    /// Depth-first walk below `path` in on-disk order, `.` and `..` skipped.
    pub fn tree(&mut self, path: &str) -> Result<Vec<TreeEntry>> {
        let start = self.resolve_path(path)?;
        let mut out = Vec::new();
        let mut seen = HashSet::from([start]);
        let mut work = Vec::new();
        self.push_children(start, "", 0, &mut work)?;
        while let Some((entry_path, depth, ino)) = work.pop() {
            let kind = self.read_inode(ino)?.kind();
            if kind == InodeKind::Directory && seen.insert(ino) {
                self.push_children(ino, &entry_path, depth + 1, &mut work)?;
            }
            out.push(TreeEntry {
                path: entry_path,
                depth,
                ino,
                kind,
            });
        }
        Ok(out)
    }

    /// Queue a directory's entries so they pop in on-disk order.
    fn push_children(
        &mut self,
        dir: u32,
        prefix: &str,
        depth: usize,
        work: &mut Vec<(String, usize, u32)>,
    ) -> Result<()> {
        let entries = self.readdir(dir)?;
        for entry in entries.into_iter().rev() {
            if !entry.is_dot_or_dotdot() {
                work.push((join(prefix, &entry.name), depth, entry.inode));
            }
        }
        Ok(())
    }

    /// Space used below `path`: allocated bytes from the sector count, or the
    /// sum of logical sizes when `apparent` is set. Each inode counts once.
    pub fn du(&mut self, path: &str, apparent: bool) -> Result<DuSummary> {
        let start = self.resolve_path(path)?;
        let root = self.read_inode(start)?;
        let mut seen = HashSet::from([start]);
        let weigh = |inode: &Inode| {
            if apparent {
                inode.full_size()
            } else {
                u64::from(inode.blocks) * 512
            }
        };

        let mut summary = DuSummary {
            total: weigh(&root),
            ..DuSummary::default()
        };
        if root.kind() != InodeKind::Directory {
            return Ok(summary);
        }
        for entry in self.readdir(start)? {
            if entry.is_dot_or_dotdot() || !seen.insert(entry.inode) {
                continue;
            }
            let mut subtotal = 0;
            let mut work = vec![entry.inode];
            while let Some(ino) = work.pop() {
                let inode = self.read_inode(ino)?;
                subtotal += weigh(&inode);
                if inode.kind() == InodeKind::Directory {
                    for child in self.readdir(ino)? {
                        if !child.is_dot_or_dotdot() && seen.insert(child.inode) {
                            work.push(child.inode);
                        }
                    }
                }
            }
            summary.total += subtotal;
            summary.entries.push((entry.name, subtotal));
        }
        Ok(summary)
    }

    /// MD5 of the regular file at `path`.
    pub fn md5(&mut self, path: &str) -> Result<[u8; 16]> {
        let mut reader = self.cat(path)?;
        let mut hasher = Md5::new();
        let mut buf = vec![0_u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }

    /// Copy the object at `path` out to `dest` on the host.
    ///
    /// A file or symlink lands at `dest`, or inside it when `dest` is an
    /// existing directory. A directory is extracted recursively into `dest`.
    pub fn copy_out(&mut self, path: &str, dest: &Path, logger: &dyn Logger) -> Result<()> {
        let ino = self.resolve_path(path)?;
        let inode = self.read_inode(ino)?;
        match inode.kind() {
            InodeKind::Directory => {
                decompile::extract(self, ino, dest, &DecompileOptions::default(), logger)?;
                Ok(())
            }
            InodeKind::Regular | InodeKind::Symlink => {
                let target = if dest.is_dir() {
                    let name = path
                        .rsplit('/')
                        .find(|p| !p.is_empty())
                        .ok_or_else(|| ImageError::InvalidConfig(format!("cannot name a copy of '{path}'")))?;
                    dest.join(name)
                } else {
                    dest.to_path_buf()
                };
                if inode.kind() == InodeKind::Symlink {
                    let link = self.read_link(&inode)?;
                    std::os::unix::fs::symlink(&link, &target)
                        .map_err(|e| ImageError::resource(&target, e))?;
                } else {
                    decompile::write_file(self, &inode, &target)?;
                }
                Ok(())
            }
            InodeKind::Abnormal(bits) => Err(ImageError::Unsupported(format!(
                "{path} has special file type {bits:#o}"
            ))),
        }
    }
}

/// Lowercase hex, for printing digests.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| ImageError::resource(parent, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::tests::image_of;
    use crate::logging::NullLogger;
    use crate::tree::FileTree;
    use tempfile::TempDir;

    fn sample() -> FileTree {
        let mut tree = FileTree::new();
        tree.add_bytes("etc/hostname", b"vimg\n".to_vec()).unwrap();
        tree.add_bytes("bin/app", vec![7_u8; 5000]).unwrap();
        tree.add_dir("var/empty").unwrap();
        tree.add_symlink("etc/name", "hostname").unwrap();
        tree
    }

    #[test]
    fn mode_strings() {
        assert_eq!(mode_string(0o040755), "drwxr-xr-x");
        assert_eq!(mode_string(0o100644), "-rw-r--r--");
        assert_eq!(mode_string(0o120777), "lrwxrwxrwx");
    }

    #[test]
    fn list_hides_dot_entries_unless_asked() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let names: Vec<_> = image.list("/etc", false).unwrap().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["hostname", "name"]);
        let all = image.list("/etc", true).unwrap();
        assert_eq!(all[0].name, ".");
        assert_eq!(all[1].name, "..");

        let single = image.list("/bin/app", false).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].name, "app");
        assert_eq!(single[0].size, 5000);
    }

    #[test]
    fn stat_reports_link_target() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let stat = image.stat("/etc/name").unwrap();
        assert_eq!(stat.kind, InodeKind::Symlink);
        assert_eq!(stat.link_target.as_deref(), Some("hostname"));
        assert_eq!(stat.atime, 0);
    }

    #[test]
    fn cat_rejects_directories() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let mut text = String::new();
        image.cat("/etc/hostname").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "vimg\n");
        assert!(matches!(image.cat("/etc"), Err(ImageError::Unsupported(_))));
    }

    #[test]
    fn tree_is_depth_first() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let paths: Vec<_> = image.tree("/").unwrap().into_iter().map(|e| e.path).collect();
        let pos = |p: &str| paths.iter().position(|x| x == p).unwrap();
        assert!(pos("bin") < pos("bin/app"));
        assert!(pos("var") < pos("var/empty"));
        assert!(pos("etc") < pos("etc/hostname"));
        assert!(!paths.iter().any(|p| p.ends_with('.')));
    }

    #[test]
    fn du_counts_allocation_and_apparent_size() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let apparent = image.du("/bin", true).unwrap();
        let app = apparent.entries.iter().find(|(n, _)| n == "app").unwrap();
        assert_eq!(app.1, 5000);
        let allocated = image.du("/bin", false).unwrap();
        let app = allocated.entries.iter().find(|(n, _)| n == "app").unwrap();
        assert!(app.1 >= 5000);
        assert_eq!(app.1 % 512, 0);
    }

    #[test]
    fn md5_matches_content() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let digest = image.md5("/etc/hostname").unwrap();
        assert_eq!(hex(&digest), hex(&Md5::digest(b"vimg\n")));
    }

    #[test]
    fn copy_out_into_directory() {
        let temp = TempDir::new().unwrap();
        let mut image = image_of(&temp, sample());
        let out = temp.path().join("out");
        fs::create_dir(&out).unwrap();
        image.copy_out("/bin/app", &out, &NullLogger).unwrap();
        assert_eq!(fs::read(out.join("app")).unwrap(), vec![7_u8; 5000]);
        image.copy_out("/etc/name", &out, &NullLogger).unwrap();
        assert_eq!(fs::read_link(out.join("name")).unwrap(), Path::new("hostname"));
    }
}
