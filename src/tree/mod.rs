//! In-memory file tree consumed by the filesystem builder.
//!
//! The tree is fully assembled, and every file size is known, before a single
//! filesystem byte is laid out: block-group geometry depends on the total.
//! Directory children are kept in a `BTreeMap`, so traversal order (and with
//! it inode numbering and block allocation) is deterministic.

use crate::error::{ImageError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Longest name a directory entry can hold.
pub const MAX_NAME_LEN: usize = 255;

/// Where a regular file's bytes come from.
///
/// Host files are opened lazily, only when the image stream reaches them.
#[derive(Debug, Clone)]
pub enum Content {
    Host(PathBuf),
    Bytes(Arc<[u8]>),
}

impl Content {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Arc::from(data.into()))
    }
}

/// Ownership and permission overrides. `None` falls back to the builder defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeMeta {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FileNode {
    pub content: Content,
    pub size: u64,
    pub meta: NodeMeta,
}

#[derive(Debug, Clone, Default)]
pub struct DirNode {
    pub children: BTreeMap<String, Node>,
    pub meta: NodeMeta,
}

#[derive(Debug, Clone)]
pub struct SymlinkNode {
    pub target: String,
    pub meta: NodeMeta,
}

#[derive(Debug, Clone)]
pub enum Node {
    File(FileNode),
    Dir(DirNode),
    Symlink(SymlinkNode),
}

impl Node {
    pub fn meta(&self) -> &NodeMeta {
        match self {
            Node::File(f) => &f.meta,
            Node::Dir(d) => &d.meta,
            Node::Symlink(s) => &s.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        match self {
            Node::File(f) => &mut f.meta,
            Node::Dir(d) => &mut d.meta,
            Node::Symlink(s) => &mut s.meta,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileTree {
    root: DirNode,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &DirNode {
        &self.root
    }

    /// Insert `node` at `path`, creating missing parent directories.
    ///
    /// Inserting a directory where one already exists is a no-op; any other
    /// collision is an error.
    pub fn insert(&mut self, path: &str, node: Node) -> Result<()> {
        let parts = split_path(path)?;
        let Some((name, parents)) = parts.split_last() else {
            return Err(ImageError::InvalidConfig(
                "cannot replace the root directory".into(),
            ));
        };

        let mut dir = &mut self.root;
        for part in parents {
            let entry = dir
                .children
                .entry((*part).to_string())
                .or_insert_with(|| Node::Dir(DirNode::default()));
            dir = match entry {
                Node::Dir(d) => d,
                _ => return Err(ImageError::NotADirectory(format!("{part} (in '{path}')"))),
            };
        }

        if let Some(existing) = dir.children.get(*name) {
            if matches!((existing, &node), (Node::Dir(_), Node::Dir(_))) {
                return Ok(());
            }
            return Err(ImageError::InvalidConfig(format!(
                "duplicate path '{path}' in file tree"
            )));
        }
        dir.children.insert((*name).to_string(), node);
        Ok(())
    }

    pub fn add_bytes(&mut self, path: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        let data: Vec<u8> = data.into();
        let size = data.len() as u64;
        self.insert(
            path,
            Node::File(FileNode {
                content: Content::bytes(data),
                size,
                meta: NodeMeta::default(),
            }),
        )
    }

    pub fn add_host_file(&mut self, path: &str, host: impl Into<PathBuf>) -> Result<()> {
        let host = host.into();
        let metadata = fs::metadata(&host).map_err(|e| ImageError::resource(&host, e))?;
        self.insert(
            path,
            Node::File(FileNode {
                content: Content::Host(host),
                size: metadata.len(),
                meta: NodeMeta::default(),
            }),
        )
    }

    pub fn add_dir(&mut self, path: &str) -> Result<()> {
        if split_path(path)?.is_empty() {
            return Ok(());
        }
        self.insert(path, Node::Dir(DirNode::default()))
    }

    pub fn add_symlink(&mut self, path: &str, target: impl Into<String>) -> Result<()> {
        self.insert(
            path,
            Node::Symlink(SymlinkNode {
                target: target.into(),
                meta: NodeMeta::default(),
            }),
        )
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        let parts = split_path(path).ok()?;
        let mut dir = &self.root;
        let Some((name, parents)) = parts.split_last() else {
            return None;
        };
        for part in parents {
            match dir.children.get(*part)? {
                Node::Dir(d) => dir = d,
                _ => return None,
            }
        }
        dir.children.get(*name)
    }

    pub fn set_meta(&mut self, path: &str, meta: NodeMeta) -> Result<()> {
        let parts = split_path(path)?;
        if parts.is_empty() {
            self.root.meta = meta;
            return Ok(());
        }
        let node = node_mut(&mut self.root, &parts)
            .ok_or_else(|| ImageError::NotFound(path.to_string()))?;
        *node.meta_mut() = meta;
        Ok(())
    }

    /// Number of objects in the tree, root directory included.
    pub fn node_count(&self) -> u64 {
        fn count(dir: &DirNode) -> u64 {
            dir.children
                .values()
                .map(|node| match node {
                    Node::Dir(d) => 1 + count(d),
                    _ => 1,
                })
                .sum()
        }
        1 + count(&self.root)
    }

    /// Sum of regular file sizes.
    pub fn file_bytes(&self) -> u64 {
        fn sum(dir: &DirNode) -> u64 {
            dir.children
                .values()
                .map(|node| match node {
                    Node::File(f) => f.size,
                    Node::Dir(d) => sum(d),
                    Node::Symlink(_) => 0,
                })
                .sum()
        }
        sum(&self.root)
    }

    /// Mirror a host directory. Symlinks are preserved, not followed.
    ///
    /// `skip` receives paths relative to `root`; matching entries (and, for
    /// directories, their contents) are left out.
    pub fn from_host_dir(root: &Path, skip: impl Fn(&Path) -> bool) -> Result<Self> {
        let mut tree = FileTree::new();
        let mut walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                ImageError::resource(path, std::io::Error::other(e.to_string()))
            })?;
            if entry.depth() == 0 {
                continue;
            }
            let rel = entry.path().strip_prefix(root).map_err(|_| {
                ImageError::internal(format!(
                    "walked path '{}' escaped '{}'",
                    entry.path().display(),
                    root.display()
                ))
            })?;
            if skip(rel) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            let rel_str = rel.to_str().ok_or_else(|| {
                ImageError::InvalidConfig(format!("non UTF-8 path '{}'", rel.display()))
            })?;
            let rel_str = rel_str.replace('\\', "/");

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .map_err(|e| ImageError::resource(entry.path(), e))?;
                tree.add_symlink(&rel_str, target.to_string_lossy().into_owned())?;
            } else if file_type.is_dir() {
                tree.add_dir(&rel_str)?;
            } else if file_type.is_file() {
                tree.add_host_file(&rel_str, entry.path())?;
            } else {
                return Err(ImageError::Unsupported(format!(
                    "'{}' is not a regular file, directory or symlink",
                    entry.path().display()
                )));
            }

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if !file_type.is_symlink() {
                    let md = entry
                        .metadata()
                        .map_err(|e| ImageError::resource(entry.path(), std::io::Error::other(e.to_string())))?;
                    let mode = (md.permissions().mode() & 0o7777) as u16;
                    tree.set_meta(
                        &rel_str,
                        NodeMeta {
                            mode: Some(mode),
                            ..NodeMeta::default()
                        },
                    )?;
                }
            }
        }

        Ok(tree)
    }
}

fn node_mut<'a>(dir: &'a mut DirNode, parts: &[&str]) -> Option<&'a mut Node> {
    let (first, rest) = parts.split_first()?;
    let child = dir.children.get_mut(*first)?;
    if rest.is_empty() {
        return Some(child);
    }
    match child {
        Node::Dir(d) => node_mut(d, rest),
        _ => None,
    }
}

/// Split a tree path into validated components. `""` and `"/"` are the root.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(ImageError::InvalidConfig(format!(
                    "path '{path}' contains '..'"
                )))
            }
            name if name.len() > MAX_NAME_LEN => {
                return Err(ImageError::InvalidConfig(format!(
                    "name '{name}' is longer than {MAX_NAME_LEN} bytes"
                )))
            }
            name if name.contains('\0') => {
                return Err(ImageError::InvalidConfig(format!(
                    "name in '{path}' contains a NUL byte"
                )))
            }
            name => parts.push(name),
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn insert_creates_parents() {
        let mut tree = FileTree::new();
        tree.add_bytes("/usr/bin/app", b"hello".to_vec()).unwrap();
        assert!(matches!(tree.get("usr"), Some(Node::Dir(_))));
        assert!(matches!(tree.get("usr/bin/app"), Some(Node::File(f)) if f.size == 5));
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.file_bytes(), 5);
    }

    #[test]
    fn duplicate_file_is_rejected() {
        let mut tree = FileTree::new();
        tree.add_bytes("a", b"1".to_vec()).unwrap();
        assert!(tree.add_bytes("a", b"2".to_vec()).is_err());
        tree.add_dir("d").unwrap();
        tree.add_dir("d").unwrap();
    }

    #[test]
    fn file_cannot_be_a_parent() {
        let mut tree = FileTree::new();
        tree.add_bytes("a", b"1".to_vec()).unwrap();
        let err = tree.add_bytes("a/b", b"2".to_vec()).unwrap_err();
        assert!(matches!(err, ImageError::NotADirectory(_)));
    }

    #[test]
    fn split_path_rejects_traversal() {
        assert!(split_path("../etc/passwd").is_err());
        assert_eq!(split_path("/a/./b/").unwrap(), vec!["a", "b"]);
        assert!(split_path("/").unwrap().is_empty());
    }

    #[test]
    fn set_meta_targets_node() {
        let mut tree = FileTree::new();
        tree.add_symlink("bin/sh", "busybox").unwrap();
        let meta = NodeMeta {
            uid: Some(0),
            gid: Some(0),
            mode: None,
        };
        tree.set_meta("bin/sh", meta).unwrap();
        assert_eq!(tree.get("bin/sh").unwrap().meta(), &meta);
        assert!(tree.set_meta("bin/missing", meta).is_err());
    }

    #[test]
    fn mirrors_host_directory() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join("etc/hostname"), b"vm\n").unwrap();
        fs::write(temp.path().join("skipme"), b"x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("etc/hostname", temp.path().join("link")).unwrap();

        let tree = FileTree::from_host_dir(temp.path(), |p| p == Path::new("skipme")).unwrap();
        assert!(matches!(tree.get("etc/hostname"), Some(Node::File(f)) if f.size == 3));
        assert!(tree.get("skipme").is_none());
        #[cfg(unix)]
        assert!(matches!(tree.get("link"), Some(Node::Symlink(s)) if s.target == "etc/hostname"));
    }
}
