//! Application packages: a configuration plus the file tree to install.

use crate::config::{VmConfig, CONFIG_FILE_NAME};
use crate::error::{ImageError, Result};
use crate::tree::{DirNode, FileTree, Node};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Source of everything a build needs besides the kernel.
pub trait PackageReader {
    fn config(&self) -> Result<VmConfig>;

    fn file_tree(&self) -> Result<FileTree>;

    /// Stable identity of the package. Seeds the partition GUIDs.
    fn digest(&self) -> Result<[u8; 32]>;
}

/// A package laid out in a host directory, with an optional `vimg.toml` at the top.
#[derive(Debug, Clone)]
pub struct DirPackage {
    root: PathBuf,
}

impl DirPackage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let md = std::fs::metadata(&root).map_err(|e| ImageError::resource(&root, e))?;
        if !md.is_dir() {
            return Err(ImageError::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }
}

impl PackageReader for DirPackage {
    fn config(&self) -> Result<VmConfig> {
        let path = self.config_path();
        if path.is_file() {
            VmConfig::load(&path)
        } else {
            Ok(VmConfig::default())
        }
    }

    fn file_tree(&self) -> Result<FileTree> {
        FileTree::from_host_dir(&self.root, |rel| rel == Path::new(CONFIG_FILE_NAME))
    }

    fn digest(&self) -> Result<[u8; 32]> {
        tree_digest(&self.config()?, &self.file_tree()?)
    }
}

/// A package assembled in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPackage {
    pub config: VmConfig,
    pub tree: FileTree,
}

impl MemoryPackage {
    pub fn new(config: VmConfig, tree: FileTree) -> Self {
        Self { config, tree }
    }
}

impl PackageReader for MemoryPackage {
    fn config(&self) -> Result<VmConfig> {
        Ok(self.config.clone())
    }

    fn file_tree(&self) -> Result<FileTree> {
        Ok(self.tree.clone())
    }

    fn digest(&self) -> Result<[u8; 32]> {
        tree_digest(&self.config, &self.tree)
    }
}

/// SHA-256 over the configuration and the tree's shape: paths, kinds,
/// sizes, modes and symlink targets. File contents are not read.
pub fn tree_digest(config: &VmConfig, tree: &FileTree) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(config.to_json()?);
    hash_dir(&mut hasher, "", tree.root());
    Ok(hasher.finalize().into())
}

fn hash_dir(hasher: &mut Sha256, prefix: &str, dir: &DirNode) {
    for (name, node) in &dir.children {
        let path = format!("{prefix}/{name}");
        hasher.update(path.as_bytes());
        let meta = node.meta();
        hasher.update(format!("{:?}{:?}{:?}", meta.mode, meta.uid, meta.gid).as_bytes());
        match node {
            Node::File(file) => {
                hasher.update(b"f");
                hasher.update(file.size.to_le_bytes());
            }
            Node::Symlink(link) => {
                hasher.update(b"l");
                hasher.update(link.target.as_bytes());
            }
            Node::Dir(sub) => {
                hasher.update(b"d");
                hash_dir(hasher, &path, sub);
            }
        }
        hasher.update([0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn package_dir() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join("etc/motd"), "hi\n").unwrap();
        fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            "[vm]\nname = \"demo\"\ninodes = 64\n",
        )
        .unwrap();
        temp
    }

    #[test]
    fn directory_package_reads_config_and_tree() {
        let temp = package_dir();
        let package = DirPackage::new(temp.path()).unwrap();
        let config = package.config().unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.inodes, 64);

        let tree = package.file_tree().unwrap();
        assert!(tree.get("/etc/motd").is_some());
        assert!(tree.get(CONFIG_FILE_NAME).is_none());
    }

    #[test]
    fn missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let package = DirPackage::new(temp.path()).unwrap();
        assert_eq!(package.config().unwrap(), VmConfig::default());
    }

    #[test]
    fn digest_is_stable_and_tracks_the_tree() {
        let temp = package_dir();
        let package = DirPackage::new(temp.path()).unwrap();
        let first = package.digest().unwrap();
        assert_eq!(first, package.digest().unwrap());

        fs::write(temp.path().join("etc/issue"), "x").unwrap();
        assert_ne!(first, package.digest().unwrap());
    }

    #[test]
    fn file_is_not_a_package() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            DirPackage::new(&file),
            Err(ImageError::NotADirectory(_))
        ));
    }
}
