//! Kernel resolution.
//!
//! A kernel is a named set of files (the kernel image, an initrd, a boot
//! loader stage) copied verbatim into the boot partition. Resolvers are
//! injected into the build, so tests and embedders can supply their own.

use crate::disk::boot::BootFile;
use crate::error::{ImageError, Result};
use crate::tree::Content;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const LATEST: &str = "latest";

#[derive(Debug, Clone)]
pub struct KernelBundle {
    pub version: String,
    pub files: Vec<BootFile>,
}

pub trait KernelResolver {
    /// Resolve `version` (or `latest`) to a bundle.
    fn resolve(&self, version: &str) -> Result<KernelBundle>;
}

/// Kernels stored as `<root>/<version>/<file>`.
#[derive(Debug, Clone)]
pub struct DirKernelResolver {
    root: PathBuf,
}

impl DirKernelResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<cache dir>/vimg/kernels`, e.g. `~/.cache/vimg/kernels` on Linux.
    pub fn default_root() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("vimg").join("kernels"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installed versions, lowest first.
    pub fn versions(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ImageError::resource(&self.root, e)),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ImageError::resource(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(|c: char| c.is_ascii_digit()) {
                    versions.push(name.to_string());
                }
            }
        }
        versions.sort_by(|a, b| compare_versions(a, b));
        Ok(versions)
    }
}

impl KernelResolver for DirKernelResolver {
    fn resolve(&self, version: &str) -> Result<KernelBundle> {
        let not_found = |reason: String| ImageError::KernelNotFound {
            version: version.to_string(),
            reason,
        };
        let version = if version == LATEST {
            self.versions()?
                .pop()
                .ok_or_else(|| not_found(format!("no kernels under '{}'", self.root.display())))?
        } else {
            version.to_string()
        };

        let dir = self.root.join(&version);
        if !dir.is_dir() {
            return Err(not_found(format!("'{}' does not exist", dir.display())));
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| ImageError::resource(&dir, e))? {
            let entry = entry.map_err(|e| ImageError::resource(&dir, e))?;
            let md = entry
                .metadata()
                .map_err(|e| ImageError::resource(entry.path(), e))?;
            if md.is_file() {
                paths.push((entry.path(), md.len()));
            }
        }
        if paths.is_empty() {
            return Err(not_found(format!("'{}' holds no files", dir.display())));
        }
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for (path, size) in paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    ImageError::InvalidConfig(format!("kernel file '{}' has no UTF-8 name", path.display()))
                })?
                .to_string();
            files.push(BootFile {
                name,
                content: Content::Host(path),
                size,
            });
        }
        Ok(KernelBundle { version, files })
    }
}

/// Fixed set of bundles, keyed by version.
#[derive(Debug, Clone, Default)]
pub struct StaticKernelResolver {
    bundles: BTreeMap<String, KernelBundle>,
}

impl StaticKernelResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, bundle: KernelBundle) -> Self {
        self.bundles.insert(bundle.version.clone(), bundle);
        self
    }
}

impl KernelResolver for StaticKernelResolver {
    fn resolve(&self, version: &str) -> Result<KernelBundle> {
        let found = if version == LATEST {
            self.bundles
                .values()
                .max_by(|a, b| compare_versions(&a.version, &b.version))
        } else {
            self.bundles.get(version)
        };
        found.cloned().ok_or_else(|| ImageError::KernelNotFound {
            version: version.to_string(),
            reason: "not in the configured kernel set".to_string(),
        })
    }
}

/// Compare dotted versions numerically part by part (`5.10` > `5.9`).
/// Non-numeric parts compare as text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '-', '+'])
            .map(str::to_string)
            .collect()
    };
    let (a, b) = (split(a), split(b));
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn install(root: &Path, version: &str) {
        let dir = root.join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vmlinuz"), format!("kernel {version}")).unwrap();
        fs::write(dir.join("initrd"), "initrd").unwrap();
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("5.10", "5.9"), Ordering::Greater);
        assert_eq!(compare_versions("5.10.1", "5.10"), Ordering::Greater);
        assert_eq!(compare_versions("6.1", "6.1"), Ordering::Equal);
    }

    #[test]
    fn latest_picks_highest_version() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "5.9.0");
        install(temp.path(), "5.10.2");
        fs::create_dir_all(temp.path().join("scratch")).unwrap();

        let resolver = DirKernelResolver::new(temp.path());
        let bundle = resolver.resolve(LATEST).unwrap();
        assert_eq!(bundle.version, "5.10.2");
        let names: Vec<_> = bundle.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["initrd", "vmlinuz"]);
        assert_eq!(bundle.files[1].size, "kernel 5.10.2".len() as u64);
    }

    #[test]
    fn missing_version_is_kernel_not_found() {
        let temp = TempDir::new().unwrap();
        let resolver = DirKernelResolver::new(temp.path());
        assert!(matches!(
            resolver.resolve("1.0"),
            Err(ImageError::KernelNotFound { .. })
        ));
        assert!(matches!(
            resolver.resolve(LATEST),
            Err(ImageError::KernelNotFound { .. })
        ));
    }

    #[test]
    fn static_resolver_serves_latest() {
        let resolver = StaticKernelResolver::new()
            .with(KernelBundle {
                version: "1.2".into(),
                files: vec![BootFile::bytes("vmlinuz", b"a".to_vec())],
            })
            .with(KernelBundle {
                version: "1.10".into(),
                files: vec![BootFile::bytes("vmlinuz", b"b".to_vec())],
            });
        assert_eq!(resolver.resolve(LATEST).unwrap().version, "1.10");
        assert!(resolver.resolve("2.0").is_err());
    }
}
