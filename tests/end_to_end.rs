//! Build images in-process, then read them back through the introspector.

use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vimg::build::{build_to_path, BuildOptions, BuildReport, CancelToken, KernelOptions};
use vimg::config::{DiskSize, VmConfig};
use vimg::disk::boot::BootFile;
use vimg::ext::ROOT_INO;
use vimg::gpt::{OS_PARTITION, ROOT_PARTITION, SECTOR_SIZE};
use vimg::inspect::{decompile, DecompileOptions, Image};
use vimg::kernel::{KernelBundle, StaticKernelResolver};
use vimg::logging::NullLogger;
use vimg::package::{DirPackage, MemoryPackage, PackageReader};
use vimg::tree::FileTree;
use vimg::{ImageError, ImageFormat};

const BLOCK: usize = 4096;
const MIB: usize = 1024 * 1024;

fn resolver() -> StaticKernelResolver {
    StaticKernelResolver::new()
        .with(KernelBundle {
            version: "6.1.0".into(),
            files: vec![BootFile::bytes("vmlinuz", vec![0x5A; 8192])],
        })
        .with(KernelBundle {
            version: "6.6.2".into(),
            files: vec![
                BootFile::bytes("vmlinuz", vec![0xA5; 8192]),
                BootFile::bytes("initrd.img", vec![1, 2, 3]),
            ],
        })
}

fn build_package(
    package: &dyn PackageReader,
    format: ImageFormat,
    out: &Path,
) -> Result<BuildReport, ImageError> {
    let resolver = resolver();
    let opts = BuildOptions {
        package,
        format,
        kernel: KernelOptions {
            resolver: &resolver,
            version: None,
            extra_args: Vec::new(),
        },
        logger: &NullLogger,
        timestamp: Some(1_700_000_000),
    };
    build_to_path(&CancelToken::new(), out, &opts)
}

fn build_tree(temp: &TempDir, tree: FileTree, format: ImageFormat) -> PathBuf {
    let out = temp.path().join(format!("disk.{}", format.name()));
    let package = MemoryPackage::new(VmConfig::default(), tree);
    build_package(&package, format, &out).unwrap();
    out
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

/// Every file, directory and symlink below `root`, keyed by relative path.
fn snapshot(root: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.unwrap();
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let kind = entry.file_type();
        let value = if kind.is_symlink() {
            format!("link:{}", fs::read_link(entry.path()).unwrap().display())
        } else if kind.is_dir() {
            "dir".to_string()
        } else {
            format!("file:{}", hex(&md5_of(&fs::read(entry.path()).unwrap())))
        };
        out.insert(rel, value);
    }
    out
}

fn md5_of(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn sample_tree() -> FileTree {
    let mut tree = FileTree::new();
    tree.add_bytes("etc/hostname", b"demo\n".to_vec()).unwrap();
    tree.add_bytes("etc/empty.conf", Vec::new()).unwrap();
    tree.add_bytes("usr/bin/app", pattern(3 * BLOCK + 17, 9)).unwrap();
    tree.add_dir("var/log").unwrap();
    // Points forward at a sibling that sorts after it.
    tree.add_symlink("etc/alias", "../usr/bin/app").unwrap();
    tree.add_symlink("usr/bin/app-link", "app").unwrap();
    tree
}

#[test]
fn host_directory_round_trips() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("pkg");
    fs::create_dir_all(src.join("srv/www")).unwrap();
    fs::create_dir_all(src.join("tmp")).unwrap();
    fs::write(src.join("srv/www/index.html"), b"<h1>hi</h1>").unwrap();
    fs::write(src.join("srv/blob"), pattern(20 * BLOCK + 5, 3)).unwrap();
    fs::write(src.join("zero"), b"").unwrap();
    std::os::unix::fs::symlink("srv/www/index.html", src.join("index")).unwrap();
    std::os::unix::fs::symlink("../blob", src.join("srv/www/blob")).unwrap();
    fs::write(
        src.join("vimg.toml"),
        "[vm]\nname = \"demo\"\nkernel = \"6.1.0\"\n\n[system]\nhostname = \"demo\"\n\n[[program]]\nbinary = \"/srv/run\"\n",
    )
    .unwrap();

    let package = DirPackage::new(&src).unwrap();
    let out = temp.path().join("demo.img");
    let report = build_package(&package, ImageFormat::Raw, &out).unwrap();
    assert_eq!(report.kernel_version, "6.1.0");

    let mut image = Image::open(&out).unwrap();
    let dest = temp.path().join("decompiled");
    decompile(&mut image, &dest, DecompileOptions::default(), &NullLogger).unwrap();

    let mut expected = snapshot(&src);
    expected.remove("vimg.toml");
    assert_eq!(snapshot(&dest), expected);
}

#[test]
fn every_format_round_trips() {
    for format in ImageFormat::ALL {
        let temp = TempDir::new().unwrap();
        let out = build_tree(&temp, sample_tree(), format);

        let mut image = Image::open(&out).unwrap();
        assert_eq!(image.format(), format, "detected format of {format}");
        let dest = temp.path().join("out");
        let report =
            decompile(&mut image, &dest, DecompileOptions::default(), &NullLogger).unwrap();
        assert_eq!(report.files, 3, "{format}");
        assert_eq!(report.symlinks, 2, "{format}");

        assert_eq!(fs::read(dest.join("etc/hostname")).unwrap(), b"demo\n");
        assert_eq!(fs::read(dest.join("etc/alias")).unwrap(), pattern(3 * BLOCK + 17, 9));
        assert_eq!(
            fs::read_link(dest.join("usr/bin/app-link")).unwrap(),
            Path::new("app")
        );
        assert!(dest.join("var/log").is_dir());
    }
}

#[test]
fn gpt_backup_mirrors_primary() {
    let temp = TempDir::new().unwrap();
    let out = build_tree(&temp, sample_tree(), ImageFormat::Raw);
    let mut image = Image::open(&out).unwrap();

    let sectors = image.size() / SECTOR_SIZE;
    let primary = image.gpt_header().unwrap();
    let backup = image.backup_gpt_header().unwrap();
    assert_eq!(primary.current_lba, 1);
    assert_eq!(primary.backup_lba, sectors - 1);
    assert_eq!(backup.current_lba, sectors - 1);
    assert_eq!(backup.backup_lba, 1);
    assert_eq!(primary.entries_crc32, backup.entries_crc32);
    assert_eq!(primary.disk_guid, backup.disk_guid);

    let os = image.gpt_entry(OS_PARTITION).unwrap();
    let root = image.gpt_entry(ROOT_PARTITION).unwrap();
    assert!(os.first_lba >= primary.first_usable_lba);
    assert!(os.last_lba < root.first_lba);
    assert!(root.last_lba <= primary.last_usable_lba);
    assert_eq!(os.first_lba % 2048, 0);

    // The filesystem fits inside its partition.
    let sb = image.superblock(0).unwrap();
    assert!(u64::from(sb.blocks_count) * sb.block_size() <= root.byte_len());
}

#[test]
fn kernel_latest_picks_highest_version() {
    let temp = TempDir::new().unwrap();
    let out = build_tree(&temp, sample_tree(), ImageFormat::Raw);
    let mut image = Image::open(&out).unwrap();
    let names: Vec<_> = image
        .kernel_files()
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains(&"initrd.img".to_string()));
    assert_eq!(image.kernel_file("vmlinuz").unwrap(), vec![0xA5; 8192]);
}

#[test]
fn inode_sizes_are_exact() {
    let per = BLOCK / 4;
    let sizes = [
        0,
        1,
        BLOCK,
        12 * BLOCK,
        12 * BLOCK + 1,
        (12 + per) * BLOCK + 3,
    ];
    let mut tree = FileTree::new();
    for (i, size) in sizes.iter().enumerate() {
        tree.add_bytes(&format!("f{i}"), pattern(*size, i as u8)).unwrap();
    }
    let temp = TempDir::new().unwrap();
    let out = build_tree(&temp, tree, ImageFormat::Raw);
    let mut image = Image::open(&out).unwrap();

    for (i, size) in sizes.iter().enumerate() {
        let path = format!("/f{i}");
        let ino = image.resolve_path(&path).unwrap();
        let inode = image.read_inode(ino).unwrap();
        assert_eq!(inode.full_size(), *size as u64, "{path}");

        let mut data = Vec::new();
        image.cat(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), *size, "{path}");
        assert!(data == pattern(*size, i as u8), "{path} content");
    }
}

#[test]
fn readdir_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let out = build_tree(&temp, sample_tree(), ImageFormat::Qcow2);
    let mut first = Image::open(&out).unwrap();
    let mut second = Image::open(&out).unwrap();

    let a = first.readdir(ROOT_INO).unwrap();
    let b = first.readdir(ROOT_INO).unwrap();
    let c = second.readdir(ROOT_INO).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert_eq!(a[0].name, ".");
    assert_eq!(a[1].name, "..");
}

#[test]
fn zero_regions_stay_sparse() {
    let zeros = 48 * MIB;
    for format in [
        ImageFormat::Qcow2,
        ImageFormat::VhdDynamic,
        ImageFormat::Raw,
        ImageFormat::Vmdk,
        ImageFormat::StreamOptimizedVmdk,
    ] {
        let mut tree = FileTree::new();
        tree.add_bytes("data/zeros", vec![0_u8; zeros]).unwrap();
        tree.add_bytes("data/tail", b"end".to_vec()).unwrap();
        let temp = TempDir::new().unwrap();
        let out = build_tree(&temp, tree, format);

        let meta = fs::metadata(&out).unwrap();
        let mut image = Image::open(&out).unwrap();
        let logical = image.size();
        let stored = if format == ImageFormat::Raw {
            meta.blocks() * 512
        } else {
            meta.len()
        };
        assert!(
            stored < logical / 2,
            "{format}: {stored} bytes stored for a {logical} byte disk"
        );

        let mut data = Vec::new();
        image.cat("/data/zeros").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), zeros);
        assert!(data.iter().all(|b| *b == 0), "{format}");
        assert_eq!(image.md5("/data/tail").unwrap(), md5_of(b"end"));
    }
}

#[test]
fn unknown_format_lists_supported_names() {
    let err = ImageFormat::parse("vdi").unwrap_err();
    assert!(matches!(err, ImageError::UnknownFormat { .. }));
    assert!(err
        .to_string()
        .contains("raw, vmdk, stream-optimized-vmdk, vhd, vhd-dynamic, qcow2, xva"));
    assert_eq!(
        ImageFormat::parse("sparse").unwrap(),
        ImageFormat::StreamOptimizedVmdk
    );
}

#[test]
fn exact_disk_size_is_honoured() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("sized.img");
    let config = VmConfig {
        disk_size: DiskSize::Exact(64 * MIB as u64),
        ..VmConfig::default()
    };
    let package = MemoryPackage::new(config, sample_tree());
    let report = build_package(&package, ImageFormat::Vhd, &out).unwrap();
    assert_eq!(report.disk_size, 64 * MIB as u64);

    let mut image = Image::open(&out).unwrap();
    assert_eq!(image.format(), ImageFormat::Vhd);
    assert_eq!(image.size(), 64 * MIB as u64);
    assert_eq!(image.md5("/etc/hostname").unwrap(), md5_of(b"demo\n"));
}

#[test]
fn disk_smaller_than_contents_is_rejected() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("tiny.img");
    let config = VmConfig {
        disk_size: DiskSize::Exact(MIB as u64),
        ..VmConfig::default()
    };
    let package = MemoryPackage::new(config, sample_tree());
    let err = build_package(&package, ImageFormat::Raw, &out).unwrap_err();
    assert!(err.to_string().starts_with("disk: "));
    assert!(matches!(err.root(), ImageError::DiskTooSmall { .. }));
    assert!(!out.exists());
}

#[test]
fn scenario_a_ten_mib_file() {
    let mut tree = FileTree::new();
    tree.add_bytes("payload.bin", pattern(10 * MIB, 1)).unwrap();
    let temp = TempDir::new().unwrap();
    let out = build_tree(&temp, tree, ImageFormat::Raw);
    let mut image = Image::open(&out).unwrap();

    let du = image.du("/", false).unwrap();
    assert!(du.total >= 10 * MIB as u64);
    assert_eq!(du.total % BLOCK as u64, 0);

    let listing = image.list("/", false).unwrap();
    let file = listing.iter().find(|l| l.name == "payload.bin").unwrap();
    assert_eq!(file.size, 10 * MIB as u64);
}

#[test]
fn scenario_b_inode_quota_fails_before_output() {
    let mut tree = FileTree::new();
    for name in ["a", "b", "c"] {
        tree.add_bytes(name, name.as_bytes().to_vec()).unwrap();
    }
    let config = VmConfig {
        inodes: 1,
        ..VmConfig::default()
    };
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("quota.img");
    let package = MemoryPackage::new(config, tree);
    let err = build_package(&package, ImageFormat::Raw, &out).unwrap_err();
    assert!(matches!(err.root(), ImageError::InsufficientInodes { .. }));
    assert!(err.to_string().contains("filesystem"));
    assert!(!out.exists());
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn scenario_c_md5_matches_source() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("pkg");
    fs::create_dir_all(src.join("opt")).unwrap();
    let data = pattern(777_777, 42);
    fs::write(src.join("opt/data.bin"), &data).unwrap();

    let package = DirPackage::new(&src).unwrap();
    let out = temp.path().join("c.vmdk");
    build_package(&package, ImageFormat::Vmdk, &out).unwrap();

    let mut image = Image::open(&out).unwrap();
    let digest = image.md5("/opt/data.bin").unwrap();
    assert_eq!(digest, md5_of(&data));
}
