use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::Path;
use time::OffsetDateTime;
use vimg::ext::InodeKind;
use vimg::formats::ImageFormat;
use vimg::inspect::query::{hex, mode_string};
use vimg::inspect::{self, DecompileOptions, Image};
use vimg::logging::TracingLogger;

fn open(image: &str) -> Result<Image> {
    Image::open(Path::new(image)).with_context(|| format!("opening image '{image}'"))
}

fn timestamp(secs: u32) -> String {
    OffsetDateTime::from_unix_timestamp(i64::from(secs))
        .map(|t| t.to_string())
        .unwrap_or_else(|_| secs.to_string())
}

pub(crate) fn formats() -> Result<()> {
    for format in ImageFormat::ALL {
        println!("{format}");
    }
    Ok(())
}

pub(crate) fn gpt(image: &str) -> Result<()> {
    let mut img = open(image)?;
    let header = img.gpt_header().context("reading primary GPT header")?;
    let backup = img.backup_gpt_header().context("reading backup GPT header")?;
    println!("format:        {}", img.format());
    println!("disk size:     {} bytes", img.size());
    println!("disk guid:     {}", header.disk_guid);
    println!("usable lbas:   {}..={}", header.first_usable_lba, header.last_usable_lba);
    println!("backup header: lba {}", backup.current_lba);
    for (index, entry) in img.gpt_entries()?.iter().enumerate() {
        println!(
            "{:>3}  {:<12} lba {:>10}..={:<10} {:>12} bytes  {}",
            index + 1,
            entry.name,
            entry.first_lba,
            entry.last_lba,
            entry.byte_len(),
            entry.type_guid
        );
    }
    Ok(())
}

pub(crate) fn fs(image: &str) -> Result<()> {
    let mut img = open(image)?;
    let sb = img.superblock(0).context("reading superblock")?;
    println!("volume:        {}", sb.volume_name);
    println!("block size:    {}", sb.block_size());
    println!("blocks:        {} ({} free)", sb.blocks_count, sb.free_blocks_count);
    println!("inodes:        {} ({} free)", sb.inodes_count, sb.free_inodes_count);
    println!("groups:        {}", sb.group_count());
    println!("inode size:    {}", sb.inode_size());
    println!("written:       {}", timestamp(sb.wtime));
    Ok(())
}

pub(crate) fn ls(image: &str, path: &str, all: bool) -> Result<()> {
    let mut img = open(image)?;
    let rows = img
        .list(path, all)
        .with_context(|| format!("listing '{path}'"))?;
    for row in rows {
        println!(
            "{} {:>5} {:>5} {:>12} {} {}",
            mode_string(row.mode),
            row.uid,
            row.gid,
            row.size,
            timestamp(row.mtime),
            row.name
        );
    }
    Ok(())
}

pub(crate) fn stat(image: &str, path: &str) -> Result<()> {
    let mut img = open(image)?;
    let st = img.stat(path).with_context(|| format!("stat '{path}'"))?;
    match &st.link_target {
        Some(target) => println!("  File: {} -> {target}", st.path),
        None => println!("  File: {}", st.path),
    }
    println!(
        "  Size: {:<12} Allocated: {:<12} Inode: {:<8} Links: {}",
        st.size, st.allocated, st.ino, st.links
    );
    println!(
        "Access: ({:04o}/{}) Uid: {} Gid: {}",
        st.mode & 0o7777,
        mode_string(st.mode),
        st.uid,
        st.gid
    );
    println!("Access: {}", timestamp(st.atime));
    println!("Modify: {}", timestamp(st.mtime));
    println!("Change: {}", timestamp(st.ctime));
    Ok(())
}

pub(crate) fn cat(image: &str, path: &str) -> Result<()> {
    let mut img = open(image)?;
    let mut reader = img.cat(path).with_context(|| format!("reading '{path}'"))?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    io::copy(&mut reader, &mut out).with_context(|| format!("writing '{path}' to stdout"))?;
    out.flush()?;
    Ok(())
}

pub(crate) fn tree(image: &str, path: &str) -> Result<()> {
    let mut img = open(image)?;
    let entries = img.tree(path).with_context(|| format!("walking '{path}'"))?;
    println!("{path}");
    for entry in entries {
        let name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
        let suffix = match entry.kind {
            InodeKind::Directory => "/",
            InodeKind::Symlink => "@",
            _ => "",
        };
        println!("{}{name}{suffix}", "  ".repeat(entry.depth + 1));
    }
    Ok(())
}

pub(crate) fn du(image: &str, path: &str, apparent: bool) -> Result<()> {
    let mut img = open(image)?;
    let summary = img
        .du(path, apparent)
        .with_context(|| format!("measuring '{path}'"))?;
    for (name, bytes) in &summary.entries {
        println!("{bytes:>14}  {name}");
    }
    println!("{:>14}  total", summary.total);
    Ok(())
}

pub(crate) fn md5(image: &str, path: &str) -> Result<()> {
    let mut img = open(image)?;
    let digest = img.md5(path).with_context(|| format!("hashing '{path}'"))?;
    println!("{}  {path}", hex(&digest));
    Ok(())
}

pub(crate) fn cp(image: &str, path: &str, dest: &str) -> Result<()> {
    let mut img = open(image)?;
    img.copy_out(path, Path::new(dest), &TracingLogger)
        .with_context(|| format!("copying '{path}' to '{dest}'"))
}

pub(crate) fn kernel_files(image: &str) -> Result<()> {
    let mut img = open(image)?;
    for entry in img.kernel_files().context("reading boot partition")? {
        println!("{:>12}  {}", entry.size, entry.name);
    }
    Ok(())
}

pub(crate) fn decompile(image: &str, dest: &str, touched_only: bool) -> Result<()> {
    let mut img = open(image)?;
    let report = inspect::decompile(
        &mut img,
        Path::new(dest),
        DecompileOptions { touched_only },
        &TracingLogger,
    )
    .with_context(|| format!("decompiling '{image}' into '{dest}'"))?;
    println!(
        "[decompile] {dest}: {} dirs, {} files, {} symlinks, {} skipped",
        report.dirs, report.files, report.symlinks, report.skipped
    );
    Ok(())
}
