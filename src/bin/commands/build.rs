use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use vimg::build::{build_to_path, BuildOptions, CancelToken, KernelOptions};
use vimg::formats::ImageFormat;
use vimg::kernel::DirKernelResolver;
use vimg::logging::TracingLogger;
use vimg::package::DirPackage;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct BuildArgs {
    pub(crate) package: PathBuf,
    pub(crate) output: PathBuf,
    pub(crate) format: Option<ImageFormat>,
    pub(crate) kernel: Option<String>,
    pub(crate) kernel_dir: Option<PathBuf>,
    pub(crate) kernel_args: Vec<String>,
}

pub(crate) fn parse_build_args(args: &[String]) -> Result<BuildArgs> {
    let mut positional = Vec::new();
    let mut format = None;
    let mut kernel = None;
    let mut kernel_dir = None;
    let mut kernel_args = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("`{flag}` needs a value"))
        };
        match arg.as_str() {
            "--format" => {
                let name = value("--format")?;
                format = Some(ImageFormat::parse(&name)?);
            }
            "--kernel" => kernel = Some(value("--kernel")?),
            "--kernel-dir" => kernel_dir = Some(PathBuf::from(value("--kernel-dir")?)),
            "--arg" => kernel_args.push(value("--arg")?),
            flag if flag.starts_with("--") => bail!("unknown build option '{flag}'"),
            _ => positional.push(arg),
        }
    }

    match positional.as_slice() {
        [package, output] => Ok(BuildArgs {
            package: PathBuf::from(package.as_str()),
            output: PathBuf::from(output.as_str()),
            format,
            kernel,
            kernel_dir,
            kernel_args,
        }),
        _ => bail!(crate::usage()),
    }
}

/// `--format` wins; otherwise the output extension decides, defaulting to raw.
pub(crate) fn format_for(output: &Path, explicit: Option<ImageFormat>) -> ImageFormat {
    if let Some(format) = explicit {
        return format;
    }
    match output.extension().and_then(|e| e.to_str()) {
        Some("vmdk") => ImageFormat::Vmdk,
        Some("vhd") => ImageFormat::Vhd,
        Some("qcow2") => ImageFormat::Qcow2,
        Some("xva") => ImageFormat::Xva,
        _ => ImageFormat::Raw,
    }
}

pub(crate) fn run(args: &[String]) -> Result<()> {
    let args = parse_build_args(args)?;
    let format = format_for(&args.output, args.format);

    let kernel_dir = match args.kernel_dir.clone() {
        Some(dir) => dir,
        None => DirKernelResolver::default_root()
            .context("no cache directory on this host; pass --kernel-dir")?,
    };
    let resolver = DirKernelResolver::new(kernel_dir);
    let package = DirPackage::new(&args.package)
        .with_context(|| format!("opening package '{}'", args.package.display()))?;

    let opts = BuildOptions {
        package: &package,
        format,
        kernel: KernelOptions {
            resolver: &resolver,
            version: args.kernel.clone(),
            extra_args: args.kernel_args.clone(),
        },
        logger: &TracingLogger,
        timestamp: None,
    };
    let report = build_to_path(&CancelToken::new(), &args.output, &opts).with_context(|| {
        format!(
            "building '{}' into '{}'",
            args.package.display(),
            args.output.display()
        )
    })?;

    println!(
        "[build:{}] {} ({} byte disk, kernel {}, {} inodes)",
        report.format,
        args.output.display(),
        report.disk_size,
        report.kernel_version,
        report.inodes
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn flags_and_positionals_mix() {
        let parsed = parse_build_args(&strings(&[
            "--arg", "quiet", "app", "--format", "sparse", "out.vmdk", "--arg", "ro",
        ]))
        .unwrap();
        assert_eq!(parsed.package, PathBuf::from("app"));
        assert_eq!(parsed.output, PathBuf::from("out.vmdk"));
        assert_eq!(parsed.format, Some(ImageFormat::StreamOptimizedVmdk));
        assert_eq!(parsed.kernel_args, vec!["quiet", "ro"]);
    }

    #[test]
    fn missing_value_and_unknown_flag_fail() {
        assert!(parse_build_args(&strings(&["app", "out", "--kernel"])).is_err());
        assert!(parse_build_args(&strings(&["app", "out", "--fast"])).is_err());
        assert!(parse_build_args(&strings(&["app"])).is_err());
    }

    #[test]
    fn extension_picks_format() {
        assert_eq!(format_for(Path::new("a.qcow2"), None), ImageFormat::Qcow2);
        assert_eq!(format_for(Path::new("a.img"), None), ImageFormat::Raw);
        assert_eq!(
            format_for(Path::new("a.img"), Some(ImageFormat::Xva)),
            ImageFormat::Xva
        );
    }
}
