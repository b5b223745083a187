//! Build bootable VM disk images and take them apart again.
//!
//! `vimg` turns an application package (a `vimg.toml` configuration plus a
//! file tree) into a GPT disk holding a boot partition and an ext2 root
//! filesystem, then streams that disk into one of several container formats.
//! The read side parses the same structures straight from image bytes, so
//! images can be listed, checksummed and extracted without mounting them.
//!
//! # Architecture
//!
//! ```text
//! build:   PackageReader ──► tree ──► ext::builder ──► segment map
//!                                                         │
//!          KernelResolver ──► disk::boot ─────────────────┤
//!                                                         ▼
//!                                     disk::assemble (GPT) ──► formats::write_image
//!
//! inspect: file ──► formats::detect/open_reader ──► gpt ──► ext::reader ──► queries
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use vimg::build::{build_to_path, BuildOptions, CancelToken, KernelOptions};
//! use vimg::formats::ImageFormat;
//! use vimg::kernel::DirKernelResolver;
//! use vimg::logging::TracingLogger;
//! use vimg::package::DirPackage;
//!
//! let package = DirPackage::new("myapp")?;
//! let resolver = DirKernelResolver::new("/var/cache/vimg/kernels");
//! let opts = BuildOptions {
//!     package: &package,
//!     format: ImageFormat::Qcow2,
//!     kernel: KernelOptions { resolver: &resolver, version: None, extra_args: vec![] },
//!     logger: &TracingLogger,
//!     timestamp: None,
//! };
//! build_to_path(&CancelToken::new(), "myapp.qcow2".as_ref(), &opts)?;
//! ```

pub mod build;
pub mod codec;
pub mod config;
pub mod disk;
pub mod error;
pub mod ext;
pub mod formats;
pub mod gpt;
pub mod inspect;
pub mod kernel;
pub mod logging;
pub mod package;
pub mod segment;
pub mod source;
pub mod tree;

pub use error::{ImageError, Result};
pub use formats::ImageFormat;
pub use inspect::Image;
