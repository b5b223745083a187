//! Error taxonomy for image building and introspection.
//!
//! Every fallible operation in the crate returns [`ImageError`]. Variants fall
//! into a small set of classes (see [`ErrorClass`]) so callers can tell a bad
//! request apart from a broken image or a failing disk:
//!
//! | Class | Variants |
//! |-------|----------|
//! | Validation | `UnknownFormat`, `InsufficientInodes`, `DiskTooSmall`, `FileTooLarge`, `SizeLimit`, `InvalidConfig`, `NotFound`, `NotADirectory`, `Unsupported` |
//! | Resource | `Io`, `Resource`, `KernelNotFound` |
//! | Format | `Format`, `Checksum` |
//! | Internal | `Internal` |
//! | Cancelled | `Cancelled` |
//!
//! `Stage` wraps another error with the build stage it came from and reports
//! the class of the wrapped error.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = ImageError> = std::result::Result<T, E>;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Resource,
    Format,
    Internal,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A host path could not be created, opened or read.
    #[error("'{}': {source}", .path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported image format '{name}'; supported formats: {}", .supported.join(", "))]
    UnknownFormat {
        name: String,
        supported: Vec<&'static str>,
    },

    #[error("not enough inodes: the file tree needs {required} but the inode quota is {quota}")]
    InsufficientInodes { required: u64, quota: u64 },

    #[error(
        "disk too small: need at least {required} bytes but {requested} were requested ({shortfall} bytes short)"
    )]
    DiskTooSmall {
        required: u64,
        requested: u64,
        shortfall: u64,
    },

    #[error("file '{path}' is {size} bytes, larger than the {max} bytes the filesystem can address")]
    FileTooLarge { path: String, size: u64, max: u64 },

    #[error("{format} cannot represent a {size} byte disk (limit is {max} bytes)")]
    SizeLimit {
        format: &'static str,
        size: u64,
        max: u64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("kernel '{version}' could not be resolved: {reason}")]
    KernelNotFound { version: String, reason: String },

    /// The bytes do not describe a valid image or filesystem.
    #[error("this does not look like a valid vimg image: {0}")]
    Format(String),

    #[error("{what} CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum {
        what: &'static str,
        stored: u32,
        computed: u32,
    },

    /// Layout arithmetic produced an impossible value. Always a bug.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<ImageError>,
    },
}

impl ImageError {
    pub fn format(detail: impl Into<String>) -> Self {
        Self::Format(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Resource {
            path: path.into(),
            source,
        }
    }

    /// Wrap `self` with the name of the stage that produced it.
    ///
    /// Cancellation passes through unwrapped so callers can match on it.
    pub fn in_stage(self, stage: &'static str) -> Self {
        match self {
            Self::Cancelled => Self::Cancelled,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownFormat { .. }
            | Self::InsufficientInodes { .. }
            | Self::DiskTooSmall { .. }
            | Self::FileTooLarge { .. }
            | Self::SizeLimit { .. }
            | Self::InvalidConfig(_)
            | Self::NotFound(_)
            | Self::NotADirectory(_)
            | Self::Unsupported(_) => ErrorClass::Validation,
            Self::Io(_) | Self::Resource { .. } | Self::KernelNotFound { .. } => {
                ErrorClass::Resource
            }
            Self::Format(_) | Self::Checksum { .. } => ErrorClass::Format,
            Self::Internal(_) => ErrorClass::Internal,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Stage { source, .. } => source.class(),
        }
    }

    /// The innermost error, with stage wrappers removed.
    pub fn root(&self) -> &ImageError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_keeps_class_and_root() {
        let err = ImageError::InsufficientInodes {
            required: 13,
            quota: 1,
        }
        .in_stage("filesystem");
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(matches!(err.root(), ImageError::InsufficientInodes { .. }));
        assert!(err.to_string().starts_with("filesystem: not enough inodes"));
    }

    #[test]
    fn cancellation_is_never_wrapped() {
        let err = ImageError::Cancelled.in_stage("disk");
        assert!(matches!(err, ImageError::Cancelled));
    }

    #[test]
    fn unknown_format_lists_supported_names() {
        let err = ImageError::UnknownFormat {
            name: "iso".into(),
            supported: vec!["raw", "qcow2"],
        };
        assert_eq!(
            err.to_string(),
            "unsupported image format 'iso'; supported formats: raw, qcow2"
        );
    }
}
