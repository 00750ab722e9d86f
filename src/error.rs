//! Error type shared by the probe and both filesystem walkers.

use std::io;
use thiserror::Error;

/// An unrecoverable scan failure.
///
/// Every variant aborts the scan: no per-inode or per-record recovery is
/// attempted, a single damaged structure terminates parsing.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The image is intact but uses something this scanner does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// An on-disk structure contradicts the filesystem format.
    #[error("corrupted filesystem: {0}")]
    Corruption(String),
    /// A read was requested past the end of the structure that backs it.
    #[error("out of bounds: {0}")]
    Bounds(String),
    /// The backing image could not be read.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ScanError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    pub fn bounds(msg: impl Into<String>) -> Self {
        Self::Bounds(msg.into())
    }
}
