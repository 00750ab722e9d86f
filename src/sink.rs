//! Emission records handed to the caller's sinks.
//!
//! The walkers report their findings through two plain callbacks: one per
//! contiguous extent, one per file's metadata. The records below carry the
//! fields; formatting them (the CSV lines of the command-line tool) is the
//! caller's business.

use std::fmt;

/// Identifies the file a record belongs to.
///
/// Formats as the decimal inode number for ext and as `base:type` (base file
/// record number and attribute type id) for NTFS.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileId {
    /// An ext inode.
    Inode(u32),
    /// An NTFS attribute, keyed by its base file record.
    MftAttr {
        /// The base file record number.
        base_fr: u64,
        /// The attribute type id (128 for `$DATA`).
        type_id: u32,
    },
}

impl fmt::Display for FileId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inode(n) => write!(fmt, "{n}"),
            Self::MftAttr { base_fr, type_id } => write!(fmt, "{base_fr}:{type_id}"),
        }
    }
}

/// One contiguous physical run backing part of a file.
///
/// Offsets and length are in blocks for ext and in clusters for NTFS.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Extent {
    pub file: FileId,
    /// The file's (or attribute's) size in bytes.
    pub file_size: u64,
    /// Logical offset of the run within the file.
    pub start_offset: u32,
    /// Physical offset of the run on the volume.
    pub start_phys_offset: u32,
    /// Length of the run.
    pub length: i32,
}

/// Per-file metadata.
///
/// Timestamps are in nanoseconds since the Unix epoch for ext and raw
/// `$STANDARD_INFORMATION` values for NTFS.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Metadata {
    pub inode: u32,
    pub file_size: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
}
