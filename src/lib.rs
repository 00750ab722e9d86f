//! Read-only forensic scanner for raw ext2/3/4 and NTFS volume images.
//!
//! The crate walks a filesystem's allocation metadata (ext group descriptors
//! and inode bitmaps, the NTFS `$MFT` through `$Bitmap`) and reports, for
//! every allocated file, the contiguous physical extents backing it along
//! with per-file metadata. It never interprets directory trees and never
//! writes to the image.

use std::env;
use std::env::ArgsOs;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;

pub mod device;
pub mod error;
pub mod ext;
pub mod ntfs;
pub mod probe;
pub mod sink;

/// Returns the command's name along with an iterator over the command's arguments.
pub fn args() -> (String, ArgsOs) {
    let mut args = env::args_os();
    let bin = args
        .next()
        .map(PathBuf::from)
        .and_then(|p| {
            p.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| {
            error("fsmap", "missing binary name");
        });
    (bin, args)
}

/// Writes an error to stderr, then exits.
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}
