//! Filesystem detection and walker selection.

use crate::device::Disk;
use crate::error::ScanError;
use crate::ext::ExtWalker;
use crate::ntfs::NtfsWalker;
use crate::sink::Extent;
use crate::sink::Metadata;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use std::io;

/// The ext superblock signature, at offset `1024 + 0x38`.
const EXT_SIGNATURE: u16 = 0xef53;
/// The NTFS boot sector OEM signature, at offset 3.
const NTFS_SIGNATURE: &[u8; 4] = b"NTFS";

/// The walker for the detected filesystem.
///
/// Exactly one concrete walker is held; it owns the device for the scan's
/// lifetime.
pub enum Walker<D: Disk> {
    Ext(ExtWalker<D>),
    Ntfs(NtfsWalker<D>),
}

impl<D: Disk> Walker<D> {
    /// Walks every allocated file, reporting extents and metadata through
    /// the two callbacks.
    pub fn parse<B, M>(&self, on_extent: &mut B, on_metadata: &mut M) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
        M: FnMut(&Metadata),
    {
        match self {
            Self::Ext(walker) => walker.parse(on_extent, on_metadata),
            Self::Ntfs(walker) => walker.parse(on_extent, on_metadata),
        }
    }
}

/// Detects the image's filesystem and prepares the matching walker.
///
/// Both signatures are checked against the same image, ext first. An ext
/// probe read that fails only because the image is shorter than the ext
/// superblock still falls through to the NTFS check.
pub fn probe<D: Disk>(disk: D) -> Result<Walker<D>, ScanError> {
    let mut ext_sig = [0u8; 2];
    match disk.read(&mut ext_sig, 1024 + 0x38) {
        Ok(()) => {
            if LittleEndian::read_u16(&ext_sig) == EXT_SIGNATURE {
                debug!("found ext");
                return Ok(Walker::Ext(ExtWalker::new(disk)?));
            }
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
        Err(e) => return Err(e.into()),
    }

    let mut ntfs_sig = [0u8; 4];
    disk.read(&mut ntfs_sig, 3)?;
    if &ntfs_sig == NTFS_SIGNATURE {
        debug!("found ntfs");
        return Ok(Walker::Ntfs(NtfsWalker::new(disk)?));
    }

    Err(ScanError::unsupported("unknown filesystem"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::testutil::MemDisk;

    #[test]
    fn unknown_filesystem_rejected() {
        let disk = MemDisk::new(8192);
        assert!(matches!(probe(disk), Err(ScanError::Unsupported(_))));
    }

    #[test]
    fn ext_signature_selects_ext() {
        let mut disk = MemDisk::new(64 * 1024);
        {
            let d = &mut disk.data;
            LittleEndian::write_u16(&mut d[1024 + 0x38..], EXT_SIGNATURE);
            LittleEndian::write_u32(&mut d[1024 + 0x18..], 2); // block size
            LittleEndian::write_u32(&mut d[1024 + 0x04..], 16); // blocks
            LittleEndian::write_u32(&mut d[1024 + 0x20..], 16); // blocks per group
            LittleEndian::write_u32(&mut d[1024 + 0x28..], 16); // inodes per group
        }
        assert!(matches!(probe(disk), Ok(Walker::Ext(_))));
    }

    #[test]
    fn short_image_still_probes_ntfs() {
        // shorter than the ext superblock, carrying the NTFS signature
        let mut disk = MemDisk::new(512);
        disk.data[3..7].copy_from_slice(NTFS_SIGNATURE);
        LittleEndian::write_u16(&mut disk.data[11..], 512);
        disk.data[13] = 8;
        LittleEndian::write_u64(&mut disk.data[48..], 1); // MFT cluster
        disk.data[64] = (-10i8) as u8;
        disk.data[68] = (-12i8) as u8;
        // the MFT load then fails on the truncated image, but the probe
        // must have dispatched to NTFS rather than dying on the ext read
        assert!(matches!(probe(disk), Err(ScanError::Io(_))));
    }
}
