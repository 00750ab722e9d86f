//! Random-access reads over a fixed-size-block backing store.

use libc::ioctl;
use std::ffi::c_long;
use std::fs;
use std::fs::File;
use std::io;
use std::io::Error;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of disk in number of sectors.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// A read-only byte-addressable store divided into fixed-size blocks.
///
/// `read_blocks` is the only primitive; `read` builds byte-granular access
/// on top of it and is what the walkers use.
pub trait Disk {
    /// Returns the size of a device block in bytes.
    fn block_size(&self) -> usize;

    /// Reads whole blocks starting at `block_index`.
    ///
    /// `buf` must hold a whole number of blocks; a read past the end of the
    /// image fails.
    fn read_blocks(&self, buf: &mut [u8], block_index: u64) -> io::Result<()>;

    /// Reads `buf.len()` bytes at the absolute byte offset `offset`.
    ///
    /// The request is split into a left partial block, whole middle blocks
    /// read straight into `buf`, and a right partial block. The partial
    /// edges go through a scratch block.
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let bs = self.block_size();
        let mut scratch = vec![0u8; bs];

        // First block boundary at or after `offset`
        let middle_block = offset.div_ceil(bs as u64);
        let left = (middle_block * bs as u64 - offset) as usize;

        // Request contained in a single block
        if left >= buf.len() && left > 0 {
            self.read_blocks(&mut scratch, middle_block - 1)?;
            buf.copy_from_slice(&scratch[(bs - left)..(bs - left + buf.len())]);
            return Ok(());
        }

        if left > 0 {
            self.read_blocks(&mut scratch, middle_block - 1)?;
            buf[..left].copy_from_slice(&scratch[(bs - left)..]);
        }

        let middle_count = (buf.len() - left) / bs;
        self.read_blocks(&mut buf[left..(left + middle_count * bs)], middle_block)?;

        let right = (buf.len() - left) % bs;
        if right > 0 {
            self.read_blocks(&mut scratch, middle_block + middle_count as u64)?;
            let len = buf.len();
            buf[(len - right)..].copy_from_slice(&scratch[..right]);
        }

        Ok(())
    }
}

/// A volume image backed by a regular file or a block device.
pub struct ImageFile {
    file: File,
}

impl ImageFile {
    /// Opens the image at `path` for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }
}

impl Disk for ImageFile {
    fn block_size(&self) -> usize {
        512
    }

    fn read_blocks(&self, buf: &mut [u8], block_index: u64) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.file
            .read_exact_at(buf, block_index * self.block_size() as u64)
    }
}

/// Returns the number of sectors in the image at the given path.
pub fn image_sectors(path: &Path) -> io::Result<u64> {
    let mut size = 0u64;

    let metadata = fs::metadata(path)?;
    let file_type = metadata.file_type();

    if file_type.is_block_device() || file_type.is_char_device() {
        let dev = File::open(path)?;

        let ret = unsafe { ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }

        Ok(size / 512)
    } else if file_type.is_file() {
        Ok(metadata.len() / 512)
    } else {
        Ok(0)
    }
}


#[cfg(test)]
mod test {
    use super::testutil::MemDisk;
    use super::*;
    use std::io::Write;

    fn patterned(len: usize) -> MemDisk {
        let mut disk = MemDisk::new(len);
        for (i, b) in disk.data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        disk
    }

    #[test]
    fn read_zero_size() {
        let disk = patterned(1024);
        let mut buf = [];
        disk.read(&mut buf, 123).unwrap();
    }

    #[test]
    fn read_within_one_block() {
        let disk = patterned(2048);
        let mut buf = [0u8; 16];
        disk.read(&mut buf, 600).unwrap();
        assert_eq!(&buf[..], &disk.data[600..616]);
    }

    #[test]
    fn read_unaligned_spanning_blocks() {
        let disk = patterned(8192);
        let mut buf = vec![0u8; 2000];
        disk.read(&mut buf, 700).unwrap();
        assert_eq!(&buf[..], &disk.data[700..2700]);
    }

    #[test]
    fn read_aligned() {
        let disk = patterned(4096);
        let mut buf = vec![0u8; 1024];
        disk.read(&mut buf, 1024).unwrap();
        assert_eq!(&buf[..], &disk.data[1024..2048]);
    }

    #[test]
    fn read_past_end_fails() {
        let disk = patterned(1024);
        let mut buf = [0u8; 64];
        assert!(disk.read(&mut buf, 1000).is_err());
    }

    #[test]
    fn image_file_read() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        tmp.write_all(&data).unwrap();

        let image = ImageFile::open(tmp.path()).unwrap();
        let mut buf = [0u8; 100];
        image.read(&mut buf, 500).unwrap();
        assert_eq!(&buf[..], &data[500..600]);

        assert_eq!(image_sectors(tmp.path()).unwrap(), 8);
    }
}
