//! Walker for the `ext2`/`ext3`/`ext4` family.
//!
//! The walker iterates group descriptors and inode bitmaps, then projects
//! every allocated inode's logical blocks onto physical blocks, either
//! through the extent tree or through the classic indirect block map.
//! Contiguous physical runs are coalesced before emission.

use crate::device::Disk;
use crate::error::ScanError;
use crate::sink::Extent;
use crate::sink::FileId;
use crate::sink::Metadata;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;

/// The offset of the superblock from the beginning of the device.
const SUPERBLOCK_OFFSET: u64 = 1024;

/// Required feature: Directory entries have a type field.
const INCOMPAT_FILETYPE: u32 = 0x2;
/// Required feature: Filesystem needs to replay its journal.
const INCOMPAT_RECOVER: u32 = 0x4;
/// Required feature: Group descriptors are stored per meta-block-group.
const INCOMPAT_META_BG: u32 = 0x10;
/// Required feature: Inodes may use extent trees.
const INCOMPAT_EXTENTS: u32 = 0x40;
/// Required feature: Filesystem uses 64-bit block counts.
const INCOMPAT_64BIT: u32 = 0x80;
/// Required feature: Flexible block groups.
const INCOMPAT_FLEX_BG: u32 = 0x200;
/// Required feature: Small files are stored inside their inode.
const INCOMPAT_INLINE_DATA: u32 = 0x8000;

/// The required features the walker can scan through.
const INCOMPAT_SUPPORTED: u32 = INCOMPAT_FILETYPE
    | INCOMPAT_META_BG
    | INCOMPAT_RECOVER
    | INCOMPAT_EXTENTS
    | INCOMPAT_64BIT
    | INCOMPAT_FLEX_BG
    | INCOMPAT_INLINE_DATA;

/// Group descriptor flag: the group's inode table and bitmap are not initialized.
const BG_INODE_UNINIT: u16 = 0x1;

/// Inode flag: the file's content is compressed.
const INODE_FLAG_COMPRESSED: u32 = 0x4;
/// Inode flag: the inode maps its blocks with an extent tree.
const INODE_FLAG_EXTENTS: u32 = 0x80000;
/// Inode flag: the inode's data is stored inline, there are no blocks.
const INODE_FLAG_INLINE_DATA: u32 = 0x10000000;

/// An extent whose length exceeds this value is uninitialized; its actual
/// length is `ee_len - EXT_INIT_MAX_LEN`.
const EXT_INIT_MAX_LEN: u16 = 32768;

/// The fields of the on-disk superblock the walker consumes.
struct Superblock {
    /// Total number of inodes.
    inodes_count: u32,
    /// Total number of blocks, lower 32 bits.
    blocks_count_lo: u32,
    /// The first data block (1 when the block size is 1024, else 0).
    first_data_block: u32,
    /// log2(block size) - 10.
    log_block_size: u32,
    /// Number of blocks per block group.
    blocks_per_group: u32,
    /// Number of inodes per block group.
    inodes_per_group: u32,
    /// Revision level; 0 uses fixed inode size and no feature bitmaps.
    rev_level: u32,
    /// Size of the inode structure in bytes.
    inode_size: u16,
    /// Compatible feature set.
    feature_compat: u32,
    /// Incompatible feature set.
    feature_incompat: u32,
    /// Read-only compatible feature set.
    feature_ro_compat: u32,
    /// Size of a group descriptor; effective only with the 64BIT feature.
    desc_size: u16,
    /// First meta-block-group.
    first_meta_bg: u32,
    /// Total number of blocks, upper 32 bits.
    blocks_count_hi: u32,
    /// log2(number of groups per flex group).
    log_groups_per_flex: u8,
    /// Lifetime kilobytes written to the filesystem.
    kbytes_written: u64,
}

impl Superblock {
    /// Decodes the superblock from its on-disk layout.
    fn parse(buf: &[u8]) -> Self {
        Self {
            inodes_count: LittleEndian::read_u32(&buf[0x00..]),
            blocks_count_lo: LittleEndian::read_u32(&buf[0x04..]),
            first_data_block: LittleEndian::read_u32(&buf[0x14..]),
            log_block_size: LittleEndian::read_u32(&buf[0x18..]),
            blocks_per_group: LittleEndian::read_u32(&buf[0x20..]),
            inodes_per_group: LittleEndian::read_u32(&buf[0x28..]),
            rev_level: LittleEndian::read_u32(&buf[0x4c..]),
            inode_size: LittleEndian::read_u16(&buf[0x58..]),
            feature_compat: LittleEndian::read_u32(&buf[0x5c..]),
            feature_incompat: LittleEndian::read_u32(&buf[0x60..]),
            feature_ro_compat: LittleEndian::read_u32(&buf[0x64..]),
            desc_size: LittleEndian::read_u16(&buf[0xfe..]),
            first_meta_bg: LittleEndian::read_u32(&buf[0x104..]),
            blocks_count_hi: LittleEndian::read_u32(&buf[0x150..]),
            log_groups_per_flex: buf[0x174],
            kbytes_written: LittleEndian::read_u64(&buf[0x178..]),
        }
    }
}

/// The fields of a group descriptor the walker consumes.
struct GroupDesc {
    /// Block of the inode allocation bitmap.
    inode_bitmap: u64,
    /// First block of the inode table.
    inode_table: u64,
    /// Group flags.
    flags: u16,
}

impl GroupDesc {
    /// Decodes a group descriptor.
    ///
    /// The upper halves of the block addresses only exist when the
    /// descriptor is the 64-bit variant.
    fn parse(buf: &[u8], wide: bool) -> Self {
        let mut inode_bitmap = u64::from(LittleEndian::read_u32(&buf[0x04..]));
        let mut inode_table = u64::from(LittleEndian::read_u32(&buf[0x08..]));
        if wide {
            inode_bitmap |= u64::from(LittleEndian::read_u32(&buf[0x24..])) << 32;
            inode_table |= u64::from(LittleEndian::read_u32(&buf[0x28..])) << 32;
        }
        Self {
            inode_bitmap,
            inode_table,
            flags: LittleEndian::read_u16(&buf[0x12..]),
        }
    }
}

/// The fields of an on-disk inode the walker consumes.
struct Inode {
    /// Number of hard links; zero means the inode is dead.
    links_count: u16,
    /// File size in bytes, both halves composed.
    size: u64,
    /// Inode flags.
    flags: u32,
    /// Last metadata change time, seconds.
    ctime: i32,
    /// Last content change time, seconds.
    mtime: i32,
    /// Last access time, seconds.
    atime: i32,
    /// Size of the extra inode fields; the nanosecond fields exist from 24 on.
    extra_isize: u16,
    /// Extra change time bits (epoch and nanoseconds).
    ctime_extra: u32,
    /// Extra modification time bits.
    mtime_extra: u32,
    /// Extra access time bits.
    atime_extra: u32,
    /// The block map or extent tree root, `i_block[15]`.
    block: [u8; 60],
}

impl Inode {
    /// Decodes an inode. `buf` is the full on-disk inode record.
    fn parse(buf: &[u8]) -> Self {
        let mut block = [0u8; 60];
        block.copy_from_slice(&buf[0x28..0x64]);

        // The extra fields only exist on large inodes
        let (extra_isize, ctime_extra, mtime_extra, atime_extra) = if buf.len() >= 0x90 {
            (
                LittleEndian::read_u16(&buf[0x80..]),
                LittleEndian::read_u32(&buf[0x84..]),
                LittleEndian::read_u32(&buf[0x88..]),
                LittleEndian::read_u32(&buf[0x8c..]),
            )
        } else {
            (0, 0, 0, 0)
        };

        Self {
            links_count: LittleEndian::read_u16(&buf[0x1a..]),
            size: u64::from(LittleEndian::read_u32(&buf[0x04..]))
                | u64::from(LittleEndian::read_u32(&buf[0x6c..])) << 32,
            flags: LittleEndian::read_u32(&buf[0x20..]),
            ctime: LittleEndian::read_i32(&buf[0x0c..]),
            mtime: LittleEndian::read_i32(&buf[0x10..]),
            atime: LittleEndian::read_i32(&buf[0x08..]),
            extra_isize,
            ctime_extra,
            mtime_extra,
            atime_extra,
            block,
        }
    }
}

/// Converts an on-disk timestamp to nanoseconds since the Unix epoch.
///
/// The extra field carries the epoch extension in its low 2 bits and the
/// nanoseconds in the remaining 30.
fn timestamp_ns(seconds: i32, extra: Option<u32>) -> i64 {
    let mut ns = 1_000_000_000 * i64::from(seconds);
    if let Some(extra) = extra {
        ns += i64::from(extra & 3) << 32;
        ns += i64::from(extra >> 2);
    }
    ns
}

/// Tracks the open physical run while walking a file's logical blocks.
///
/// All values are in blocks. `start_phys == 0` means no run is open; the
/// first filesystem blocks hold the superblock, so zero is never a valid
/// file block.
#[derive(Default)]
struct RunAcc {
    /// The current logical block.
    curr: u32,
    /// The logical block the open run starts at.
    start: u32,
    /// The physical block the open run starts at.
    start_phys: u64,
    /// The physical block the next extent must start at to extend the run.
    next_phys: u64,
}

impl RunAcc {
    /// Accounts for an extent of `len` blocks at physical block `phys`,
    /// either extending the open run or flushing it and opening a new one.
    fn extend<B: FnMut(&Extent)>(
        &mut self,
        file: FileId,
        file_size: u64,
        phys: u64,
        len: u32,
        emit: &mut B,
    ) {
        if phys == self.next_phys {
            self.next_phys += u64::from(len);
        } else {
            self.flush(file, file_size, emit);
            self.start = self.curr;
            self.start_phys = phys;
            self.next_phys = phys + u64::from(len);
        }
        self.curr += len;
    }

    /// Accounts for a hole of `len` blocks: flushes the open run and skips.
    fn hole<B: FnMut(&Extent)>(&mut self, file: FileId, file_size: u64, len: u32, emit: &mut B) {
        self.flush(file, file_size, emit);
        self.start_phys = 0;
        self.next_phys = 0;
        self.curr += len;
    }

    /// Emits the open run, if any.
    fn flush<B: FnMut(&Extent)>(&mut self, file: FileId, file_size: u64, emit: &mut B) {
        if self.start_phys != 0 {
            emit(&Extent {
                file,
                file_size,
                start_offset: self.start,
                start_phys_offset: self.start_phys as u32,
                length: (self.curr - self.start) as i32,
            });
        }
    }
}

/// Walker over an ext2/3/4 filesystem.
pub struct ExtWalker<D: Disk> {
    disk: D,
    blocks_count: u64,
    first_block: u32,
    block_size: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u32,
    feature_incompat: u32,
    desc_size: u16,
    /// First meta-block-group; the total group count when META_BG is absent.
    first_meta_bg: u32,
}

impl<D: Disk> ExtWalker<D> {
    /// Reads the superblock and prepares the walker.
    pub fn new(disk: D) -> Result<Self, ScanError> {
        let mut buf = vec![0u8; 1024];
        disk.read(&mut buf, SUPERBLOCK_OFFSET)?;
        let sb = Superblock::parse(&buf);

        if sb.log_block_size > 16 {
            return Err(ScanError::corruption("unreasonable block size"));
        }
        let block_size = 1u32 << (sb.log_block_size + 10);

        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(ScanError::corruption("empty block groups"));
        }
        if sb.inodes_per_group % 8 != 0 {
            return Err(ScanError::corruption(
                "inodes per group is not a multiple of 8",
            ));
        }

        let mut blocks_count = u64::from(sb.blocks_count_lo);
        let group_count = ((blocks_count.max(1) - 1) / u64::from(sb.blocks_per_group) + 1) as u32;

        let (inode_size, feature_compat, feature_incompat, feature_ro_compat) = if sb.rev_level != 0
        {
            (
                sb.inode_size,
                sb.feature_compat,
                sb.feature_incompat,
                sb.feature_ro_compat,
            )
        } else {
            (128, 0, 0, 0)
        };
        let desc_size = if feature_incompat & INCOMPAT_64BIT != 0 {
            sb.desc_size
        } else {
            32
        };
        let first_meta_bg = if feature_incompat & INCOMPAT_META_BG != 0 {
            sb.first_meta_bg
        } else {
            group_count
        };
        if feature_incompat & INCOMPAT_64BIT != 0 {
            blocks_count |= u64::from(sb.blocks_count_hi) << 32;
        }

        if feature_incompat & !INCOMPAT_SUPPORTED != 0 {
            return Err(ScanError::unsupported(format!(
                "incompatible ext features {:#x}",
                feature_incompat & !INCOMPAT_SUPPORTED
            )));
        }
        if desc_size < 32 {
            return Err(ScanError::corruption("group descriptor size below 32"));
        }
        if inode_size < 128 {
            return Err(ScanError::corruption("inode size below 128"));
        }

        debug!(
            "ext: {} inodes, {blocks_count} blocks of {block_size} bytes, rev {}, \
             features compat {feature_compat:#x} incompat {feature_incompat:#x} \
             ro_compat {feature_ro_compat:#x}, 2^{} groups per flex, {} KiB written",
            sb.inodes_count,
            sb.rev_level,
            sb.log_groups_per_flex,
            sb.kbytes_written,
        );

        Ok(Self {
            disk,
            blocks_count,
            first_block: sb.first_data_block,
            block_size,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_size: u32::from(inode_size),
            feature_incompat,
            desc_size,
            first_meta_bg,
        })
    }

    /// Walks every allocated inode, emitting extents and metadata.
    pub fn parse<B, M>(&self, on_extent: &mut B, on_metadata: &mut M) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
        M: FnMut(&Metadata),
    {
        let block_size = u64::from(self.block_size);
        let desc_size = u64::from(self.desc_size);
        let bg_per_metabg = block_size / desc_size;
        let meta_bg_start = if self.first_meta_bg != 0 {
            u64::from(self.first_meta_bg)
        } else {
            bg_per_metabg
        };

        let mut desc = vec![0u8; self.desc_size as usize];

        // Groups below the first meta-block-group use the global table right
        // after the superblock
        for bg in 0..meta_bg_start {
            self.disk.read(
                &mut desc,
                (u64::from(self.first_block) + 1) * block_size + bg * desc_size,
            )?;
            self.scan_group(&desc, bg as u32, on_extent, on_metadata)?;
        }

        // The remaining descriptors live in the first block of their own
        // meta-block-group
        let mut metabg_first_bg = meta_bg_start;
        while u64::from(self.blocks_per_group) * metabg_first_bg < self.blocks_count {
            let table =
                (1 + u64::from(self.first_block) + metabg_first_bg * u64::from(self.blocks_per_group))
                    * block_size;
            let mut bg = 0;
            while bg < bg_per_metabg
                && u64::from(self.blocks_per_group) * (metabg_first_bg + bg - 1) < self.blocks_count
            {
                self.disk.read(&mut desc, table + bg * desc_size)?;
                self.scan_group(&desc, (metabg_first_bg + bg) as u32, on_extent, on_metadata)?;
                bg += 1;
            }
            metabg_first_bg += bg_per_metabg;
        }

        Ok(())
    }

    /// Scans one group's inode bitmap and dispatches every allocated inode.
    fn scan_group<B, M>(
        &self,
        desc: &[u8],
        group_num: u32,
        on_extent: &mut B,
        on_metadata: &mut M,
    ) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
        M: FnMut(&Metadata),
    {
        let wide = self.feature_incompat & INCOMPAT_64BIT != 0 && self.desc_size > 32;
        let desc = GroupDesc::parse(desc, wide);
        if desc.flags & BG_INODE_UNINIT != 0 {
            return Ok(());
        }

        let block_size = u64::from(self.block_size);
        let bitmap_off = (u64::from(self.first_block) + desc.inode_bitmap) * block_size;
        let table_off = (u64::from(self.first_block) + desc.inode_table) * block_size;

        let chunk = usize::min(
            self.inodes_per_group as usize / 8,
            self.block_size as usize,
        );
        let mut bitmap = vec![0u8; chunk];
        let mut inode = vec![0u8; self.inode_size as usize];

        let mut k = 0;
        while 8 * k < self.inodes_per_group as usize {
            self.disk.read(&mut bitmap, bitmap_off + k as u64)?;
            for i in 0..chunk {
                if bitmap[i] == 0 {
                    continue;
                }
                for j in 0..8 {
                    if bitmap[i] & (1 << j) == 0 {
                        continue;
                    }
                    let bit_index = 8 * (k + i) + j;
                    self.disk.read(
                        &mut inode,
                        table_off + u64::from(self.inode_size) * bit_index as u64,
                    )?;
                    let inode_num = group_num * self.inodes_per_group + bit_index as u32 + 1;
                    self.scan_inode(&inode, inode_num, on_extent, on_metadata)?;
                }
            }
            k += chunk;
        }

        Ok(())
    }

    /// Projects one inode's logical blocks and emits its extents and metadata.
    fn scan_inode<B, M>(
        &self,
        buf: &[u8],
        inode_num: u32,
        on_extent: &mut B,
        on_metadata: &mut M,
    ) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
        M: FnMut(&Metadata),
    {
        let inode = Inode::parse(buf);
        if inode.links_count == 0 {
            return Ok(());
        }

        let extra = inode.extra_isize >= 24;
        on_metadata(&Metadata {
            inode: inode_num,
            file_size: inode.size,
            compressed: inode.flags & INODE_FLAG_COMPRESSED != 0,
            encrypted: false,
            ctime: timestamp_ns(inode.ctime, extra.then_some(inode.ctime_extra)),
            mtime: timestamp_ns(inode.mtime, extra.then_some(inode.mtime_extra)),
            atime: timestamp_ns(inode.atime, extra.then_some(inode.atime_extra)),
        });

        if inode.flags & INODE_FLAG_INLINE_DATA != 0 {
            // no blocks back this inode
            return Ok(());
        }

        let file = FileId::Inode(inode_num);
        let mut run = RunAcc::default();

        if inode.flags & INODE_FLAG_EXTENTS != 0 {
            let entries = LittleEndian::read_u16(&inode.block[2..]) as usize;
            let depth = LittleEndian::read_u16(&inode.block[6..]);
            if 12 * (entries + 1) > inode.block.len() {
                return Err(ScanError::corruption(
                    "extent root entry count overflows the inode",
                ));
            }
            for i in 1..=entries {
                self.walk_extent_entry(
                    &inode.block[12 * i..12 * i + 12],
                    depth,
                    &mut run,
                    file,
                    inode.size,
                    on_extent,
                )?;
            }
        } else {
            for record in 0..12 {
                if u64::from(run.curr) * u64::from(self.block_size) >= inode.size {
                    break;
                }
                self.walk_block_map(
                    LittleEndian::read_u32(&inode.block[4 * record..]),
                    0,
                    &mut run,
                    file,
                    inode.size,
                    on_extent,
                )?;
            }
            for depth in 1..=3 {
                if u64::from(run.curr) * u64::from(self.block_size) >= inode.size {
                    break;
                }
                self.walk_block_map(
                    LittleEndian::read_u32(&inode.block[4 * (11 + depth)..]),
                    depth as u32,
                    &mut run,
                    file,
                    inode.size,
                    on_extent,
                )?;
            }
        }

        run.flush(file, inode.size, on_extent);
        Ok(())
    }

    /// Walks one 12-byte extent tree entry at the given depth.
    ///
    /// Leaves feed the run accumulator; index entries recurse into the child
    /// node they point at, using the child's own depth.
    fn walk_extent_entry<B>(
        &self,
        entry: &[u8],
        depth: u16,
        run: &mut RunAcc,
        file: FileId,
        file_size: u64,
        on_extent: &mut B,
    ) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
    {
        if u64::from(run.curr) * u64::from(self.block_size) >= file_size {
            return Err(ScanError::bounds("extent tree extends past the file size"));
        }

        if depth == 0 {
            let len = LittleEndian::read_u16(&entry[4..]);
            if len <= EXT_INIT_MAX_LEN {
                let phys = u64::from(LittleEndian::read_u32(&entry[8..]))
                    | u64::from(LittleEndian::read_u16(&entry[6..])) << 32;
                run.extend(file, file_size, phys, u32::from(len), on_extent);
            } else {
                // uninitialized extent, a hole
                run.hole(file, file_size, u32::from(len - EXT_INIT_MAX_LEN), on_extent);
            }
            return Ok(());
        }

        let child = u64::from(LittleEndian::read_u32(&entry[4..]))
            | u64::from(LittleEndian::read_u16(&entry[8..])) << 32;
        let mut node = vec![0u8; self.block_size as usize];
        self.disk
            .read(&mut node, child * u64::from(self.block_size))?;

        let entries = LittleEndian::read_u16(&node[2..]) as usize;
        let child_depth = LittleEndian::read_u16(&node[6..]);
        if 12 * (entries + 1) > node.len() {
            return Err(ScanError::corruption(
                "extent node entry count overflows its block",
            ));
        }
        for i in 1..=entries {
            self.walk_extent_entry(
                &node[12 * i..12 * i + 12],
                child_depth,
                run,
                file,
                file_size,
                on_extent,
            )?;
        }
        Ok(())
    }

    /// Walks one classic block-map pointer of the given depth.
    ///
    /// A zero pointer stands for a hole covering the whole subtree,
    /// `(block_size / 4)^depth` logical blocks.
    fn walk_block_map<B>(
        &self,
        phys: u32,
        depth: u32,
        run: &mut RunAcc,
        file: FileId,
        file_size: u64,
        on_extent: &mut B,
    ) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
    {
        if u64::from(run.curr) * u64::from(self.block_size) >= file_size {
            return Err(ScanError::bounds("block map extends past the file size"));
        }

        if phys == 0 {
            let len = (u64::from(self.block_size) / 4).pow(depth);
            run.hole(file, file_size, len as u32, on_extent);
            return Ok(());
        }

        if depth == 0 {
            run.extend(file, file_size, u64::from(phys), 1, on_extent);
            return Ok(());
        }

        let mut block = vec![0u8; self.block_size as usize];
        self.disk
            .read(&mut block, u64::from(phys) * u64::from(self.block_size))?;
        for record in (0..block.len()).step_by(4) {
            if u64::from(run.curr) * u64::from(self.block_size) >= file_size {
                break;
            }
            self.walk_block_map(
                LittleEndian::read_u32(&block[record..]),
                depth - 1,
                run,
                file,
                file_size,
                on_extent,
            )?;
        }
        Ok(())
    }
}
