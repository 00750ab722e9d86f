//! Walker for NTFS volumes.
//!
//! The walker loads the `$MFT` file record, then uses the MFT's own
//! `$Bitmap` attribute to enumerate live file records. Each record's
//! non-resident attributes are reported as one extent per runlist entry;
//! `$STANDARD_INFORMATION` feeds the metadata sink. Attributes split across
//! extension records are reassembled through `$ATTRIBUTE_LIST`.

use crate::device::Disk;
use crate::error::ScanError;
use crate::sink::Extent;
use crate::sink::FileId;
use crate::sink::Metadata;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use std::borrow::Cow;

/// Attribute type id: `$STANDARD_INFORMATION`.
const ATTR_STANDARD_INFORMATION: u32 = 16;
/// Attribute type id: `$ATTRIBUTE_LIST`.
const ATTR_ATTRIBUTE_LIST: u32 = 32;
/// Attribute type id: `$DATA`.
const ATTR_DATA: u32 = 128;
/// Attribute type id: `$BITMAP`.
const ATTR_BITMAP: u32 = 176;
/// Type id marking the end of a record's attribute list.
const ATTR_END: u32 = 0xffff_ffff;

/// Attribute flag: the attribute's content is compressed.
const ATTR_FLAG_COMPRESSED: u16 = 0x1;
/// Attribute flag: the attribute's content is encrypted.
const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;

/// `$STANDARD_INFORMATION` file flag: compressed.
const FILE_FLAG_COMPRESSED: u32 = 0x800;
/// `$STANDARD_INFORMATION` file flag: encrypted.
const FILE_FLAG_ENCRYPTED: u32 = 0x4000;

/// The `$Bitmap` attribute is consumed in chunks of this many bytes.
const BITMAP_CHUNK: usize = 512;

/// Reads the offset of a record's first attribute.
fn first_attr_offset(record: &[u8]) -> usize {
    LittleEndian::read_u16(&record[20..]) as usize
}

/// Reads a record's 48-bit base file record reference.
///
/// Zero means the record is a base record itself.
fn base_record(record: &[u8]) -> u64 {
    LittleEndian::read_uint(&record[32..], 6)
}

/// Verifies and removes the per-sector fixup tags of a file record.
///
/// The last two bytes of every sector must equal the tag at `fixup_offset`;
/// they are restored from the fixup array. A mismatch means a torn write.
fn apply_fixup(record: &mut [u8], sector_size: usize) -> Result<(), ScanError> {
    if &record[..4] == b"BAAD" {
        return Err(ScanError::unsupported("BAAD file record"));
    }

    let fixup_off = LittleEndian::read_u16(&record[4..]) as usize;
    let fixup_count = LittleEndian::read_u16(&record[6..]) as usize;
    let sectors = fixup_count.saturating_sub(1);
    if fixup_off + 2 + 2 * sectors > record.len() || sectors * sector_size > record.len() {
        return Err(ScanError::corruption("fixup array outside the record"));
    }

    for i in 0..sectors {
        let end = (i + 1) * sector_size;
        if record[end - 2..end] != record[fixup_off..fixup_off + 2] {
            return Err(ScanError::corruption("fixup tag mismatch"));
        }
        record[end - 2] = record[fixup_off + 2 + 2 * i];
        record[end - 1] = record[fixup_off + 3 + 2 * i];
    }
    Ok(())
}

/// The common header of one attribute within a file record.
struct Attr {
    /// Byte offset of the attribute within its record.
    offset: usize,
    type_id: u32,
    /// Total length of the attribute, header included.
    len: u32,
    non_resident: bool,
    name_len: u8,
    name_offset: u16,
    flags: u16,
    attr_id: u16,
}

impl Attr {
    /// Decodes the attribute at `offset`, or `None` on the end marker.
    fn at(record: &[u8], offset: usize) -> Result<Option<Self>, ScanError> {
        if offset + 4 > record.len() {
            return Err(ScanError::corruption("attribute walk left the record"));
        }
        let type_id = LittleEndian::read_u32(&record[offset..]);
        if type_id == ATTR_END {
            return Ok(None);
        }
        if offset + 16 > record.len() {
            return Err(ScanError::corruption("truncated attribute header"));
        }
        let len = LittleEndian::read_u32(&record[offset + 4..]);
        if len < 16 || offset + len as usize > record.len() {
            return Err(ScanError::corruption("attribute length outside the record"));
        }
        Ok(Some(Self {
            offset,
            type_id,
            len,
            non_resident: record[offset + 8] != 0,
            name_len: record[offset + 9],
            name_offset: LittleEndian::read_u16(&record[offset + 10..]),
            flags: LittleEndian::read_u16(&record[offset + 12..]),
            attr_id: LittleEndian::read_u16(&record[offset + 14..]),
        }))
    }

    /// Returns the attribute's UTF-16LE name bytes; empty when unnamed.
    fn name<'a>(&self, record: &'a [u8]) -> Result<&'a [u8], ScanError> {
        let start = self.offset + self.name_offset as usize;
        let end = start + 2 * self.name_len as usize;
        if self.name_len != 0 && end > self.offset + self.len as usize {
            return Err(ScanError::corruption("attribute name outside the attribute"));
        }
        Ok(&record[start..end])
    }

    /// Returns a resident attribute's content slice.
    fn resident_content<'a>(&self, record: &'a [u8]) -> Result<&'a [u8], ScanError> {
        if self.len < 24 {
            return Err(ScanError::corruption("truncated resident attribute"));
        }
        let size = LittleEndian::read_u32(&record[self.offset + 16..]) as usize;
        let start = self.offset + LittleEndian::read_u16(&record[self.offset + 20..]) as usize;
        let end = start
            .checked_add(size)
            .ok_or_else(|| ScanError::bounds("resident content size overflow"))?;
        if end > self.offset + self.len as usize {
            return Err(ScanError::corruption("resident content outside the attribute"));
        }
        Ok(&record[start..end])
    }

    /// Returns a non-resident attribute's first VCN.
    fn start_vcn(&self, record: &[u8]) -> Result<u64, ScanError> {
        if self.len < 64 {
            return Err(ScanError::corruption("truncated non-resident attribute"));
        }
        Ok(LittleEndian::read_u64(&record[self.offset + 16..]))
    }

    /// Returns a non-resident attribute's actual content size in bytes.
    fn actual_content_size(&self, record: &[u8]) -> Result<u64, ScanError> {
        if self.len < 64 {
            return Err(ScanError::corruption("truncated non-resident attribute"));
        }
        Ok(LittleEndian::read_u64(&record[self.offset + 48..]))
    }

    /// Returns a non-resident attribute's compressed runlist bytes.
    fn runlist<'a>(&self, record: &'a [u8]) -> Result<&'a [u8], ScanError> {
        if self.len < 64 {
            return Err(ScanError::corruption("truncated non-resident attribute"));
        }
        let start = LittleEndian::read_u16(&record[self.offset + 32..]) as usize;
        if start < 64 || start > self.len as usize {
            return Err(ScanError::corruption("runlist outside the attribute"));
        }
        Ok(&record[self.offset + start..self.offset + self.len as usize])
    }
}

/// One decoded run of a non-resident attribute.
#[derive(Debug, Eq, PartialEq)]
struct Run {
    /// Length in clusters.
    length: u64,
    /// Absolute physical cluster the run starts at; `None` for a sparse run.
    phys: Option<u64>,
}

/// Sequential runlist decoder.
///
/// Each entry's header nibbles give the widths of the following unsigned
/// length and signed physical-offset delta; the delta accumulates from zero
/// across entries and sparse entries leave the accumulator untouched. A zero
/// header terminates the list.
struct RunlistIter<'a> {
    buf: &'a [u8],
    pos: usize,
    phys: i64,
}

impl<'a> RunlistIter<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, phys: 0 }
    }
}

impl Iterator for RunlistIter<'_> {
    type Item = Result<Run, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = match self.buf.get(self.pos) {
            Some(&h) => h,
            None => return Some(Err(ScanError::corruption("unterminated runlist"))),
        };
        if header == 0 {
            return None;
        }
        let len_size = (header & 0xf) as usize;
        let off_size = (header >> 4) as usize;
        if len_size == 0 || len_size > 8 || off_size > 8 {
            return Some(Err(ScanError::corruption("invalid runlist field width")));
        }
        if self.pos + 1 + len_size + off_size > self.buf.len() {
            return Some(Err(ScanError::corruption("runlist entry outside its attribute")));
        }

        let length = LittleEndian::read_uint(&self.buf[self.pos + 1..], len_size);
        let phys = if off_size == 0 {
            // sparse run
            None
        } else {
            self.phys += LittleEndian::read_int(&self.buf[self.pos + 1 + len_size..], off_size);
            Some(self.phys as u64)
        };

        self.pos += 1 + len_size + off_size;
        Some(Ok(Run { length, phys }))
    }
}

/// One entry of a `$ATTRIBUTE_LIST` stream.
struct AttrListEntry {
    type_id: u32,
    /// Length of this entry in the stream.
    entry_len: u16,
    name_len: u8,
    name_offset: u8,
    /// First VCN of the attribute piece the referenced record holds.
    start_vcn: u64,
    /// 48-bit reference to the file record holding the piece.
    fr: u64,
    /// The attribute id within the referenced record.
    attr_id: u16,
}

impl AttrListEntry {
    /// Decodes an entry from the start of `buf` (at least 25 bytes).
    fn parse(buf: &[u8]) -> Self {
        Self {
            type_id: LittleEndian::read_u32(buf),
            entry_len: LittleEndian::read_u16(&buf[4..]),
            name_len: buf[6],
            name_offset: buf[7],
            start_vcn: LittleEndian::read_u64(&buf[8..]),
            fr: LittleEndian::read_uint(&buf[16..], 6),
            attr_id: u16::from(buf[24]),
        }
    }

    /// Returns the entry's UTF-16LE name bytes; empty when unnamed.
    fn name<'a>(&self, buf: &'a [u8]) -> Result<&'a [u8], ScanError> {
        let start = self.name_offset as usize;
        let end = start + 2 * self.name_len as usize;
        if end > buf.len() {
            return Err(ScanError::corruption("attribute list name outside its entry"));
        }
        Ok(&buf[start..end])
    }
}

/// Whether a requested attribute name matches an attribute's actual name.
///
/// A match requires both to be absent, or both present and bytewise equal.
fn names_match(query: Option<&[u8]>, actual: &[u8]) -> bool {
    match query {
        None => actual.is_empty(),
        Some(q) => !actual.is_empty() && q == actual,
    }
}

/// Decodes a boot-sector record size: positive values count clusters,
/// negative values encode `1 << -value` bytes.
fn record_size(raw: i8, cluster_size: u32) -> Result<usize, ScanError> {
    let size = if raw < 0 {
        let shift = u32::from((-i32::from(raw)) as u8);
        if shift >= 32 {
            return Err(ScanError::corruption("unreasonable record size"));
        }
        1usize << shift
    } else {
        raw as usize * cluster_size as usize
    };
    if size < 512 || size > 1 << 24 {
        return Err(ScanError::corruption("unreasonable record size"));
    }
    Ok(size)
}

/// Walker over an NTFS filesystem.
pub struct NtfsWalker<D: Disk> {
    disk: D,
    sector_size: usize,
    cluster_size: u32,
    /// Size of one MFT file record in bytes.
    fr_size: usize,
    /// The `$MFT` file record itself, fixup applied, cached for the walker's
    /// lifetime; every other record is read through its `$DATA` attribute.
    mft_record: Vec<u8>,
}

impl<D: Disk> NtfsWalker<D> {
    /// Reads the boot sector and caches the `$MFT` file record.
    pub fn new(disk: D) -> Result<Self, ScanError> {
        let mut boot = vec![0u8; 512];
        disk.read(&mut boot, 0)?;

        let sector_size = LittleEndian::read_u16(&boot[11..]) as u32;
        let sectors_per_cluster = u32::from(boot[13]);
        let total_sectors = LittleEndian::read_u64(&boot[40..]);
        let mft_cluster = LittleEndian::read_u64(&boot[48..]);
        let mftmirr_cluster = LittleEndian::read_u64(&boot[56..]);
        if sector_size == 0 || sectors_per_cluster == 0 {
            return Err(ScanError::corruption("boot sector reports empty clusters"));
        }
        let cluster_size = sector_size * sectors_per_cluster;
        let fr_size = record_size(boot[64] as i8, cluster_size)?;
        let irecord_size = record_size(boot[68] as i8, cluster_size)?;

        debug!(
            "ntfs: {total_sectors} sectors of {sector_size} bytes, \
             {sectors_per_cluster} sectors per cluster, MFT at cluster {mft_cluster} \
             (mirror at {mftmirr_cluster}), file records of {fr_size} bytes, \
             index records of {irecord_size} bytes"
        );

        let mut mft_record = vec![0u8; fr_size];
        disk.read(&mut mft_record, mft_cluster * u64::from(cluster_size))?;
        apply_fixup(&mut mft_record, sector_size as usize)?;

        Ok(Self {
            disk,
            sector_size: sector_size as usize,
            cluster_size,
            fr_size,
            mft_record,
        })
    }

    /// Enumerates live MFT records through `$Bitmap` and scans each one.
    pub fn parse<B, M>(&self, on_extent: &mut B, on_metadata: &mut M) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
        M: FnMut(&Metadata),
    {
        let bitmap_size = self.attr_size(0, ATTR_BITMAP, None)?;
        let mut chunk = [0u8; BITMAP_CHUNK];

        let mut offset = 0;
        while offset < bitmap_size {
            let wanted = usize::min(BITMAP_CHUNK, (bitmap_size - offset) as usize);
            let read = self.read_fr(0, ATTR_BITMAP, None, offset, wanted, &mut chunk)?;
            if read == 0 {
                break;
            }
            for i in 0..read {
                if chunk[i] == 0 {
                    continue;
                }
                for j in 0..8 {
                    if chunk[i] & (1 << j) != 0 {
                        self.scan_record(8 * (offset + i as u64) + j, on_extent, on_metadata)?;
                    }
                }
            }
            offset += BITMAP_CHUNK as u64;
        }
        Ok(())
    }

    /// Loads the file record `fr_num`, fixup applied.
    ///
    /// Record 0 comes from the cache; every other record is read through
    /// record 0's `$DATA` attribute, so a fragmented MFT resolves correctly.
    fn load_record(&self, fr_num: u64) -> Result<Cow<'_, [u8]>, ScanError> {
        if fr_num == 0 {
            return Ok(Cow::Borrowed(&self.mft_record));
        }
        let mut buf = vec![0u8; self.fr_size];
        let read = self.read_record_attr(
            &self.mft_record,
            0,
            ATTR_DATA,
            None,
            fr_num * self.fr_size as u64,
            self.fr_size,
            &mut buf,
        )?;
        if read < self.fr_size {
            return Err(ScanError::corruption(format!(
                "file record {fr_num} is missing from the MFT"
            )));
        }
        apply_fixup(&mut buf, self.sector_size)?;
        Ok(Cow::Owned(buf))
    }

    /// Reads `count` bytes at `offset` from the named attribute of record
    /// `fr_num` into `dst`. Returns the number of bytes read, 0 when the
    /// attribute does not exist.
    fn read_fr(
        &self,
        fr_num: u64,
        type_id: u32,
        name: Option<&[u8]>,
        offset: u64,
        count: usize,
        dst: &mut [u8],
    ) -> Result<usize, ScanError> {
        let record = self.load_record(fr_num)?;
        self.read_record_attr(&record, fr_num, type_id, name, offset, count, dst)
    }

    /// The attribute search of `read_fr`, over an already loaded record.
    ///
    /// Attributes are sorted by type id; the walk stops once the current id
    /// exceeds both `$ATTRIBUTE_LIST` and the requested type. An attribute
    /// list dispatches the cross-record resolution.
    fn read_record_attr(
        &self,
        record: &[u8],
        fr_num: u64,
        type_id: u32,
        name: Option<&[u8]>,
        offset: u64,
        count: usize,
        dst: &mut [u8],
    ) -> Result<usize, ScanError> {
        let mut off = first_attr_offset(record);
        while let Some(attr) = Attr::at(record, off)? {
            if attr.type_id > ATTR_ATTRIBUTE_LIST && attr.type_id > type_id {
                break;
            }
            if attr.flags & (ATTR_FLAG_COMPRESSED | ATTR_FLAG_ENCRYPTED) != 0 {
                return Err(ScanError::unsupported("compressed or encrypted attribute"));
            }
            if attr.type_id == type_id && names_match(name, attr.name(record)?) {
                return self.read_attr(record, &attr, offset, count, dst);
            }
            if attr.type_id == ATTR_ATTRIBUTE_LIST {
                return self.read_al(record, &attr, fr_num, type_id, name, offset, count, dst);
            }
            off += attr.len as usize;
        }
        Ok(0)
    }

    /// Reads `count` bytes at the attribute-logical `offset` into `dst`.
    fn read_attr(
        &self,
        record: &[u8],
        attr: &Attr,
        offset: u64,
        count: usize,
        dst: &mut [u8],
    ) -> Result<usize, ScanError> {
        if attr.non_resident {
            if offset > attr.actual_content_size(record)? {
                return Ok(0);
            }
            return self.read_runlist(attr.runlist(record)?, offset, count, dst);
        }

        let content = attr.resident_content(record)?;
        let end = offset
            .checked_add(count as u64)
            .ok_or_else(|| ScanError::bounds("resident read range overflow"))?;
        if end > content.len() as u64 {
            return Err(ScanError::bounds("resident read past the content size"));
        }
        dst[..count].copy_from_slice(&content[offset as usize..offset as usize + count]);
        Ok(count)
    }

    /// Reads through a decoded runlist, zero-filling sparse runs.
    ///
    /// Runs are traversed in VCN order; a requested offset behind the
    /// position already passed means the attribute's data is missing.
    fn read_runlist(
        &self,
        runlist: &[u8],
        mut offset: u64,
        mut count: usize,
        dst: &mut [u8],
    ) -> Result<usize, ScanError> {
        let cluster = u64::from(self.cluster_size);
        let mut vcn = 0;
        let mut read = 0;

        for run in RunlistIter::new(runlist) {
            if count == 0 {
                break;
            }
            let run = run?;
            if offset < vcn * cluster {
                return Err(ScanError::corruption("attribute data missing from runlist"));
            }
            let end = (vcn + run.length) * cluster;
            if end > offset {
                let len = usize::min(count, (end - offset) as usize);
                let part = &mut dst[read..read + len];
                match run.phys {
                    Some(phys) => self
                        .disk
                        .read(part, phys * cluster + (offset - vcn * cluster))?,
                    None => part.fill(0),
                }
                offset += len as u64;
                count -= len;
                read += len;
            }
            vcn += run.length;
        }
        Ok(read)
    }

    /// Cross-record attribute read through a `$ATTRIBUTE_LIST`.
    ///
    /// Entries are expected in increasing `start_vcn` order; each matching
    /// entry contributes the piece its record holds, with the requested
    /// offset translated into the piece's own VCN space.
    fn read_al(
        &self,
        record: &[u8],
        al_attr: &Attr,
        fr_num: u64,
        type_id: u32,
        name: Option<&[u8]>,
        mut offset: u64,
        mut count: usize,
        dst: &mut [u8],
    ) -> Result<usize, ScanError> {
        let cluster = u64::from(self.cluster_size);
        let list_size = self.attr_size_of(record, al_attr)?;
        let mut entry_buf = [0u8; 280];
        let mut list_off = 0;
        let mut read = 0;

        while count > 0 && list_off + 25 <= list_size {
            let wanted = usize::min(entry_buf.len(), (list_size - list_off) as usize);
            if self.read_attr(record, al_attr, list_off, wanted, &mut entry_buf)? == 0 {
                break;
            }
            let entry = AttrListEntry::parse(&entry_buf);
            if entry.type_id == 0 {
                break;
            }
            if entry.entry_len == 0 {
                return Err(ScanError::corruption("empty attribute list entry"));
            }
            list_off += u64::from(entry.entry_len);

            if entry.type_id != type_id || !names_match(name, entry.name(&entry_buf[..wanted])?) {
                continue;
            }
            if offset < entry.start_vcn * cluster {
                return Err(ScanError::corruption(
                    "attribute list entry missing or out of VCN order",
                ));
            }

            let holder: Cow<'_, [u8]> = if entry.fr == fr_num {
                Cow::Borrowed(record)
            } else {
                self.load_record(entry.fr)?
            };

            let mut off = first_attr_offset(&holder);
            while let Some(attr) = Attr::at(&holder, off)? {
                if count == 0 {
                    break;
                }
                if attr.attr_id == entry.attr_id {
                    let piece = self.read_attr(
                        &holder,
                        &attr,
                        offset - entry.start_vcn * cluster,
                        count,
                        &mut dst[read..],
                    )?;
                    offset += piece as u64;
                    count -= piece;
                    read += piece;
                }
                off += attr.len as usize;
            }
        }
        Ok(read)
    }

    /// Returns the content size of the named attribute of `base_fr_num`,
    /// without copying any data. 0 when the attribute does not exist.
    fn attr_size(
        &self,
        base_fr_num: u64,
        type_id: u32,
        name: Option<&[u8]>,
    ) -> Result<u64, ScanError> {
        let record = self.load_record(base_fr_num)?;
        self.record_attr_size(&record, base_fr_num, type_id, name)
    }

    /// The search of `attr_size`, over an already loaded record.
    fn record_attr_size(
        &self,
        record: &[u8],
        fr_num: u64,
        type_id: u32,
        name: Option<&[u8]>,
    ) -> Result<u64, ScanError> {
        let mut off = first_attr_offset(record);
        while let Some(attr) = Attr::at(record, off)? {
            if attr.type_id > ATTR_ATTRIBUTE_LIST && attr.type_id > type_id {
                break;
            }
            if attr.type_id == type_id && names_match(name, attr.name(record)?) {
                return self.attr_size_of(record, &attr);
            }
            if attr.type_id == ATTR_ATTRIBUTE_LIST {
                return self.al_attr_size(record, &attr, fr_num, type_id, name);
            }
            off += attr.len as usize;
        }
        Ok(0)
    }

    /// An attribute's content size: actual size when non-resident, inline
    /// content size when resident.
    fn attr_size_of(&self, record: &[u8], attr: &Attr) -> Result<u64, ScanError> {
        if attr.non_resident {
            attr.actual_content_size(record)
        } else {
            Ok(attr.resident_content(record)?.len() as u64)
        }
    }

    /// Size resolution through a `$ATTRIBUTE_LIST`: the entry at VCN 0 names
    /// the record holding the authoritative attribute header.
    fn al_attr_size(
        &self,
        record: &[u8],
        al_attr: &Attr,
        base_fr_num: u64,
        type_id: u32,
        name: Option<&[u8]>,
    ) -> Result<u64, ScanError> {
        let list_size = self.attr_size_of(record, al_attr)?;
        let mut entry_buf = [0u8; 280];
        let mut list_off = 0;

        while list_off + 25 <= list_size {
            let wanted = usize::min(entry_buf.len(), (list_size - list_off) as usize);
            if self.read_attr(record, al_attr, list_off, wanted, &mut entry_buf)? == 0 {
                break;
            }
            let entry = AttrListEntry::parse(&entry_buf);
            if entry.type_id == 0 {
                break;
            }
            if entry.entry_len == 0 {
                return Err(ScanError::corruption("empty attribute list entry"));
            }
            list_off += u64::from(entry.entry_len);

            if entry.type_id != type_id
                || entry.start_vcn != 0
                || !names_match(name, entry.name(&entry_buf[..wanted])?)
            {
                continue;
            }

            let holder: Cow<'_, [u8]> = if entry.fr == base_fr_num {
                Cow::Borrowed(record)
            } else {
                self.load_record(entry.fr)?
            };

            let mut off = first_attr_offset(&holder);
            while let Some(attr) = Attr::at(&holder, off)? {
                if attr.attr_id == entry.attr_id {
                    return self.attr_size_of(&holder, &attr);
                }
                off += attr.len as usize;
            }
        }
        Err(ScanError::corruption(
            "attribute missing from its attribute list",
        ))
    }

    /// Scans one live file record, emitting extents and metadata.
    fn scan_record<B, M>(
        &self,
        fr_num: u64,
        on_extent: &mut B,
        on_metadata: &mut M,
    ) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
        M: FnMut(&Metadata),
    {
        let record = self.load_record(fr_num)?;
        let base = match base_record(&record) {
            0 => fr_num,
            base => base,
        };

        let mut off = first_attr_offset(&record);
        while let Some(attr) = Attr::at(&record, off)? {
            if attr.non_resident {
                self.scan_nonres_attr(&record, &attr, fr_num, base, on_extent)?;
            } else {
                self.scan_res_attr(&record, &attr, fr_num, base, on_metadata)?;
            }
            off += attr.len as usize;
        }
        Ok(())
    }

    /// Emits one extent per non-sparse run of a non-resident attribute.
    ///
    /// The attribute's size is taken from this header when the record is its
    /// own base, and re-resolved in the base record otherwise. Sparse runs
    /// advance the VCN without an emission.
    fn scan_nonres_attr<B>(
        &self,
        record: &[u8],
        attr: &Attr,
        fr_num: u64,
        base_fr: u64,
        on_extent: &mut B,
    ) -> Result<(), ScanError>
    where
        B: FnMut(&Extent),
    {
        let name = attr.name(record)?;
        let actual_size = if base_fr == fr_num {
            attr.actual_content_size(record)?
        } else {
            self.attr_size(base_fr, attr.type_id, (!name.is_empty()).then_some(name))?
        };

        let file = FileId::MftAttr {
            base_fr,
            type_id: attr.type_id,
        };
        let mut vcn = attr.start_vcn(record)?;
        for run in RunlistIter::new(attr.runlist(record)?) {
            let run = run?;
            if let Some(phys) = run.phys {
                on_extent(&Extent {
                    file,
                    file_size: actual_size,
                    start_offset: vcn as u32,
                    start_phys_offset: phys as u32,
                    length: run.length as i32,
                });
            }
            vcn += run.length;
        }
        Ok(())
    }

    /// Reports `$STANDARD_INFORMATION` of base records to the metadata sink.
    fn scan_res_attr<M>(
        &self,
        record: &[u8],
        attr: &Attr,
        fr_num: u64,
        base_fr: u64,
        on_metadata: &mut M,
    ) -> Result<(), ScanError>
    where
        M: FnMut(&Metadata),
    {
        if attr.type_id != ATTR_STANDARD_INFORMATION || base_fr != fr_num {
            return Ok(());
        }
        let content = attr.resident_content(record)?;
        if content.len() < 36 {
            return Err(ScanError::corruption("truncated standard information"));
        }
        let flags = LittleEndian::read_u32(&content[32..]);

        on_metadata(&Metadata {
            inode: fr_num as u32,
            file_size: self.attr_size(fr_num, ATTR_DATA, None)?,
            compressed: flags & FILE_FLAG_COMPRESSED != 0,
            encrypted: flags & FILE_FLAG_ENCRYPTED != 0,
            ctime: LittleEndian::read_i64(content),
            mtime: LittleEndian::read_i64(&content[8..]),
            atime: LittleEndian::read_i64(&content[24..]),
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::testutil::MemDisk;

    const FR_SIZE: usize = 1024;
    const CLUSTER: usize = 4096;
    /// The test MFT starts here and spans 3 clusters (12 records).
    const MFT_CLUSTER: u64 = 4;

    fn boot_image(size: usize) -> MemDisk {
        let mut disk = MemDisk::new(size);
        let d = &mut disk.data;
        d[3..7].copy_from_slice(b"NTFS");
        LittleEndian::write_u16(&mut d[11..], 512);
        d[13] = 8;
        LittleEndian::write_u64(&mut d[40..], (size / 512) as u64);
        LittleEndian::write_u64(&mut d[48..], MFT_CLUSTER);
        LittleEndian::write_u64(&mut d[56..], 8);
        d[64] = (-10i8) as u8; // 1024-byte file records
        d[68] = (-12i8) as u8;
        disk
    }

    /// Replaces each sector's trailing bytes with the fixup tag, storing the
    /// originals in the fixup array, as a formatter would.
    fn fixup_protect(rec: &mut [u8]) {
        let fixup_off = LittleEndian::read_u16(&rec[4..]) as usize;
        let sectors = LittleEndian::read_u16(&rec[6..]) as usize - 1;
        rec[fixup_off] = 0x37;
        rec[fixup_off + 1] = 0x13;
        for i in 0..sectors {
            let end = (i + 1) * 512;
            rec[fixup_off + 2 + 2 * i] = rec[end - 2];
            rec[fixup_off + 3 + 2 * i] = rec[end - 1];
            rec[end - 2] = 0x37;
            rec[end - 1] = 0x13;
        }
    }

    /// Assembles a fixup-protected file record from raw attributes.
    fn build_record(base_fr: u64, attrs: &[Vec<u8>]) -> Vec<u8> {
        let mut rec = vec![0u8; FR_SIZE];
        rec[..4].copy_from_slice(b"FILE");
        LittleEndian::write_u16(&mut rec[4..], 42); // fixup array offset
        LittleEndian::write_u16(&mut rec[6..], 3); // tag + one entry per sector
        LittleEndian::write_u16(&mut rec[20..], 56); // first attribute
        LittleEndian::write_uint(&mut rec[32..], base_fr, 6);

        let mut off = 56;
        for attr in attrs {
            rec[off..off + attr.len()].copy_from_slice(attr);
            off += attr.len();
        }
        LittleEndian::write_u32(&mut rec[off..], ATTR_END);

        fixup_protect(&mut rec);
        rec
    }

    fn nonres_attr(
        type_id: u32,
        attr_id: u16,
        start_vcn: u64,
        end_vcn: u64,
        actual_size: u64,
        runlist: &[u8],
    ) -> Vec<u8> {
        let rl_off = 64;
        let len = (rl_off + runlist.len() + 1 + 7) & !7;
        let mut a = vec![0u8; len];
        LittleEndian::write_u32(&mut a[0..], type_id);
        LittleEndian::write_u32(&mut a[4..], len as u32);
        a[8] = 1; // non-resident
        LittleEndian::write_u16(&mut a[14..], attr_id);
        LittleEndian::write_u64(&mut a[16..], start_vcn);
        LittleEndian::write_u64(&mut a[24..], end_vcn);
        LittleEndian::write_u16(&mut a[32..], rl_off as u16);
        LittleEndian::write_u64(&mut a[48..], actual_size);
        a[rl_off..rl_off + runlist.len()].copy_from_slice(runlist);
        a
    }

    fn res_attr(type_id: u32, attr_id: u16, content: &[u8]) -> Vec<u8> {
        let c_off = 24;
        let len = (c_off + content.len() + 7) & !7;
        let mut a = vec![0u8; len];
        LittleEndian::write_u32(&mut a[0..], type_id);
        LittleEndian::write_u32(&mut a[4..], len as u32);
        LittleEndian::write_u16(&mut a[14..], attr_id);
        LittleEndian::write_u32(&mut a[16..], content.len() as u32);
        LittleEndian::write_u16(&mut a[20..], c_off as u16);
        a[c_off..c_off + content.len()].copy_from_slice(content);
        a
    }

    fn al_entry(type_id: u32, start_vcn: u64, fr: u64, attr_id: u8) -> Vec<u8> {
        let mut e = vec![0u8; 32];
        LittleEndian::write_u32(&mut e[0..], type_id);
        LittleEndian::write_u16(&mut e[4..], 32);
        e[7] = 26; // name offset, unnamed
        LittleEndian::write_u64(&mut e[8..], start_vcn);
        LittleEndian::write_uint(&mut e[16..], fr, 6);
        e[24] = attr_id;
        e
    }

    /// An image whose MFT holds record 0 ($MFT: $DATA over the MFT clusters
    /// plus a resident $Bitmap) and the given extra records.
    fn ntfs_image(bitmap: &[u8], records: &[(u64, Vec<u8>)]) -> MemDisk {
        let mut disk = boot_image(256 * 1024);

        let mft_data = nonres_attr(ATTR_DATA, 1, 0, 2, 3 * CLUSTER as u64, &[0x11, 0x03, 0x04]);
        let mft_bitmap = res_attr(ATTR_BITMAP, 2, bitmap);
        let rec0 = build_record(0, &[mft_data, mft_bitmap]);

        let mft_off = MFT_CLUSTER as usize * CLUSTER;
        disk.data[mft_off..mft_off + FR_SIZE].copy_from_slice(&rec0);
        for (index, rec) in records {
            let off = mft_off + *index as usize * FR_SIZE;
            disk.data[off..off + FR_SIZE].copy_from_slice(rec);
        }
        disk
    }

    fn scan(disk: MemDisk) -> (Vec<Extent>, Vec<Metadata>) {
        let walker = NtfsWalker::new(disk).unwrap();
        let mut extents = Vec::new();
        let mut metadata = Vec::new();
        walker
            .parse(&mut |e: &Extent| extents.push(e.clone()), &mut |m: &Metadata| {
                metadata.push(m.clone())
            })
            .unwrap();
        (extents, metadata)
    }

    #[test]
    fn fixup_round_trip() {
        let mut rec = build_record(0, &[]);
        // protected form: every sector ends with the tag
        assert_eq!(&rec[510..512], &[0x37, 0x13]);
        assert_eq!(&rec[1022..1024], &[0x37, 0x13]);

        apply_fixup(&mut rec, 512).unwrap();
        let fixup_off = 42;
        assert_eq!(rec[510], rec[fixup_off + 2]);
        assert_eq!(rec[511], rec[fixup_off + 3]);
        assert_eq!(rec[1022], rec[fixup_off + 4]);
        assert_eq!(rec[1023], rec[fixup_off + 5]);
    }

    #[test]
    fn fixup_mismatch_is_corruption() {
        let mut rec = build_record(0, &[]);
        rec[510] ^= 0xff;
        assert!(matches!(
            apply_fixup(&mut rec, 512),
            Err(ScanError::Corruption(_))
        ));
    }

    #[test]
    fn baad_record_rejected() {
        let mut rec = build_record(0, &[]);
        rec[..4].copy_from_slice(b"BAAD");
        assert!(matches!(
            apply_fixup(&mut rec, 512),
            Err(ScanError::Unsupported(_))
        ));
    }

    #[test]
    fn runlist_decoding() {
        // 2 clusters at 256, 3 sparse, 1 at 256 + 5
        let buf = [0x21, 0x02, 0x00, 0x01, 0x01, 0x03, 0x11, 0x01, 0x05, 0x00];
        let runs: Vec<Run> = RunlistIter::new(&buf).map(Result::unwrap).collect();
        assert_eq!(
            runs,
            vec![
                Run { length: 2, phys: Some(256) },
                Run { length: 3, phys: None },
                Run { length: 1, phys: Some(261) },
            ]
        );
    }

    #[test]
    fn runlist_negative_delta() {
        // 1 cluster at 100, then 1 cluster 30 clusters back
        let buf = [0x11, 0x01, 0x64, 0x11, 0x01, 0xe2, 0x00];
        let runs: Vec<Run> = RunlistIter::new(&buf).map(Result::unwrap).collect();
        assert_eq!(runs[0].phys, Some(100));
        assert_eq!(runs[1].phys, Some(70));
    }

    #[test]
    fn record_size_encodings() {
        assert_eq!(record_size(-10, 4096).unwrap(), 1024);
        assert_eq!(record_size(1, 4096).unwrap(), 4096);
        assert!(record_size(-40, 4096).is_err());
    }

    #[test]
    fn single_nonres_data_attribute() {
        // E4: runlist 0x21 0x10 0x05 0x00: 0x10 clusters at cluster 5
        let data = nonres_attr(ATTR_DATA, 2, 0, 0xf, 0x10 * CLUSTER as u64, &[0x21, 0x10, 0x05, 0x00]);
        let rec5 = build_record(0, &[data]);
        let disk = ntfs_image(&[0b0010_0000], &[(5, rec5)]);

        let (extents, _) = scan(disk);
        assert_eq!(
            extents,
            vec![Extent {
                file: FileId::MftAttr { base_fr: 5, type_id: ATTR_DATA },
                file_size: 0x10 * CLUSTER as u64,
                start_offset: 0,
                start_phys_offset: 0x5,
                length: 0x10,
            }]
        );
    }

    #[test]
    fn sparse_runs_emit_nothing() {
        let data = nonres_attr(
            ATTR_DATA,
            2,
            0,
            5,
            6 * CLUSTER as u64,
            // 2 clusters at 256, 3 sparse, 1 at 261
            &[0x21, 0x02, 0x00, 0x01, 0x01, 0x03, 0x11, 0x01, 0x05],
        );
        let rec = build_record(0, &[data]);
        let disk = ntfs_image(&[0b0000_0010], &[(1, rec)]);

        let (extents, _) = scan(disk);
        assert_eq!(extents.len(), 2);
        assert_eq!(
            (extents[0].start_offset, extents[0].start_phys_offset, extents[0].length),
            (0, 256, 2)
        );
        // the sparse gap contributes no emission and resumes at VCN 5
        assert_eq!(
            (extents[1].start_offset, extents[1].start_phys_offset, extents[1].length),
            (5, 261, 1)
        );
    }

    #[test]
    fn bitmap_gates_record_enumeration() {
        // E6: bit 3 set, bit 4 clear; record 4 is garbage that would fail
        let data = nonres_attr(ATTR_DATA, 2, 0, 0, CLUSTER as u64, &[0x11, 0x01, 0x0a]);
        let rec3 = build_record(0, &[data]);
        let disk = ntfs_image(&[0b0000_1001], &[(3, rec3)]);

        let (extents, _) = scan(disk);
        let ids: Vec<FileId> = extents.iter().map(|e| e.file).collect();
        assert!(ids.contains(&FileId::MftAttr { base_fr: 3, type_id: ATTR_DATA }));
        assert!(ids.contains(&FileId::MftAttr { base_fr: 0, type_id: ATTR_DATA }));
        assert!(!ids
            .iter()
            .any(|id| matches!(id, FileId::MftAttr { base_fr: 4, .. })));
    }

    #[test]
    fn standard_information_metadata() {
        let mut std_info = vec![0u8; 48];
        LittleEndian::write_i64(&mut std_info[0..], 111); // ctime
        LittleEndian::write_i64(&mut std_info[8..], 222); // mtime
        LittleEndian::write_i64(&mut std_info[24..], 333); // atime
        LittleEndian::write_u32(&mut std_info[32..], FILE_FLAG_COMPRESSED);

        let si = res_attr(ATTR_STANDARD_INFORMATION, 1, &std_info);
        let data = nonres_attr(ATTR_DATA, 2, 0, 1, 2 * CLUSTER as u64, &[0x11, 0x02, 0x0a]);
        let rec = build_record(0, &[si, data]);
        let disk = ntfs_image(&[0b0000_0010], &[(1, rec)]);

        let (_, metadata) = scan(disk);
        assert_eq!(metadata.len(), 1);
        let m = &metadata[0];
        assert_eq!(m.inode, 1);
        assert_eq!(m.file_size, 2 * CLUSTER as u64);
        assert!(m.compressed);
        assert!(!m.encrypted);
        assert_eq!((m.ctime, m.mtime, m.atime), (111, 222, 333));
    }

    #[test]
    fn attribute_list_reassembly() {
        // E5: record 7's $DATA is split, the tail living in record 8
        let mut al = Vec::new();
        al.extend(al_entry(ATTR_DATA, 0, 7, 2));
        al.extend(al_entry(ATTR_DATA, 2, 8, 3));

        let al_attr = res_attr(ATTR_ATTRIBUTE_LIST, 1, &al);
        let head = nonres_attr(ATTR_DATA, 2, 0, 1, 3 * CLUSTER as u64, &[0x11, 0x02, 0x32]);
        let rec7 = build_record(0, &[al_attr, head]);

        let tail = nonres_attr(ATTR_DATA, 3, 2, 2, 0, &[0x11, 0x01, 0x3c]);
        let rec8 = build_record(7, &[tail]);

        let disk = ntfs_image(&[0b1000_0000, 0b0000_0001], &[(7, rec7), (8, rec8)]);

        let (extents, _) = scan(disk);
        let file = FileId::MftAttr { base_fr: 7, type_id: ATTR_DATA };
        let segments: Vec<&Extent> = extents.iter().filter(|e| e.file == file).collect();
        assert_eq!(segments.len(), 2);
        // both segments resolve the base record's size
        assert!(segments.iter().all(|e| e.file_size == 3 * CLUSTER as u64));
        assert_eq!(
            (segments[0].start_offset, segments[0].start_phys_offset, segments[0].length),
            (0, 0x32, 2)
        );
        assert_eq!(
            (segments[1].start_offset, segments[1].start_phys_offset, segments[1].length),
            (2, 0x3c, 1)
        );
    }

    #[test]
    fn read_attr_matches_runlist_layout() {
        // fill two data regions and read them back through the runlist
        let mut disk = ntfs_image(
            &[0b0000_0010],
            &[(
                1,
                build_record(
                    0,
                    &[nonres_attr(
                        ATTR_DATA,
                        2,
                        0,
                        2,
                        3 * CLUSTER as u64,
                        // 1 cluster at 10, 1 sparse, 1 at 11
                        &[0x11, 0x01, 0x0a, 0x01, 0x01, 0x11, 0x01, 0x01],
                    )],
                ),
            )],
        );
        for i in 0..CLUSTER {
            disk.data[10 * CLUSTER + i] = (i % 200) as u8 + 1;
            disk.data[11 * CLUSTER + i] = (i % 100) as u8 + 1;
        }
        let mut expected = Vec::new();
        expected.extend_from_slice(&disk.data[10 * CLUSTER..11 * CLUSTER]);
        expected.extend(std::iter::repeat(0u8).take(CLUSTER));
        expected.extend_from_slice(&disk.data[11 * CLUSTER..12 * CLUSTER]);

        let walker = NtfsWalker::new(disk).unwrap();
        let mut buf = vec![0u8; 3 * CLUSTER];
        let read = walker
            .read_fr(1, ATTR_DATA, None, 0, buf.len(), &mut buf)
            .unwrap();
        assert_eq!(read, buf.len());
        assert_eq!(buf, expected);

        // unaligned read through the middle
        let mut buf = vec![0u8; 600];
        let read = walker
            .read_fr(1, ATTR_DATA, None, CLUSTER as u64 - 300, 600, &mut buf)
            .unwrap();
        assert_eq!(read, 600);
        assert_eq!(&buf[..300], &expected[CLUSTER - 300..CLUSTER]);
        assert_eq!(&buf[300..], &[0u8; 300]);
    }

    #[test]
    fn compressed_attribute_rejected() {
        let mut data = nonres_attr(ATTR_DATA, 2, 0, 0, CLUSTER as u64, &[0x11, 0x01, 0x0a]);
        LittleEndian::write_u16(&mut data[12..], ATTR_FLAG_COMPRESSED);
        let rec = build_record(0, &[data]);
        let disk = ntfs_image(&[0b0000_0010], &[(1, rec)]);

        let walker = NtfsWalker::new(disk).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            walker.read_fr(1, ATTR_DATA, None, 0, 16, &mut buf),
            Err(ScanError::Unsupported(_))
        ));
    }
}
