//! Module implement the on-disk page, unit of volume storage and of
//! buffer-pool caching.
//!
//! A page is a fixed-size buffer, power-of-two sized, made up of a
//! 64-byte header, a key-block directory growing down from the header
//! and packed key/value records growing up from the tail:
//!
//! ```text
//! +--------+----------------------+...free...+------------------+
//! | header | kb0 kb1 kb2 ...      |          | records          |
//! +--------+----------------------+----------+------------------+
//! 0        64                     free_off   alloc_off          page_size
//! ```
//!
//! Each key block is 8 bytes, `{ebc, flags, klen, offset}`. `ebc` is the
//! elided-byte-count against the previous key on the page, only the
//! `klen - ebc` byte suffix is stored in the record. The record at
//! `offset` holds the key suffix, a u16 value-length and the value
//! bytes. INDEX pages store an 8-byte child page address as the value,
//! DATA pages store the cell bytes (bare value or MVV), and a cell
//! flagged [FLAG_LONG] stores a 16-byte long-record pointer instead.
//!
//! The first four header bytes are a CRC32 checksum over the rest of
//! the page, verified on every read from the volume file.

use crc::{Crc, CRC_32_ISO_HDLC};

use std::{cmp, convert::TryFrom, fmt, result};

use crate::{Error, Result};

pub const MIN_PAGE_SIZE: usize = 1024;
pub const MAX_PAGE_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 64;
pub const KEY_BLOCK_SIZE: usize = 8;

/// Key-block flag, the record's value is a `{total_length: u64,
/// first_page: u64}` pointer into a chain of LONG pages.
pub const FLAG_LONG: u8 = 0x01;

/// Page address 0 holds the volume head page and doubles as the nil
/// sibling/child address.
pub const NIL_PAGE: u64 = 0;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

// header field offsets.
const OFF_CHECKSUM: usize = 0;
const OFF_TYPE: usize = 4;
const OFF_ADDRESS: usize = 8;
const OFF_RIGHT: usize = 16;
const OFF_LEFT: usize = 24;
const OFF_GENERATION: usize = 32;
const OFF_KB_COUNT: usize = 40;
const OFF_FREE: usize = 42;
const OFF_ALLOC: usize = 44;
const OFF_VOLUME: usize = 48;
const OFF_LONG_LEN: usize = 52; // payload length, LONG pages only

/// Page types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageType {
    /// Volume metadata, page 0 of every volume.
    Head = 1,
    /// Interior btree page, values are child page addresses.
    Index = 2,
    /// Leaf btree page, values are cells.
    Data = 3,
    /// Overflow chunk of a long record.
    Long = 4,
    /// Member of the volume's garbage chain.
    Garbage = 5,
}

impl TryFrom<u8> for PageType {
    type Error = Error;

    fn try_from(val: u8) -> Result<PageType> {
        match val {
            1 => Ok(PageType::Head),
            2 => Ok(PageType::Index),
            3 => Ok(PageType::Data),
            4 => Ok(PageType::Long),
            5 => Ok(PageType::Garbage),
            val => err_at!(CorruptPage, msg: "invalid page type {}", val),
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self {
            PageType::Head => write!(f, "head"),
            PageType::Index => write!(f, "index"),
            PageType::Data => write!(f, "data"),
            PageType::Long => write!(f, "long"),
            PageType::Garbage => write!(f, "garbage"),
        }
    }
}

/// Where to cut an over-full page, per-exchange state defaulting to
/// [SplitPolicy::Nice].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SplitPolicy {
    /// Balance encoded bytes across the two halves.
    Nice,
    /// Keep the incoming key in the left half, pack the left page.
    LeftBias,
    /// Keep the incoming key in the right half, pack the right page.
    RightBias,
    /// Minimize total bytes after prefix compression.
    PackBias,
}

impl Default for SplitPolicy {
    fn default() -> SplitPolicy {
        SplitPolicy::Nice
    }
}

/// Result of an in-page lookup.
#[derive(Clone, Copy, Debug)]
pub struct Position {
    /// Index of the smallest key greater-than-or-equal to the probe,
    /// equals the key-block count when every key is smaller.
    pub index: usize,
    /// Whether the key at `index` equals the probe.
    pub exact: bool,
}

/// A decoded page entry, used by the rebuild/split paths.
#[derive(Clone, Debug)]
pub struct Entry {
    pub key: Vec<u8>,
    pub flags: u8,
    pub cell: Vec<u8>,
}

impl Entry {
    pub fn new(key: Vec<u8>, flags: u8, cell: Vec<u8>) -> Entry {
        Entry { key, flags, cell }
    }
}

/// One fixed-size page, owned buffer plus typed accessors.
#[derive(Clone)]
pub struct Page {
    data: Vec<u8>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "Page<{:?} addr:{} n:{} free:{} alloc:{}>",
            self.to_type(),
            self.to_address(),
            self.len(),
            self.to_free_offset(),
            self.to_alloc_offset(),
        )
    }
}

impl Page {
    /// Initialize an empty page of `page_size` bytes.
    pub fn new(page_size: usize, typ: PageType, address: u64, volume_id: u32) -> Page {
        let mut page = Page {
            data: vec![0; page_size],
        };
        page.data[OFF_TYPE] = typ as u8;
        page.set_address(address);
        page.set_volume_id(volume_id);
        page.set_kb_count(0);
        page.set_free_offset(HEADER_SIZE as u16);
        page.set_alloc_offset(page_size as u16);
        page
    }

    /// Wrap a raw buffer read from a volume file, verifying length,
    /// checksum and page type.
    pub fn from_buffer(data: Vec<u8>) -> Result<Page> {
        if !data.len().is_power_of_two()
            || data.len() < MIN_PAGE_SIZE
            || data.len() > MAX_PAGE_SIZE
        {
            return err_at!(CorruptPage, msg: "bad page buffer {}", data.len());
        }
        let page = Page { data };
        let stored = page.to_checksum();
        let computed = page.compute_checksum();
        if stored != computed {
            return err_at!(
                CorruptPage, msg: "checksum {:x} != {:x} at page {}",
                stored, computed, page.to_address()
            );
        }
        PageType::try_from(page.data[OFF_TYPE])?;
        Ok(page)
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    /// Refresh the header checksum, call before writing to the volume.
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.data[OFF_CHECKSUM..OFF_CHECKSUM + 4]
            .copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.data
    }

    fn compute_checksum(&self) -> u32 {
        CRC32.checksum(&self.data[OFF_TYPE..])
    }

    fn to_checksum(&self) -> u32 {
        self.get_u32(OFF_CHECKSUM)
    }
}

// field accessors.
impl Page {
    fn get_u16(&self, off: usize) -> u16 {
        let mut scratch = [0_u8; 2];
        scratch.copy_from_slice(&self.data[off..off + 2]);
        u16::from_be_bytes(scratch)
    }

    fn set_u16(&mut self, off: usize, val: u16) {
        self.data[off..off + 2].copy_from_slice(&val.to_be_bytes());
    }

    fn get_u32(&self, off: usize) -> u32 {
        let mut scratch = [0_u8; 4];
        scratch.copy_from_slice(&self.data[off..off + 4]);
        u32::from_be_bytes(scratch)
    }

    fn get_u64(&self, off: usize) -> u64 {
        let mut scratch = [0_u8; 8];
        scratch.copy_from_slice(&self.data[off..off + 8]);
        u64::from_be_bytes(scratch)
    }

    fn set_u64(&mut self, off: usize, val: u64) {
        self.data[off..off + 8].copy_from_slice(&val.to_be_bytes());
    }

    pub fn to_type(&self) -> PageType {
        PageType::try_from(self.data[OFF_TYPE]).unwrap()
    }

    pub fn set_type(&mut self, typ: PageType) {
        self.data[OFF_TYPE] = typ as u8;
    }

    pub fn to_address(&self) -> u64 {
        self.get_u64(OFF_ADDRESS)
    }

    pub fn set_address(&mut self, address: u64) {
        self.set_u64(OFF_ADDRESS, address)
    }

    pub fn to_right_sibling(&self) -> u64 {
        self.get_u64(OFF_RIGHT)
    }

    pub fn set_right_sibling(&mut self, address: u64) {
        self.set_u64(OFF_RIGHT, address)
    }

    pub fn to_left_sibling(&self) -> u64 {
        self.get_u64(OFF_LEFT)
    }

    pub fn set_left_sibling(&mut self, address: u64) {
        self.set_u64(OFF_LEFT, address)
    }

    /// Timestamp of the most recent mutation to this page.
    pub fn to_generation(&self) -> u64 {
        self.get_u64(OFF_GENERATION)
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.set_u64(OFF_GENERATION, generation)
    }

    pub fn to_volume_id(&self) -> u32 {
        self.get_u32(OFF_VOLUME)
    }

    pub fn set_volume_id(&mut self, volume_id: u32) {
        self.data[OFF_VOLUME..OFF_VOLUME + 4].copy_from_slice(&volume_id.to_be_bytes());
    }

    /// Number of key blocks.
    pub fn len(&self) -> usize {
        self.get_u16(OFF_KB_COUNT) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_kb_count(&mut self, count: u16) {
        self.set_u16(OFF_KB_COUNT, count)
    }

    fn to_free_offset(&self) -> usize {
        self.get_u16(OFF_FREE) as usize
    }

    fn set_free_offset(&mut self, off: u16) {
        self.set_u16(OFF_FREE, off)
    }

    fn to_alloc_offset(&self) -> usize {
        self.get_u16(OFF_ALLOC) as usize
    }

    fn set_alloc_offset(&mut self, off: u16) {
        self.set_u16(OFF_ALLOC, off)
    }

    /// Payload length, valid for LONG pages.
    pub fn to_long_length(&self) -> usize {
        self.get_u32(OFF_LONG_LEN) as usize
    }

    /// Store `chunk` as this LONG page's payload.
    pub fn set_long_payload(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() > self.data.len() - HEADER_SIZE {
            return err_at!(Fatal, msg: "long payload {} too big", chunk.len());
        }
        let n = err_at!(FailConvert, u32::try_from(chunk.len()))?;
        self.data[OFF_LONG_LEN..OFF_LONG_LEN + 4].copy_from_slice(&n.to_be_bytes());
        self.data[HEADER_SIZE..HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        Ok(())
    }

    /// Payload bytes of a LONG page.
    pub fn as_long_payload(&self) -> Result<&[u8]> {
        let n = self.to_long_length();
        if HEADER_SIZE + n > self.data.len() {
            return err_at!(CorruptPage, msg: "long payload {} overflows page", n);
        }
        Ok(&self.data[HEADER_SIZE..HEADER_SIZE + n])
    }

    /// Capacity available for long-record payload per page.
    pub fn long_capacity(page_size: usize) -> usize {
        page_size - HEADER_SIZE
    }

    /// Install the head-page body, the volume layer owns its layout.
    pub fn set_head_body(&mut self, body: &[u8]) -> Result<()> {
        if HEADER_SIZE + body.len() > self.data.len() {
            return err_at!(Fatal, msg: "head body {} too big", body.len());
        }
        self.data[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(body);
        Ok(())
    }

    /// Head-page body bytes.
    pub fn as_head_body(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }
}

// key-block directory.
impl Page {
    fn kb_off(&self, index: usize) -> usize {
        HEADER_SIZE + index * KEY_BLOCK_SIZE
    }

    fn kb_ebc(&self, index: usize) -> usize {
        self.data[self.kb_off(index)] as usize
    }

    /// Key-block flags, see [FLAG_LONG].
    pub fn flags_at(&self, index: usize) -> u8 {
        self.data[self.kb_off(index) + 1]
    }

    fn kb_klen(&self, index: usize) -> usize {
        self.get_u16(self.kb_off(index) + 2) as usize
    }

    fn kb_record(&self, index: usize) -> usize {
        self.get_u16(self.kb_off(index) + 4) as usize
    }

    // record parts: record offset, key-suffix length.
    fn record_parts(&self, index: usize) -> (usize, usize) {
        let off = self.kb_record(index);
        let suffix_len = self.kb_klen(index) - self.kb_ebc(index);
        (off, suffix_len)
    }

    /// Materialize the full key bytes at `index`, resolving the elided
    /// prefix through earlier key blocks.
    pub fn key_at(&self, index: usize) -> Vec<u8> {
        let klen = self.kb_klen(index);
        let mut key = vec![0; klen];

        let (off, suffix_len) = self.record_parts(index);
        let mut have_from = self.kb_ebc(index);
        key[have_from..klen].copy_from_slice(&self.data[off..off + suffix_len]);

        let mut cursor = index;
        while have_from > 0 {
            cursor -= 1;
            let ebc = self.kb_ebc(cursor);
            if ebc < have_from {
                let (off, _) = self.record_parts(cursor);
                let take = have_from - ebc;
                key[ebc..have_from].copy_from_slice(&self.data[off..off + take]);
                have_from = ebc;
            }
        }
        key
    }

    /// Value bytes at `index`.
    pub fn value_at(&self, index: usize) -> &[u8] {
        let (off, suffix_len) = self.record_parts(index);
        let vlen = self.get_u16(off + suffix_len) as usize;
        &self.data[off + suffix_len + 2..off + suffix_len + 2 + vlen]
    }

    /// Child page address at `index`, for INDEX pages.
    pub fn child_at(&self, index: usize) -> u64 {
        let mut scratch = [0_u8; 8];
        scratch.copy_from_slice(self.value_at(index));
        u64::from_be_bytes(scratch)
    }

    /// Binary search for `key`, comparing encoded bytes.
    pub fn find(&self, key: &[u8]) -> Position {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key_at(mid)[..].cmp(key) {
                cmp::Ordering::Less => lo = mid + 1,
                cmp::Ordering::Equal => {
                    return Position {
                        index: mid,
                        exact: true,
                    }
                }
                cmp::Ordering::Greater => hi = mid,
            }
        }
        Position {
            index: lo,
            exact: false,
        }
    }

    /// Bytes left between the directory and the record area.
    pub fn free_space(&self) -> usize {
        self.to_alloc_offset() - self.to_free_offset()
    }

    /// Space budget for a single cell on a page of `page_size`; larger
    /// cells must spill into a long-record chain. Quarter of the page's
    /// payload area, so a split can always make room for two cells plus
    /// their key blocks.
    pub fn cell_budget(page_size: usize) -> usize {
        (page_size - HEADER_SIZE) / 4
    }
}

// mutation; the page is rebuilt from decoded entries, keeping the
// record area compact and the ebc chain exact.
impl Page {
    /// Decode every entry on the page.
    pub fn to_entries(&self) -> Vec<Entry> {
        let mut entries = Vec::with_capacity(self.len());
        for index in 0..self.len() {
            entries.push(Entry {
                key: self.key_at(index),
                flags: self.flags_at(index),
                cell: self.value_at(index).to_vec(),
            });
        }
        entries
    }

    /// Encoded size of `entries` on a page, including header.
    pub fn content_size(entries: &[Entry]) -> usize {
        let mut size = HEADER_SIZE;
        let mut prev: Option<&[u8]> = None;
        for entry in entries.iter() {
            let ebc = match prev {
                Some(prev) => common_prefix(prev, &entry.key),
                None => 0,
            };
            size += KEY_BLOCK_SIZE + (entry.key.len() - ebc) + 2 + entry.cell.len();
            prev = Some(&entry.key);
        }
        size
    }

    /// Whether `entries` fit on a page of `page_size`.
    pub fn fits(entries: &[Entry], page_size: usize) -> bool {
        Self::content_size(entries) <= page_size
    }

    /// Replace page content with `entries`, which must be sorted by key.
    /// Fail with [Error::Fatal] if they do not fit; callers check
    /// [Page::fits] and split beforehand.
    pub fn set_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if !Self::fits(entries, self.data.len()) {
            return err_at!(
                Fatal, msg: "page overflow {} entries on {}",
                entries.len(), self.data.len()
            );
        }
        let count = err_at!(FailConvert, u16::try_from(entries.len()))?;

        // wipe directory and record area.
        let page_size = self.data.len();
        for byt in self.data[HEADER_SIZE..].iter_mut() {
            *byt = 0;
        }

        let mut alloc = page_size;
        let mut prev: Option<Vec<u8>> = None;
        for (index, entry) in entries.iter().enumerate() {
            let ebc = match &prev {
                Some(prev) => common_prefix(prev, &entry.key),
                None => 0,
            };
            let suffix = &entry.key[ebc..];
            let record_len = suffix.len() + 2 + entry.cell.len();
            alloc -= record_len;

            let off = self.kb_off(index);
            self.data[off] = ebc as u8;
            self.data[off + 1] = entry.flags;
            self.set_u16(off + 2, u16::try_from(entry.key.len()).unwrap());
            self.set_u16(off + 4, u16::try_from(alloc).unwrap());
            self.set_u16(off + 6, 0);

            self.data[alloc..alloc + suffix.len()].copy_from_slice(suffix);
            let vlen = err_at!(FailConvert, u16::try_from(entry.cell.len()))?;
            self.data[alloc + suffix.len()..alloc + suffix.len() + 2]
                .copy_from_slice(&vlen.to_be_bytes());
            self.data[alloc + suffix.len() + 2..alloc + record_len]
                .copy_from_slice(&entry.cell);

            prev = Some(entry.key.clone());
        }

        self.set_kb_count(count);
        let free = HEADER_SIZE + entries.len() * KEY_BLOCK_SIZE;
        self.set_free_offset(u16::try_from(free).unwrap());
        self.set_alloc_offset(u16::try_from(alloc).unwrap());
        Ok(())
    }

    /// Verify in-page invariants, used by integrity checking. Return
    /// the list of faults found.
    pub fn verify(&self) -> Vec<String> {
        let mut faults = vec![];
        let mut prev: Option<Vec<u8>> = None;
        for index in 0..self.len() {
            let key = self.key_at(index);
            if let Some(prev) = &prev {
                if prev[..] >= key[..] {
                    faults.push(format!(
                        "page {} keys out of order at {}",
                        self.to_address(),
                        index
                    ));
                }
                let ebc = self.kb_ebc(index);
                if common_prefix(prev, &key) < ebc {
                    faults.push(format!(
                        "page {} overlong ebc at {}",
                        self.to_address(),
                        index
                    ));
                }
            } else if self.kb_ebc(index) != 0 {
                faults.push(format!("page {} first-key ebc", self.to_address()));
            }
            prev = Some(key);
        }
        if self.to_free_offset() != HEADER_SIZE + self.len() * KEY_BLOCK_SIZE {
            faults.push(format!("page {} free offset", self.to_address()));
        }
        faults
    }
}

/// Ebc against the preceding key, capped at 255.
pub fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    let n = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    cmp::min(n, 255)
}

/// Choose the number of entries going to the left page when splitting
/// `entries` over two pages of `page_size`. `insert_at` is the index of
/// the just-inserted entry, biased policies use it to keep the incoming
/// key in the chosen half.
pub fn split_point(
    entries: &[Entry],
    insert_at: usize,
    page_size: usize,
    policy: SplitPolicy,
) -> usize {
    debug_assert!(entries.len() >= 2);

    let candidates: Vec<usize> = (1..entries.len())
        .filter(|n| {
            Page::fits(&entries[..*n], page_size) && Page::fits(&entries[*n..], page_size)
        })
        .collect();
    // with cell sizes capped by cell_budget, the midpoint always fits.
    let fallback = entries.len() / 2;
    if candidates.is_empty() {
        return fallback;
    }

    match policy {
        SplitPolicy::Nice => *candidates
            .iter()
            .min_by_key(|n| {
                let left = Page::content_size(&entries[..**n]) as isize;
                let right = Page::content_size(&entries[**n..]) as isize;
                (left - right).abs()
            })
            .unwrap(),
        SplitPolicy::PackBias => *candidates
            .iter()
            .min_by_key(|n| {
                Page::content_size(&entries[..**n]) + Page::content_size(&entries[**n..])
            })
            .unwrap(),
        SplitPolicy::LeftBias => match candidates.iter().rev().find(|n| **n > insert_at)
        {
            Some(n) => *n,
            None => *candidates.last().unwrap(),
        },
        SplitPolicy::RightBias => match candidates.iter().find(|n| **n <= insert_at) {
            Some(n) => *n,
            None => *candidates.first().unwrap(),
        },
    }
}
