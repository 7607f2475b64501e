//! Journal record framing and payload types.
//!
//! Every record is framed as:
//!
//! ```text
//! +------------+---------+----------------+---------+-----------+
//! | length u32 | type u8 | timestamp u64  | payload | crc32 u32 |
//! +------------+---------+----------------+---------+-----------+
//! ```
//!
//! `length` covers the whole frame, the checksum covers type, timestamp
//! and payload. Page-image payloads are raw bytes, bit-exact copies of
//! the page buffer prefixed with its volume id and address; every other
//! payload is a CBOR document.

use cbordata::Cborize;
use crc::{Crc, CRC_32_ISO_HDLC};

use std::convert::TryFrom;

use crate::{util, Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Frame overhead before the payload.
pub const FRAME_HEADER: usize = 4 + 1 + 8;
/// Frame overhead after the payload.
pub const FRAME_TRAILER: usize = 4;

/// Record types in the journal stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    /// Segment header, first record of every journal file.
    SegmentHeader = 1,
    /// Segment footer, written when a segment is rotated out.
    SegmentEnd = 2,
    /// Page image.
    PageImage = 3,
    /// Checkpoint page map.
    PageMap = 4,
    /// Checkpoint transaction map.
    TxnMap = 5,
    /// Transaction start.
    TxnStart = 6,
    /// Transaction commit.
    TxnCommit = 7,
    /// Transaction rollback.
    TxnRollback = 8,
    /// Tree delete.
    TreeDelete = 9,
    /// Checkpoint marker.
    Checkpoint = 10,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(val: u8) -> Result<RecordType> {
        match val {
            1 => Ok(RecordType::SegmentHeader),
            2 => Ok(RecordType::SegmentEnd),
            3 => Ok(RecordType::PageImage),
            4 => Ok(RecordType::PageMap),
            5 => Ok(RecordType::TxnMap),
            6 => Ok(RecordType::TxnStart),
            7 => Ok(RecordType::TxnCommit),
            8 => Ok(RecordType::TxnRollback),
            9 => Ok(RecordType::TreeDelete),
            10 => Ok(RecordType::Checkpoint),
            val => err_at!(CorruptRecord, msg: "invalid record type {}", val),
        }
    }
}

/// A decoded journal record.
#[derive(Clone, Debug)]
pub struct Record {
    pub typ: RecordType,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(typ: RecordType, timestamp: u64, payload: Vec<u8>) -> Record {
        Record {
            typ,
            timestamp,
            payload,
        }
    }

    /// Encoded frame size for a payload of `n` bytes.
    pub fn frame_size(n: usize) -> usize {
        FRAME_HEADER + n + FRAME_TRAILER
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let length =
            err_at!(FailConvert, u32::try_from(Self::frame_size(self.payload.len())))?;
        let mut buf = Vec::with_capacity(length as usize);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.push(self.typ as u8);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = CRC32.checksum(&buf[4..]);
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Decode one record from the head of `data`. Return the record and
    /// its frame size. `DecodeFail` marks a short buffer, for the caller
    /// to treat as a truncated tail, `CorruptRecord` marks bad content.
    pub fn decode(data: &[u8]) -> Result<(Record, usize)> {
        check_remaining!(data, FRAME_HEADER + FRAME_TRAILER, "record-frame")?;
        let mut scratch = [0_u8; 4];
        scratch.copy_from_slice(&data[..4]);
        let length = u32::from_be_bytes(scratch) as usize;
        if length < FRAME_HEADER + FRAME_TRAILER {
            return err_at!(CorruptRecord, msg: "frame length {}", length);
        }
        check_remaining!(data, length, "record-body")?;

        let crc = {
            let mut scratch = [0_u8; 4];
            scratch.copy_from_slice(&data[length - 4..length]);
            u32::from_be_bytes(scratch)
        };
        let computed = CRC32.checksum(&data[4..length - 4]);
        if crc != computed {
            return err_at!(
                CorruptRecord, msg: "record crc {:x} != {:x}", crc, computed
            );
        }

        let typ = RecordType::try_from(data[4])?;
        let mut scratch = [0_u8; 8];
        scratch.copy_from_slice(&data[5..13]);
        let timestamp = u64::from_be_bytes(scratch);
        let payload = data[FRAME_HEADER..length - 4].to_vec();

        Ok((
            Record {
                typ,
                timestamp,
                payload,
            },
            length,
        ))
    }
}

/// Segment header payload, JH.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct SegmentHeader {
    pub magic: String,
    pub version: u64,
    pub segment_index: u64,
    pub base_at_creation: u64,
}

impl SegmentHeader {
    const ID: u32 = 0x1;

    pub fn new(segment_index: u64, base_at_creation: u64) -> SegmentHeader {
        SegmentHeader {
            magic: "mvbt-journal".to_string(),
            version: 1,
            segment_index,
            base_at_creation,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != "mvbt-journal" || self.version != 1 {
            return err_at!(
                CorruptRecord, msg: "bad segment header {} v{}", self.magic, self.version
            );
        }
        Ok(())
    }
}

/// Segment footer payload, JE.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct SegmentEnd {
    pub segment_index: u64,
    pub end_address: u64,
}

impl SegmentEnd {
    const ID: u32 = 0x2;
}

/// Page-image payload, PA. Raw framing, the page buffer is carried
/// bit-exact.
#[derive(Clone, Debug)]
pub struct PageImage {
    pub volume_id: u32,
    pub address: u64,
    pub page: Vec<u8>,
}

impl PageImage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.page.len());
        buf.extend_from_slice(&self.volume_id.to_be_bytes());
        buf.extend_from_slice(&self.address.to_be_bytes());
        buf.extend_from_slice(&self.page);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<PageImage> {
        check_remaining!(data, 12, "page-image")?;
        let mut scratch = [0_u8; 4];
        scratch.copy_from_slice(&data[..4]);
        let volume_id = u32::from_be_bytes(scratch);
        let mut scratch = [0_u8; 8];
        scratch.copy_from_slice(&data[4..12]);
        let address = u64::from_be_bytes(scratch);
        Ok(PageImage {
            volume_id,
            address,
            page: data[12..].to_vec(),
        })
    }
}

/// One entry in the PM checkpoint payload.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct PageMapEntry {
    pub volume_id: u64,
    pub address: u64,
    pub journal_addr: u64,
    pub generation: u64,
}

impl PageMapEntry {
    const ID: u32 = 0x4;
}

/// PM checkpoint payload, the dirty-page map at checkpoint time.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct PageMapRec {
    pub entries: Vec<PageMapEntry>,
}

impl PageMapRec {
    const ID: u32 = 0x5;
}

/// Transaction state within the TM checkpoint payload.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct TxnEntry {
    pub start_ts: u64,
    /// ZERO for in-flight transactions.
    pub commit_ts: u64,
    pub aborted: bool,
}

impl TxnEntry {
    const ID: u32 = 0x6;
}

/// TM checkpoint payload, the transaction map at checkpoint time.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct TxnMapRec {
    pub entries: Vec<TxnEntry>,
}

impl TxnMapRec {
    const ID: u32 = 0x7;
}

/// TS payload.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct TxnStart {
    pub start_ts: u64,
}

impl TxnStart {
    const ID: u32 = 0x8;
}

/// TC payload.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct TxnCommit {
    pub start_ts: u64,
    pub commit_ts: u64,
}

impl TxnCommit {
    const ID: u32 = 0x9;
}

/// TR payload.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct TxnRollback {
    pub start_ts: u64,
}

impl TxnRollback {
    const ID: u32 = 0xa;
}

/// DT payload, a tree unlinked from its volume's directory.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct TreeDelete {
    pub volume_id: u64,
    pub name: String,
    pub root: u64,
}

impl TreeDelete {
    const ID: u32 = 0xb;
}

/// CU payload. `last_ts` is the timestamp allocator's high water mark,
/// recovery restarts the allocator above it.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct Checkpoint {
    pub checkpoint_ts: u64,
    pub last_ts: u64,
}

impl Checkpoint {
    const ID: u32 = 0xc;
}

/// Helper to decode a CBOR payload.
pub fn decode_payload<T: cbordata::FromCbor>(payload: &[u8]) -> Result<T> {
    Ok(util::from_cbor_bytes(payload)?.0)
}

#[cfg(test)]
#[path = "record_test.rs"]
mod record_test;
