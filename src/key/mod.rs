//! Module implement ordered, typed keys and key-filters.
//!
//! A [Key] is an ordered sequence of typed segments. Segments are encoded
//! such that byte-wise comparison of two encoded keys reproduce the domain
//! order of the underlying values, across all segment types. This property
//! is what allows btree pages to compare keys with plain `memcmp`, without
//! decoding them.
//!
//! Encoding rules:
//!
//! * Each segment starts with a type-tag byte, tag values are ordered the
//!   same as the cross-type ordering: null < false < true < integer <
//!   float < bytes < text < custom.
//! * Integers are encoded as 8-byte big-endian with the sign-bit flipped.
//! * Floats are encoded using the IEEE-754 trick, positive values get the
//!   sign bit flipped, negative values get all bits flipped.
//! * Bytes and text are terminated with 0x00; data bytes 0x00 and 0x01
//!   are escaped as (0x01, 0x00) and (0x01, 0x01).
//! * Custom segments carry a one-byte coder descriptor (refer [codec])
//!   followed by escaped application bytes.
//!
//! The sentinel keys [Key::before] and [Key::after] sort below and above
//! every real key, they are valid only as cursor positions.
//!
//! [codec]: crate::codec

use arbitrary::Arbitrary;

use std::{cmp, fmt, result};

use crate::{Error, Result};

mod filter;

pub use filter::{KeyFilter, Term};

/// Maximum length for a key, in its encoded form.
pub const MAX_KEY_LENGTH: usize = 2047;

pub(crate) const TAG_BEFORE: u8 = 0x01;
pub(crate) const TAG_NULL: u8 = 0x05;
pub(crate) const TAG_FALSE: u8 = 0x10;
pub(crate) const TAG_TRUE: u8 = 0x11;
pub(crate) const TAG_INTEGER: u8 = 0x20;
pub(crate) const TAG_FLOAT: u8 = 0x30;
pub(crate) const TAG_BYTES: u8 = 0x40;
pub(crate) const TAG_TEXT: u8 = 0x60;
pub(crate) const TAG_CUSTOM: u8 = 0x70;
pub(crate) const TAG_AFTER: u8 = 0xFE;

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;

/// A single typed value within a [Key].
#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    /// Application-encoded segment: a coder descriptor plus the
    /// order-preserving bytes produced by the matching
    /// [Registry][crate::codec::Registry] coder. The core carries both
    /// verbatim, marshalling in and out of the application type
    /// happens through the registry.
    Custom(u8, Vec<u8>),
}

impl<'a> Arbitrary<'a> for Segment {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let seg = match u.int_in_range(0..=5)? {
            0 => Segment::Null,
            1 => Segment::Bool(u.arbitrary()?),
            2 => Segment::Integer(u.arbitrary()?),
            3 => {
                // keep NaN out of arbitrary keys, total order over NaN is
                // encoding-defined and not interesting for ordering tests.
                let f: f64 = u.arbitrary()?;
                Segment::Float(if f.is_nan() { 0.0 } else { f })
            }
            4 => Segment::Bytes(u.arbitrary()?),
            _ => Segment::Text(u.arbitrary()?),
        };
        Ok(seg)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self {
            Segment::Null => write!(f, "null"),
            Segment::Bool(val) => write!(f, "{}", val),
            Segment::Integer(val) => write!(f, "{}", val),
            Segment::Float(val) => write!(f, "{}f", val),
            Segment::Bytes(val) => {
                write!(f, "0x")?;
                for byt in val.iter() {
                    write!(f, "{:02X}", byt)?;
                }
                Ok(())
            }
            Segment::Text(val) => write!(f, "{:?}", val),
            Segment::Custom(desc, val) => {
                write!(f, "c{}:0x", desc)?;
                for byt in val.iter() {
                    write!(f, "{:02X}", byt)?;
                }
                Ok(())
            }
        }
    }
}

/// Ordered key made up of typed segments.
///
/// Keys are mutable buffers, a key value is typically owned by an
/// [Exchange][crate::Exchange] and re-used across operations via
/// [Key::clear], [Key::cut] and the `append_*` methods.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Key {
    data: Vec<u8>,
    offsets: Vec<usize>, // start offset of each appended segment
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "Key<{:?}>", self.data)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        if self.is_before() {
            return write!(f, "{{BEFORE}}");
        } else if self.is_after() {
            return write!(f, "{{AFTER}}");
        }
        let segs = match self.to_segments() {
            Ok(segs) => segs,
            Err(_) => return write!(f, "Key<{:?}>", self.data),
        };
        write!(f, "{{")?;
        for (i, seg) in segs.iter().enumerate() {
            match i {
                0 => write!(f, "{}", seg)?,
                _ => write!(f, ",{}", seg)?,
            }
        }
        write!(f, "}}")
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.data.cmp(&other.data)
    }
}

impl<'a> Arbitrary<'a> for Key {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let segs: Vec<Segment> = u.arbitrary()?;
        let mut key = Key::new();
        for seg in segs.into_iter().take(4) {
            key.append(seg).ok();
        }
        Ok(key)
    }
}

impl Key {
    /// Create an empty key. An empty key is not a valid btree position,
    /// append segments before using it with store/fetch operations.
    pub fn new() -> Key {
        Key {
            data: Vec::default(),
            offsets: Vec::default(),
        }
    }

    /// Sentinel key sorting below every real key.
    pub fn before() -> Key {
        Key {
            data: vec![TAG_BEFORE],
            offsets: vec![0],
        }
    }

    /// Sentinel key sorting above every real key.
    pub fn after() -> Key {
        Key {
            data: vec![TAG_AFTER],
            offsets: vec![0],
        }
    }

    // Raw byte position used as a traversal seek bound. Not necessarily
    // a well-formed key, never hand one to store/fetch.
    pub(crate) fn from_raw_position(data: Vec<u8>) -> Key {
        Key {
            data,
            offsets: vec![],
        }
    }

    /// Rebuild a key from its encoded form. Validates segment structure.
    pub fn from_encoded(data: &[u8]) -> Result<Key> {
        let offsets = validate_encoded(data)?;
        let key = Key {
            data: data.to_vec(),
            offsets,
        };
        Ok(key)
    }

    pub fn is_before(&self) -> bool {
        self.data.first() == Some(&TAG_BEFORE)
    }

    pub fn is_after(&self) -> bool {
        self.data.first() == Some(&TAG_AFTER)
    }

    pub fn is_sentinel(&self) -> bool {
        self.is_before() || self.is_after()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of segments in this key.
    pub fn depth(&self) -> usize {
        self.offsets.len()
    }

    /// Encoded byte representation, suitable for memcmp ordering.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Remove all segments.
    pub fn clear(&mut self) -> &mut Self {
        self.data.clear();
        self.offsets.clear();
        self
    }

    /// Remove the last segment, no-op on an empty key.
    pub fn cut(&mut self) -> &mut Self {
        if let Some(off) = self.offsets.pop() {
            self.data.truncate(off);
        }
        self
    }

    /// Replace the last segment with `seg`, append if empty.
    pub fn to(&mut self, seg: Segment) -> Result<&mut Self> {
        self.cut();
        self.append(seg)
    }
}

impl Key {
    /// Append a typed segment. Fail with [Error::KeyTooLong] if the
    /// encoded form would exceed [MAX_KEY_LENGTH].
    pub fn append(&mut self, seg: Segment) -> Result<&mut Self> {
        if self.is_sentinel() {
            return err_at!(InvalidInput, msg: "cannot append to sentinel key");
        }

        let off = self.data.len();
        match &seg {
            Segment::Null => self.data.push(TAG_NULL),
            Segment::Bool(false) => self.data.push(TAG_FALSE),
            Segment::Bool(true) => self.data.push(TAG_TRUE),
            Segment::Integer(val) => {
                self.data.push(TAG_INTEGER);
                let bits = (*val as u64) ^ 0x8000_0000_0000_0000;
                self.data.extend_from_slice(&bits.to_be_bytes());
            }
            Segment::Float(val) => {
                self.data.push(TAG_FLOAT);
                let bits = val.to_bits();
                let bits = if (bits & 0x8000_0000_0000_0000) == 0 {
                    bits ^ 0x8000_0000_0000_0000
                } else {
                    !bits
                };
                self.data.extend_from_slice(&bits.to_be_bytes());
            }
            Segment::Bytes(val) => {
                self.data.push(TAG_BYTES);
                escape_into(val, &mut self.data);
                self.data.push(TERMINATOR);
            }
            Segment::Text(val) => {
                self.data.push(TAG_TEXT);
                escape_into(val.as_bytes(), &mut self.data);
                self.data.push(TERMINATOR);
            }
            Segment::Custom(desc, val) => {
                self.data.push(TAG_CUSTOM);
                self.data.push(*desc);
                escape_into(val, &mut self.data);
                self.data.push(TERMINATOR);
            }
        }

        if self.data.len() > MAX_KEY_LENGTH {
            self.data.truncate(off);
            return err_at!(KeyTooLong, msg: "key exceeds {} bytes", MAX_KEY_LENGTH);
        }
        self.offsets.push(off);
        Ok(self)
    }

    pub fn append_null(&mut self) -> Result<&mut Self> {
        self.append(Segment::Null)
    }

    pub fn append_bool(&mut self, val: bool) -> Result<&mut Self> {
        self.append(Segment::Bool(val))
    }

    pub fn append_i64(&mut self, val: i64) -> Result<&mut Self> {
        self.append(Segment::Integer(val))
    }

    pub fn append_f64(&mut self, val: f64) -> Result<&mut Self> {
        self.append(Segment::Float(val))
    }

    pub fn append_bytes(&mut self, val: &[u8]) -> Result<&mut Self> {
        self.append(Segment::Bytes(val.to_vec()))
    }

    pub fn append_str(&mut self, val: &str) -> Result<&mut Self> {
        self.append(Segment::Text(val.to_string()))
    }
}

impl Key {
    /// Decode segment at `depth`, 0-indexed.
    pub fn to_segment(&self, depth: usize) -> Result<Segment> {
        let off = match self.offsets.get(depth) {
            Some(off) => *off,
            None => return err_at!(InvalidInput, msg: "no segment at {}", depth),
        };
        let (seg, _) = decode_segment(&self.data[off..])?;
        Ok(seg)
    }

    /// Decode all segments.
    pub fn to_segments(&self) -> Result<Vec<Segment>> {
        let mut segs = Vec::with_capacity(self.offsets.len());
        for depth in 0..self.offsets.len() {
            segs.push(self.to_segment(depth)?);
        }
        Ok(segs)
    }

    /// Smallest key strictly greater than self, in encoded order.
    pub fn to_successor(&self) -> Key {
        let mut data = self.data.clone();
        data.push(TERMINATOR);
        Key {
            data,
            offsets: self.offsets.clone(),
        }
    }

    /// Whether `other` is the same key or a descendant, that is, self's
    /// segments form a prefix of other's segments.
    pub fn is_prefix_of(&self, other: &Key) -> bool {
        other.data.starts_with(&self.data)
    }
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for byt in data.iter() {
        match *byt {
            TERMINATOR => out.extend_from_slice(&[ESCAPE, TERMINATOR]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPE]),
            byt => out.push(byt),
        }
    }
}

// unescape data upto, not including, the terminator. return
// (unescaped-bytes, encoded-length-including-terminator).
fn unescape(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = vec![];
    let mut n = 0;
    loop {
        match data.get(n) {
            Some(&TERMINATOR) => break Ok((out, n + 1)),
            Some(&ESCAPE) => match data.get(n + 1) {
                Some(&byt) if byt == TERMINATOR || byt == ESCAPE => {
                    out.push(byt);
                    n += 2;
                }
                _ => break err_at!(DecodeFail, msg: "bad escape at {}", n),
            },
            Some(&byt) => {
                out.push(byt);
                n += 1;
            }
            None => break err_at!(DecodeFail, msg: "missing terminator"),
        }
    }
}

// decode one segment from the head of data, return (segment, encoded-length).
pub(crate) fn decode_segment(data: &[u8]) -> Result<(Segment, usize)> {
    let tag = match data.first() {
        Some(tag) => *tag,
        None => return err_at!(DecodeFail, msg: "empty segment"),
    };
    match tag {
        TAG_NULL => Ok((Segment::Null, 1)),
        TAG_FALSE => Ok((Segment::Bool(false), 1)),
        TAG_TRUE => Ok((Segment::Bool(true), 1)),
        TAG_INTEGER => {
            check_remaining!(data, 9, "key-integer")?;
            let mut scratch = [0_u8; 8];
            scratch.copy_from_slice(&data[1..9]);
            let bits = u64::from_be_bytes(scratch) ^ 0x8000_0000_0000_0000;
            Ok((Segment::Integer(bits as i64), 9))
        }
        TAG_FLOAT => {
            check_remaining!(data, 9, "key-float")?;
            let mut scratch = [0_u8; 8];
            scratch.copy_from_slice(&data[1..9]);
            let bits = u64::from_be_bytes(scratch);
            let bits = if (bits & 0x8000_0000_0000_0000) != 0 {
                bits ^ 0x8000_0000_0000_0000
            } else {
                !bits
            };
            Ok((Segment::Float(f64::from_bits(bits)), 9))
        }
        TAG_BYTES => {
            let (val, n) = unescape(&data[1..])?;
            Ok((Segment::Bytes(val), n + 1))
        }
        TAG_TEXT => {
            let (val, n) = unescape(&data[1..])?;
            let val = err_at!(DecodeFail, String::from_utf8(val))?;
            Ok((Segment::Text(val), n + 1))
        }
        TAG_CUSTOM => {
            check_remaining!(data, 2, "key-custom")?;
            let desc = data[1];
            let (val, n) = unescape(&data[2..])?;
            Ok((Segment::Custom(desc, val), n + 2))
        }
        tag => err_at!(DecodeFail, msg: "invalid segment tag {}", tag),
    }
}

// validate an encoded key, return segment offsets.
fn validate_encoded(data: &[u8]) -> Result<Vec<usize>> {
    match data.first() {
        Some(&TAG_BEFORE) | Some(&TAG_AFTER) if data.len() == 1 => return Ok(vec![0]),
        _ => (),
    }
    if data.len() > MAX_KEY_LENGTH {
        return err_at!(KeyTooLong, msg: "key exceeds {} bytes", MAX_KEY_LENGTH);
    }

    let mut offsets = vec![];
    let mut off = 0;
    while off < data.len() {
        offsets.push(off);
        let (_, n) = decode_segment(&data[off..])?;
        off += n;
    }
    Ok(offsets)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
