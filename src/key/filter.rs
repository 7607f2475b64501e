//! Key-filter, a predicate over key-segment ranges.
//!
//! A [KeyFilter] holds one [Term] per key depth. While traversing, the
//! cursor tests each candidate key with [KeyFilter::selected] and, on
//! rejection, asks [KeyFilter::next] for a position past the rejected
//! region, so that traversal can leap over large swathes of keys instead
//! of visiting them one by one.
//!
//! Filters have a text form, `{term,term,..}` where term is one of:
//!
//! * `*`, accept any segment at this depth.
//! * a literal, `null`, `true`, `false`, `10`, `1.5f`, `"text"`,
//!   `0xA0B1`, accept exactly this segment.
//! * a range, `[low:high]`, with `(`/`)` marking an exclusive bound and
//!   an empty side marking an unbounded one, e.g. `[10:20)`, `(:"m"]`.
//!
//! `parse(s).to_string() == s` holds for the canonical form produced by
//! [KeyFilter::to_string]. A key that equals the upper bound of a
//! rejected (exclusive) range is leapt into the next accepted term.

use std::{cmp, fmt, result};

use crate::{
    key::{decode_segment, Key, Segment},
    Error, Result,
};

/// One per-depth predicate within a [KeyFilter].
#[derive(Clone, Debug)]
pub enum Term {
    /// Accept any segment at this depth.
    Any,
    /// Accept exactly this segment.
    Exact(Segment),
    /// Accept segments within the bounds. `None` means unbounded.
    Range {
        low: Option<Segment>,
        high: Option<Segment>,
        low_incl: bool,
        high_incl: bool,
    },
}

// encoded form of a stand-alone segment, for memcmp comparison.
fn encode_seg(seg: &Segment) -> Vec<u8> {
    let mut key = Key::new();
    key.append(seg.clone()).unwrap();
    key.as_bytes().to_vec()
}

impl Term {
    fn selects(&self, seg_bytes: &[u8]) -> bool {
        match self {
            Term::Any => true,
            Term::Exact(seg) => encode_seg(seg) == seg_bytes,
            Term::Range {
                low,
                high,
                low_incl,
                high_incl,
            } => {
                if let Some(low) = low {
                    let low = encode_seg(low);
                    match seg_bytes.cmp(&low[..]) {
                        cmp::Ordering::Less => return false,
                        cmp::Ordering::Equal if !low_incl => return false,
                        _ => (),
                    }
                }
                if let Some(high) = high {
                    let high = encode_seg(high);
                    match seg_bytes.cmp(&high[..]) {
                        cmp::Ordering::Greater => return false,
                        cmp::Ordering::Equal if !high_incl => return false,
                        _ => (),
                    }
                }
                true
            }
        }
    }

    // smallest encoded segment accepted by this term, None for unbounded.
    fn low_edge(&self) -> Option<(Vec<u8>, bool)> {
        match self {
            Term::Any => None,
            Term::Exact(seg) => Some((encode_seg(seg), true)),
            Term::Range { low: Some(low), low_incl, .. } => {
                Some((encode_seg(low), *low_incl))
            }
            Term::Range { low: None, .. } => None,
        }
    }

    // largest encoded segment accepted by this term, None for unbounded.
    fn high_edge(&self) -> Option<(Vec<u8>, bool)> {
        match self {
            Term::Any => None,
            Term::Exact(seg) => Some((encode_seg(seg), true)),
            Term::Range { high: Some(high), high_incl, .. } => {
                Some((encode_seg(high), *high_incl))
            }
            Term::Range { high: None, .. } => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self {
            Term::Any => write!(f, "*"),
            Term::Exact(seg) => write!(f, "{}", seg),
            Term::Range {
                low,
                high,
                low_incl,
                high_incl,
            } => {
                write!(f, "{}", if *low_incl { '[' } else { '(' })?;
                if let Some(low) = low {
                    write!(f, "{}", low)?;
                }
                write!(f, ":")?;
                if let Some(high) = high {
                    write!(f, "{}", high)?;
                }
                write!(f, "{}", if *high_incl { ']' } else { ')' })
            }
        }
    }
}

/// Filter over keys, one [Term] per depth.
///
/// A key shallower than the filter is rejected; segments deeper than the
/// filter are accepted unconditionally.
#[derive(Clone, Debug, Default)]
pub struct KeyFilter {
    terms: Vec<Term>,
}

impl fmt::Display for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{{")?;
        for (i, term) in self.terms.iter().enumerate() {
            match i {
                0 => write!(f, "{}", term)?,
                _ => write!(f, ",{}", term)?,
            }
        }
        write!(f, "}}")
    }
}

impl KeyFilter {
    pub fn new() -> KeyFilter {
        KeyFilter { terms: vec![] }
    }

    /// Append a term for the next depth.
    pub fn push(mut self, term: Term) -> KeyFilter {
        self.terms.push(term);
        self
    }

    pub fn depth(&self) -> usize {
        self.terms.len()
    }

    /// Whether `key` is accepted by every term of this filter.
    pub fn selected(&self, key: &Key) -> bool {
        if key.is_sentinel() || key.depth() < self.terms.len() {
            return false;
        }
        for (depth, term) in self.terms.iter().enumerate() {
            let seg = match key.to_segment(depth) {
                Ok(seg) => seg,
                Err(_) => return false,
            };
            if !term.selects(&encode_seg(&seg)) {
                return false;
            }
        }
        true
    }

    /// Compute a traversal position past the region rejecting `key`.
    ///
    /// For forward traversal the returned key is a GTEQ seek bound, for
    /// reverse traversal a LTEQ seek bound. Return None when no accepted
    /// key can exist in that direction.
    pub fn next(&self, key: &Key, forward: bool) -> Option<Key> {
        if self.terms.is_empty() {
            return None;
        }

        // encoded prefixes of key, prefix[d] holds segments [0, d).
        let mut prefixes: Vec<Vec<u8>> = vec![vec![]];
        let mut segs: Vec<Vec<u8>> = vec![];
        {
            let data = key.as_bytes();
            let mut off = 0;
            while off < data.len() && segs.len() < self.terms.len() {
                let n = match decode_segment(&data[off..]) {
                    Ok((_, n)) => n,
                    Err(_) => break,
                };
                segs.push(data[off..off + n].to_vec());
                off += n;
                prefixes.push(data[..off].to_vec());
            }
        }

        for (depth, term) in self.terms.iter().enumerate() {
            let seg = match segs.get(depth) {
                Some(seg) => seg,
                // key is shallower than the filter, descend by the
                // smallest step available.
                None => {
                    return match forward {
                        true => self.seek_low(&prefixes[depth], depth),
                        false => self.seek_high(&prefixes[depth], depth),
                    }
                }
            };
            if term.selects(seg) {
                continue;
            }
            return match forward {
                true => match term.low_edge() {
                    Some((low, _)) if &seg[..] < &low[..] => {
                        // leap up to the low edge of this term.
                        self.seek_low(&prefixes[depth], depth)
                    }
                    // past this term's range, exhaust the parent subtree.
                    _ => {
                        let pos = prefix_successor(&prefixes[depth + 1])?;
                        Some(Key::from_raw_position(pos))
                    }
                },
                false => match term.high_edge() {
                    Some((high, _)) if &seg[..] > &high[..] => {
                        self.seek_high(&prefixes[depth], depth)
                    }
                    // below this term's range, exhaust the parent subtree.
                    _ => match prefixes[depth + 1].len() {
                        0 => None,
                        _ => {
                            let pos = prefix_predecessor(&prefixes[depth + 1]);
                            Some(Key::from_raw_position(pos))
                        }
                    },
                },
            };
        }

        // every term selected the key; caller treats this as no-leap.
        Some(key.to_successor())
    }

    // smallest acceptable position under `prefix`, filling low edges
    // from `depth` onwards.
    fn seek_low(&self, prefix: &[u8], depth: usize) -> Option<Key> {
        let mut pos = prefix.to_vec();
        for term in self.terms[depth..].iter() {
            match term.low_edge() {
                Some((low, incl)) => {
                    pos.extend_from_slice(&low);
                    if !incl {
                        // exclusive low bound, step past the exact value.
                        pos.push(0x00);
                        break;
                    }
                }
                // unbounded term, anything under this prefix qualifies.
                None => break,
            }
        }
        Some(Key::from_raw_position(pos))
    }

    // largest acceptable position under `prefix`, filling high edges
    // from `depth` onwards.
    fn seek_high(&self, prefix: &[u8], depth: usize) -> Option<Key> {
        let mut pos = prefix.to_vec();
        match self.terms[depth..].first().and_then(Term::high_edge) {
            Some((high, incl)) => {
                pos.extend_from_slice(&high);
                match incl {
                    // deepest key within the high-edge subtree.
                    true => pos.extend_from_slice(&[0xFF; 8]),
                    false => {
                        let pos = prefix_predecessor(&pos);
                        return Some(Key::from_raw_position(pos));
                    }
                }
            }
            None => pos.extend_from_slice(&[0xFF; 8]),
        }
        Some(Key::from_raw_position(pos))
    }
}

// smallest byte-string greater than every string prefixed by `prefix`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < 0xFF {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

// a byte-string less than `prefix` but not less than any string that
// sorts immediately below the prefix subtree.
fn prefix_predecessor(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    loop {
        match out.pop() {
            Some(0x00) | None => break out,
            Some(last) => {
                out.push(last - 1);
                out.extend_from_slice(&[0xFF; 8]);
                break out;
            }
        }
    }
}

impl KeyFilter {
    /// Parse the text form, refer to module documentation for grammar.
    pub fn parse(text: &str) -> Result<KeyFilter> {
        let text = text.trim();
        let body = match text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
            Some(body) => body,
            None => return err_at!(InvalidInput, msg: "filter must be {{..}} {}", text),
        };

        let mut filter = KeyFilter::new();
        for part in split_terms(body)? {
            let part = part.trim();
            let term = match part {
                "*" => Term::Any,
                part if part.starts_with('[') || part.starts_with('(') => {
                    parse_range(part)?
                }
                part => Term::Exact(parse_literal(part)?),
            };
            filter = filter.push(term);
        }
        Ok(filter)
    }
}

// split on commas that are outside string literals.
fn split_terms(body: &str) -> Result<Vec<String>> {
    let mut parts = vec![];
    let (mut cur, mut in_str, mut esc) = (String::new(), false, false);
    for ch in body.chars() {
        match ch {
            _ if esc => {
                cur.push(ch);
                esc = false;
            }
            '\\' if in_str => {
                cur.push(ch);
                esc = true;
            }
            '"' => {
                cur.push(ch);
                in_str = !in_str;
            }
            ',' if !in_str => {
                parts.push(cur.clone());
                cur.clear();
            }
            _ => cur.push(ch),
        }
    }
    if in_str {
        return err_at!(InvalidInput, msg: "unterminated string in filter");
    }
    if !cur.trim().is_empty() || !parts.is_empty() {
        parts.push(cur);
    }
    Ok(parts)
}

fn parse_range(part: &str) -> Result<Term> {
    let low_incl = part.starts_with('[');
    let high_incl = part.ends_with(']');
    if !part.ends_with(']') && !part.ends_with(')') {
        return err_at!(InvalidInput, msg: "bad range term {}", part);
    }
    let body = &part[1..part.len() - 1];

    let colon = match find_colon(body) {
        Some(colon) => colon,
        None => return err_at!(InvalidInput, msg: "range needs `:` {}", part),
    };
    let (low, high) = (body[..colon].trim(), body[colon + 1..].trim());

    let low = match low.is_empty() {
        true => None,
        false => Some(parse_literal(low)?),
    };
    let high = match high.is_empty() {
        true => None,
        false => Some(parse_literal(high)?),
    };
    Ok(Term::Range {
        low,
        high,
        low_incl,
        high_incl,
    })
}

// locate the `:` separator outside string literals.
fn find_colon(body: &str) -> Option<usize> {
    let (mut in_str, mut esc) = (false, false);
    for (i, ch) in body.char_indices() {
        match ch {
            _ if esc => esc = false,
            '\\' if in_str => esc = true,
            '"' => in_str = !in_str,
            ':' if !in_str => return Some(i),
            _ => (),
        }
    }
    None
}

fn parse_literal(text: &str) -> Result<Segment> {
    match text {
        "null" => return Ok(Segment::Null),
        "true" => return Ok(Segment::Bool(true)),
        "false" => return Ok(Segment::Bool(false)),
        _ => (),
    }
    if let Some(hex) = text.strip_prefix("0x") {
        if hex.len() % 2 != 0 {
            return err_at!(InvalidInput, msg: "odd hex literal {}", text);
        }
        let mut bytes = vec![];
        for i in (0..hex.len()).step_by(2) {
            bytes.push(err_at!(InvalidInput, u8::from_str_radix(&hex[i..i + 2], 16))?);
        }
        return Ok(Segment::Bytes(bytes));
    }
    if text.starts_with('"') && text.ends_with('"') && text.len() >= 2 {
        let body = &text[1..text.len() - 1];
        let (mut out, mut esc) = (String::new(), false);
        for ch in body.chars() {
            match ch {
                _ if esc => {
                    out.push(ch);
                    esc = false;
                }
                '\\' => esc = true,
                _ => out.push(ch),
            }
        }
        return Ok(Segment::Text(out));
    }
    if let Some(num) = text.strip_suffix('f') {
        return Ok(Segment::Float(err_at!(InvalidInput, num.parse::<f64>())?));
    }
    Ok(Segment::Integer(err_at!(InvalidInput, text.parse::<i64>())?))
}

#[cfg(test)]
#[path = "filter_test.rs"]
mod filter_test;
