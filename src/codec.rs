//! Coder registry for application-typed key segments.
//!
//! The key encoder stores [Segment::Custom] segments verbatim, a
//! one-byte coder descriptor plus opaque bytes; the storage core never
//! interprets the payload. This registry is the application-facing
//! table that produces and consumes those bytes. Applications that
//! need domain types beyond the built-in segments, decimals for
//! instance, register a [Coder] under a descriptor at startup, build
//! segments with [Registry::encode_segment] and read them back with
//! [Registry::decode_segment]. The coder's `encode` is responsible for
//! producing bytes whose memcmp order matches the domain order of the
//! type, the same contract every built-in segment honors. Dispatch is
//! a flat table lookup on the descriptor.
//!
//! [Segment::Custom]: crate::key::Segment

use std::any::Any;

use crate::{key::Segment, Error, Result};

/// Encode callback, marshal `value` into order-preserving bytes.
pub type EncodeFn = fn(value: &dyn Any, out: &mut Vec<u8>) -> Result<()>;

/// Decode callback, reverse of [EncodeFn].
pub type DecodeFn = fn(data: &[u8]) -> Result<Box<dyn Any>>;

/// A registered pair of encode/decode callbacks.
#[derive(Clone)]
pub struct Coder {
    pub name: String,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

/// Table of [Coder] entries, keyed by their one-byte descriptor.
pub struct Registry {
    coders: Vec<Option<Coder>>,
}

impl Default for Registry {
    fn default() -> Registry {
        Registry {
            coders: vec![None; 256],
        }
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register `coder` under `desc`. Fail if the descriptor is taken.
    pub fn register(&mut self, desc: u8, coder: Coder) -> Result<()> {
        let slot = &mut self.coders[desc as usize];
        match slot {
            Some(old) => err_at!(
                InvalidInput, msg: "descriptor {} taken by {}", desc, old.name
            ),
            None => {
                *slot = Some(coder);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, desc: u8) -> Result<&Coder> {
        match &self.coders[desc as usize] {
            Some(coder) => Ok(coder),
            None => err_at!(InvalidInput, msg: "no coder for descriptor {}", desc),
        }
    }

    /// Marshal `value` through the coder registered under `desc`.
    pub fn encode(&self, desc: u8, value: &dyn Any) -> Result<Vec<u8>> {
        let coder = self.lookup(desc)?;
        let mut out = vec![];
        (coder.encode)(value, &mut out)?;
        Ok(out)
    }

    /// Unmarshal `data` through the coder registered under `desc`.
    pub fn decode(&self, desc: u8, data: &[u8]) -> Result<Box<dyn Any>> {
        let coder = self.lookup(desc)?;
        (coder.decode)(data)
    }

    /// Marshal `value` into a key segment carrying `desc`.
    pub fn encode_segment(&self, desc: u8, value: &dyn Any) -> Result<Segment> {
        Ok(Segment::Custom(desc, self.encode(desc, value)?))
    }

    /// Unmarshal a [Segment::Custom] through its carried descriptor.
    pub fn decode_segment(&self, seg: &Segment) -> Result<Box<dyn Any>> {
        match seg {
            Segment::Custom(desc, data) => self.decode(*desc, data),
            seg => err_at!(InvalidInput, msg: "not a custom segment {}", seg),
        }
    }
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
