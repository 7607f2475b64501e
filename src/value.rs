//! Value buffer, a length-prefixed byte sequence.
//!
//! The storage core treats values as opaque bytes. Application level
//! encoding, if any, is layered on top via [codec][crate::codec] and is
//! not interpreted here.

use std::{fmt, result};

/// Mutable value buffer, owned by an [Exchange][crate::Exchange] and
/// re-used across fetch/store operations.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Value {
    data: Vec<u8>,
    defined: bool,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self.defined {
            true => write!(f, "Value<{} bytes>", self.data.len()),
            false => write!(f, "Value<undefined>"),
        }
    }
}

impl Value {
    pub fn new() -> Value {
        Value {
            data: Vec::default(),
            defined: false,
        }
    }

    /// Construct a defined value from bytes.
    pub fn from_bytes(data: Vec<u8>) -> Value {
        Value {
            data,
            defined: true,
        }
    }

    /// Replace content with `data` and mark the value defined.
    pub fn set(&mut self, data: &[u8]) -> &mut Self {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.defined = true;
        self
    }

    /// Mark the value undefined, fetch of a missing key leaves the
    /// value in this state.
    pub fn undefine(&mut self) -> &mut Self {
        self.data.clear();
        self.defined = false;
        self
    }

    /// Whether the last fetch found a live value, or a store has been
    /// staged into this buffer.
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
