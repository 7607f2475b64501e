//! Package implement an embeddable, transactional, ordered key/value
//! storage engine backed by paged, memory-managed files.
//!
//! Data is organised as one or more [Volume] files, each holding a set of
//! named btree instances. Pages from volume files are cached in a shared
//! buffer [pool], every mutation is journaled by the [journal] manager
//! before it can reach the volume file, and the [txn] layer renders
//! concurrent readers and writers serializable upto snapshot-isolation
//! using multi-version-values.
//!
//! **Getting started**
//!
//! ```ignore
//! let mut config = Config::new("/opt/data");
//! config.add_volume(VolumeSpec::new("main").set_create(true));
//! let engine = Engine::open(config)?;
//!
//! let session = engine.session();
//! let mut ex = session.exchange("main", "inventory")?;
//! ex.key_mut().append_str("part")?.append_i64(10)?;
//! ex.value_mut().set(b"widget");
//! ex.store()?;
//! ```
//!
//! Every read and write operation goes through an [Exchange] cursor,
//! which binds a session to a `(volume, tree)` pair. Wrap operations
//! between [Session::begin] and [Session::commit] for atomic,
//! multi-version behavior, or use the exchange directly for primordial
//! single-operation semantics.
//!
//! [Volume]: vol::Volume
//! [pool]: pool::Pool

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use mvbt::Error;
/// err_at!(ParseError, msg: "bad argument");
/// ```
///
/// ```ignore
/// use mvbt::Error;
/// err_at!(ParseError, std::io::read(buf));
/// ```
///
/// ```ignore
/// use mvbt::Error;
/// err_at!(ParseError, std::fs::read(file_path), "read failed");
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

#[macro_use]
pub mod util;
pub mod btree;
pub mod codec;
mod config;
mod engine;
mod exchange;
pub mod journal;
pub mod key;
pub mod mvv;
pub mod page;
pub mod pool;
pub mod txn;
mod value;
pub mod vol;

pub use crate::config::Config;
pub use crate::engine::{Engine, ExportScan};
pub use crate::exchange::{Direction, Exchange};
pub use crate::key::{Key, KeyFilter};
pub use crate::txn::{Durability, Session};
pub use crate::value::Value;
pub use crate::vol::VolumeSpec;

/// Type alias for Result return type, used across this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that are returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, along with a formatted message.
pub enum Error {
    Fatal(String, String),
    IOError(String, String),
    FailConvert(String, String),
    FailCbor(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
    InvalidFile(String, String),
    InvalidInput(String, String),
    DecodeFail(String, String),
    CorruptPage(String, String),
    CorruptRecord(String, String),
    Timeout(String, String),
    InUse(String, String),
    Interrupted(String, String),
    KeyTooLong(String, String),
    TreeNotFound(String, String),
    TreeExists(String, String),
    VolumeFull(String, String),
    WrongVolume(String, String),
    ReadOnlyVolume(String, String),
    Conflict(String, String),
    Rollback(String, String),
    TxnFailed(String, String),
    Fenced(String, String),
}

impl Error {
    /// Concurrency errors, latch contention and flush timeouts, can be
    /// retried by the caller once the contending operation completes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_, _) | Error::InUse(_, _) | Error::Interrupted(_, _)
        )
    }

    /// Rollback is expected control flow for transactions, typically
    /// handled by retrying the transaction from its begin.
    pub fn is_rollback(&self) -> bool {
        matches!(self, Error::Rollback(_, _) | Error::Conflict(_, _))
    }

    fn parts(&self) -> (&'static str, &String, &String) {
        match self {
            Error::Fatal(p, m) => ("Fatal", p, m),
            Error::IOError(p, m) => ("IOError", p, m),
            Error::FailConvert(p, m) => ("FailConvert", p, m),
            Error::FailCbor(p, m) => ("FailCbor", p, m),
            Error::IPCFail(p, m) => ("IPCFail", p, m),
            Error::ThreadFail(p, m) => ("ThreadFail", p, m),
            Error::InvalidFile(p, m) => ("InvalidFile", p, m),
            Error::InvalidInput(p, m) => ("InvalidInput", p, m),
            Error::DecodeFail(p, m) => ("DecodeFail", p, m),
            Error::CorruptPage(p, m) => ("CorruptPage", p, m),
            Error::CorruptRecord(p, m) => ("CorruptRecord", p, m),
            Error::Timeout(p, m) => ("Timeout", p, m),
            Error::InUse(p, m) => ("InUse", p, m),
            Error::Interrupted(p, m) => ("Interrupted", p, m),
            Error::KeyTooLong(p, m) => ("KeyTooLong", p, m),
            Error::TreeNotFound(p, m) => ("TreeNotFound", p, m),
            Error::TreeExists(p, m) => ("TreeExists", p, m),
            Error::VolumeFull(p, m) => ("VolumeFull", p, m),
            Error::WrongVolume(p, m) => ("WrongVolume", p, m),
            Error::ReadOnlyVolume(p, m) => ("ReadOnlyVolume", p, m),
            Error::Conflict(p, m) => ("Conflict", p, m),
            Error::Rollback(p, m) => ("Rollback", p, m),
            Error::TxnFailed(p, m) => ("TxnFailed", p, m),
            Error::Fenced(p, m) => ("Fenced", p, m),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let (name, prefix, msg) = self.parts();
        write!(f, "{}<{}; {}>", name, prefix, msg)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let (name, prefix, msg) = self.parts();
        write!(f, "{}<{}; {}>", name, prefix, msg)
    }
}

impl error::Error for Error {}
