//! Module implement the write-ahead journal.
//!
//! The journal is an append-only stream of records laid over a rolling
//! set of fixed-size segment files. The concatenation of segments forms
//! a logical byte-addressable stream; the *base address* is the
//! earliest byte recovery may still need, the *current address* is
//! where the next record lands. Segments wholly below the base are
//! unlinked, unless the engine runs in append-only archive mode.
//!
//! Before any dirty page reaches its volume file, its page image record
//! must be durable in the journal, and a page write-back always flushes
//! the journal first. Recovery replays page images from the base
//! forward and rebuilds the transaction map from the last checkpoint,
//! so a crash loses at most the un-flushed tail, never a committed
//! (hard-durability) transaction.
//!
//! Three daemons drive the journal, refer [daemon](crate::journal::daemon):
//! the flusher syncs the tail and services group commit, the copier
//! drains dirty pages from the buffer pool back to their volumes and
//! advances the base, the checkpointer periodically writes the CU/PM/TM
//! record group.

use std::{convert::TryFrom, ffi, fmt, fs, path, result, time::Duration};

use crate::{Error, Result};

pub mod daemon;
mod record;
mod recovery;
mod wal;

pub use record::{
    Checkpoint, PageImage, PageMapEntry, PageMapRec, Record, RecordType, SegmentEnd,
    SegmentHeader, TreeDelete, TxnCommit, TxnEntry, TxnMapRec, TxnRollback, TxnStart,
};
pub use recovery::{recover, Recovered};
pub use wal::Journal;

/// Default size for a journal segment file, 1GB.
pub const SEGMENT_SIZE: usize = 1024 * 1024 * 1024;
/// Default interval between flusher cycles.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Default interval between copier cycles.
pub const COPY_INTERVAL: Duration = Duration::from_secs(2);
/// Default interval between checkpoints.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Journal configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Uniquely name journal instances, segment files are named
    /// `{name}-journal-{num}.mvlog`.
    pub name: String,
    /// Directory in which journal segments are stored.
    pub dir: ffi::OsString,
    /// Segment file size, beyond which segments are rotated.
    pub segment_size: usize,
    /// Flusher cycle interval.
    pub flush_interval: Duration,
    /// Copier cycle interval.
    pub copy_interval: Duration,
    /// Checkpoint cycle interval.
    pub checkpoint_interval: Duration,
    /// Archive mode, the copier is disabled and segments are never
    /// unlinked.
    pub append_only: bool,
}

impl Config {
    pub fn new(dir: &ffi::OsStr, name: &str) -> Config {
        Config {
            name: name.to_string(),
            dir: dir.to_os_string(),
            segment_size: SEGMENT_SIZE,
            flush_interval: FLUSH_INTERVAL,
            copy_interval: COPY_INTERVAL,
            checkpoint_interval: CHECKPOINT_INTERVAL,
            append_only: false,
        }
    }

    pub fn set_segment_size(&mut self, segment_size: usize) -> &mut Self {
        self.segment_size = segment_size;
        self
    }

    pub fn set_append_only(&mut self, append_only: bool) -> &mut Self {
        self.append_only = append_only;
        self
    }

    pub fn set_intervals(
        &mut self,
        flush: Duration,
        copy: Duration,
        checkpoint: Duration,
    ) -> &mut Self {
        self.flush_interval = flush;
        self.copy_interval = copy;
        self.checkpoint_interval = checkpoint;
        self
    }
}

/// A journal segment is uniquely located by `(dir, name, num)`, encoded
/// into the file name as `{name}-journal-{num}.mvlog`.
#[derive(Clone)]
pub struct JournalFileName(pub ffi::OsString);

impl From<(String, u64)> for JournalFileName {
    fn from((name, num): (String, u64)) -> JournalFileName {
        let file_name = format!("{}-journal-{}.mvlog", name, num);
        JournalFileName(AsRef::<ffi::OsStr>::as_ref(&file_name).to_os_string())
    }
}

impl TryFrom<JournalFileName> for (String, u64) {
    type Error = Error;

    fn try_from(fname: JournalFileName) -> Result<(String, u64)> {
        let fname_str = match fname.0.to_str() {
            Some(fname_str) => fname_str,
            None => return err_at!(InvalidFile, msg: "{:?}", fname.0),
        };
        let stem = match fname_str.strip_suffix(".mvlog") {
            Some(stem) => stem,
            None => return err_at!(InvalidFile, msg: "{:?} not a journal", fname.0),
        };
        match stem.rsplit_once("-journal-") {
            Some((name, num)) => {
                let num: u64 = err_at!(InvalidFile, num.parse())?;
                Ok((name.to_string(), num))
            }
            None => err_at!(InvalidFile, msg: "{:?} not a journal", fname.0),
        }
    }
}

impl fmt::Display for JournalFileName {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// List journal segments under `config.dir` matching `config.name`,
/// sorted by segment number.
pub fn list_segments(config: &Config) -> Result<Vec<(u64, ffi::OsString)>> {
    let mut segments = vec![];
    let items = match fs::read_dir(&config.dir) {
        Ok(items) => items,
        Err(_) => return Ok(segments), // directory yet to be created
    };
    for item in items {
        let file_name = err_at!(IOError, item)?.file_name();
        match <(String, u64)>::try_from(JournalFileName(file_name.clone())) {
            Ok((name, num)) if name == config.name => {
                let loc: path::PathBuf =
                    [config.dir.clone(), file_name].iter().collect();
                segments.push((num, loc.into_os_string()));
            }
            _ => (),
        }
    }
    segments.sort_by_key(|(num, _)| *num);
    Ok(segments)
}
