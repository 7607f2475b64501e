//! Multi-version-values, MVV, the unit of snapshot isolation.
//!
//! A btree cell normally holds a bare value. Once a key is touched inside
//! a transaction the cell is promoted to an MVV, a marker byte followed
//! by a list of versions, each stamped with the version-handle of the
//! writing transaction. Readers resolve the version visible at their
//! snapshot timestamp, writers append versions, and pruning folds the
//! list back down once history is no longer needed.
//!
//! Cell encoding:
//!
//! * First byte 0xFE marks an MVV, 0xFF escapes a bare value whose first
//!   byte would otherwise collide with a marker. Any other first byte is
//!   a bare value.
//! * Each version is `{handle: u64 BE, length: u32 BE, bytes}`. A
//!   zero-length version is a tombstone. Versions are kept sorted
//!   ascending by handle.
//!
//! A version-handle packs `(start_timestamp << 16) | step`, `step`
//! disambiguates writes of the same transaction to the same key. The
//! primordial handle ZERO denotes a value committed before transaction
//! bookkeeping began, it is visible to every snapshot.

use std::convert::TryFrom;

use crate::{Error, Result};

/// First byte of an MVV cell.
pub const TYPE_MVV: u8 = 0xFE;
/// Escape byte for bare values starting with 0xFE or 0xFF.
pub const TYPE_ESCAPE: u8 = 0xFF;

/// Version handle of primordial values, treated as committed at t=0.
pub const PRIMORDIAL: u64 = 0;

/// Number of low bits in a version handle carrying the step.
pub const STEP_BITS: u32 = 16;

const VERSION_HDR: usize = 8 + 4;

/// Pack `(start_timestamp, step)` into a version handle.
#[inline]
pub fn to_handle(start_ts: u64, step: u16) -> u64 {
    (start_ts << STEP_BITS) | (step as u64)
}

/// Start timestamp carried by a version handle.
#[inline]
pub fn handle_ts(handle: u64) -> u64 {
    handle >> STEP_BITS
}

/// Commit state of the transaction owning a version, resolved by the
/// transaction registry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Visibility {
    /// Transaction committed at the carried timestamp.
    Committed(u64),
    /// Transaction rolled back, its versions are garbage.
    Aborted,
    /// Transaction still in flight.
    Active,
}

/// A decoded version within an MVV cell.
#[derive(Clone, Debug, PartialEq)]
pub struct Version<'a> {
    pub handle: u64,
    pub data: &'a [u8],
}

impl<'a> Version<'a> {
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.data.is_empty()
    }
}

/// Whether `cell` is an MVV, as opposed to a bare value.
#[inline]
pub fn is_mvv(cell: &[u8]) -> bool {
    cell.first() == Some(&TYPE_MVV)
}

/// Encode a bare, primordial value into cell form.
pub fn encode_bare(value: &[u8]) -> Vec<u8> {
    match value.first() {
        Some(&TYPE_MVV) | Some(&TYPE_ESCAPE) => {
            let mut cell = Vec::with_capacity(value.len() + 1);
            cell.push(TYPE_ESCAPE);
            cell.extend_from_slice(value);
            cell
        }
        _ => value.to_vec(),
    }
}

/// Decode a bare cell back into value bytes. Caller must have ruled out
/// [is_mvv].
pub fn decode_bare(cell: &[u8]) -> &[u8] {
    match cell.first() {
        Some(&TYPE_ESCAPE) => &cell[1..],
        _ => cell,
    }
}

/// Decode the version list of an MVV cell.
pub fn versions(cell: &[u8]) -> Result<Vec<Version>> {
    if !is_mvv(cell) {
        return err_at!(DecodeFail, msg: "not an mvv cell");
    }
    let mut vers = vec![];
    let mut off = 1;
    while off < cell.len() {
        check_remaining!(&cell[off..], VERSION_HDR, "mvv-version")?;
        let mut scratch = [0_u8; 8];
        scratch.copy_from_slice(&cell[off..off + 8]);
        let handle = u64::from_be_bytes(scratch);
        let mut scratch = [0_u8; 4];
        scratch.copy_from_slice(&cell[off + 8..off + 12]);
        let length = u32::from_be_bytes(scratch) as usize;
        off += VERSION_HDR;
        check_remaining!(&cell[off..], length, "mvv-bytes")?;
        vers.push(Version {
            handle,
            data: &cell[off..off + length],
        });
        off += length;
    }
    Ok(vers)
}

fn encode_versions(vers: &[(u64, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut cell = vec![TYPE_MVV];
    for (handle, data) in vers.iter() {
        cell.extend_from_slice(&handle.to_be_bytes());
        let length = err_at!(FailConvert, u32::try_from(data.len()))?;
        cell.extend_from_slice(&length.to_be_bytes());
        cell.extend_from_slice(data);
    }
    Ok(cell)
}

/// Append a version to `cell`, promoting a bare cell to an MVV. A
/// version with the same handle is replaced in place. Returns the new
/// cell bytes.
pub fn append_version(cell: Option<&[u8]>, handle: u64, value: &[u8]) -> Result<Vec<u8>> {
    let mut vers: Vec<(u64, Vec<u8>)> = match cell {
        Some(cell) if is_mvv(cell) => versions(cell)?
            .into_iter()
            .map(|v| (v.handle, v.data.to_vec()))
            .collect(),
        Some(cell) => vec![(PRIMORDIAL, decode_bare(cell).to_vec())],
        None => vec![],
    };

    match vers.binary_search_by_key(&handle, |(h, _)| *h) {
        Ok(i) => vers[i].1 = value.to_vec(),
        Err(i) => vers.insert(i, (handle, value.to_vec())),
    }
    encode_versions(&vers)
}

/// Scan `cell` for a version conflicting with a writer whose snapshot
/// started at `start_ts`. A version from another transaction that is
/// still active, or that committed after the writer's snapshot, makes
/// the write a lost-update hazard.
pub fn is_conflicting<F>(cell: &[u8], start_ts: u64, resolve: F) -> Result<bool>
where
    F: Fn(u64) -> Visibility,
{
    if !is_mvv(cell) {
        return Ok(false);
    }
    for ver in versions(cell)?.into_iter() {
        let ver_ts = handle_ts(ver.handle);
        if ver.handle == PRIMORDIAL || ver_ts == start_ts {
            continue;
        }
        match resolve(ver_ts) {
            Visibility::Committed(commit_ts) if commit_ts > start_ts => {
                return Ok(true)
            }
            Visibility::Active => return Ok(true),
            _ => (),
        }
    }
    Ok(false)
}

/// Resolve the value visible to a reader.
///
/// `own_start` carries the reader's transaction start timestamp when the
/// reader runs inside a transaction; its own writes are always visible,
/// latest step winning. Among the rest, the version with the greatest
/// commit timestamp at-or-before `read_ts` wins. `None` means the key is
/// invisible, either missing history or shadowed by a tombstone.
pub fn read_visible<F>(
    cell: &[u8],
    own_start: Option<u64>,
    read_ts: u64,
    resolve: F,
) -> Result<Option<Vec<u8>>>
where
    F: Fn(u64) -> Visibility,
{
    if !is_mvv(cell) {
        return Ok(Some(decode_bare(cell).to_vec()));
    }

    let vers = versions(cell)?;

    // own writes win, the greatest step is the latest.
    if let Some(own) = own_start {
        let ver = vers
            .iter()
            .filter(|v| v.handle != PRIMORDIAL && handle_ts(v.handle) == own)
            .max_by_key(|v| v.handle);
        if let Some(ver) = ver {
            return Ok(match ver.is_tombstone() {
                true => None,
                false => Some(ver.data.to_vec()),
            });
        }
    }

    // (commit_ts, handle, version), the latest commit wins, ties broken
    // by the greater handle.
    let mut best: Option<(u64, u64, &Version)> = None;
    for ver in vers.iter() {
        let commit_ts = match ver.handle {
            PRIMORDIAL => 0,
            handle => match resolve(handle_ts(handle)) {
                Visibility::Committed(commit_ts) if commit_ts <= read_ts => commit_ts,
                _ => continue,
            },
        };
        best = match best {
            Some((ts, handle, _)) if (ts, handle) >= (commit_ts, ver.handle) => best,
            _ => Some((commit_ts, ver.handle, ver)),
        };
    }

    Ok(match best {
        Some((_, _, ver)) if !ver.is_tombstone() => Some(ver.data.to_vec()),
        _ => None,
    })
}

/// Outcome of [prune].
pub struct Pruned {
    /// Re-encoded cell. Empty means every version was pruned away and
    /// the key itself can be removed from the page.
    pub cell: Vec<u8>,
    /// Whether the cell changed at all.
    pub changed: bool,
}

/// Drop versions that no snapshot can ever need again.
///
/// `horizon` is the oldest start timestamp among live transactions;
/// versions shadowed by a newer committed version at-or-before the
/// horizon, and versions of aborted transactions, are removed. When one
/// committed non-tombstone version remains below the horizon the cell
/// collapses back to a bare value.
pub fn prune<F>(cell: &[u8], horizon: u64, resolve: F) -> Result<Pruned>
where
    F: Fn(u64) -> Visibility,
{
    if !is_mvv(cell) {
        return Ok(Pruned {
            cell: cell.to_vec(),
            changed: false,
        });
    }

    // (handle, commit_ts, data); None commit_ts for in-flight versions.
    let mut kept: Vec<(u64, Option<u64>, Vec<u8>)> = vec![];
    for ver in versions(cell)?.into_iter() {
        let commit_ts = match ver.handle {
            PRIMORDIAL => Some(0),
            handle => match resolve(handle_ts(handle)) {
                Visibility::Committed(commit_ts) => Some(commit_ts),
                Visibility::Aborted => continue,
                Visibility::Active => None,
            },
        };
        kept.push((ver.handle, commit_ts, ver.data.to_vec()));
    }

    // latest committed version at-or-before the horizon shadows all
    // earlier committed versions.
    let shadow = kept
        .iter()
        .filter_map(|(h, c, _)| (*c).filter(|c| *c <= horizon).map(|c| (c, *h)))
        .max();
    if let Some((shadow_commit, shadow_handle)) = shadow {
        kept.retain(|(h, c, _)| match c {
            Some(c) => (*c, *h) >= (shadow_commit, shadow_handle),
            None => true,
        });
    }

    let changed = {
        let old = versions(cell)?.len();
        kept.len() != old
    };

    match &kept[..] {
        [] => Ok(Pruned {
            cell: vec![],
            changed: true,
        }),
        [(_, Some(commit_ts), data)] if *commit_ts <= horizon => {
            let collapse_to_tombstone = data.is_empty();
            Ok(Pruned {
                cell: match collapse_to_tombstone {
                    true => vec![],
                    false => encode_bare(data),
                },
                changed: true,
            })
        }
        _ => {
            let vers: Vec<(u64, Vec<u8>)> =
                kept.into_iter().map(|(h, _, d)| (h, d)).collect();
            Ok(Pruned {
                cell: encode_versions(&vers)?,
                changed,
            })
        }
    }
}

#[cfg(test)]
#[path = "mvv_test.rs"]
mod mvv_test;
