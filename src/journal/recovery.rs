//! Crash recovery, replay the journal into the volume set.
//!
//! Recovery scans the surviving segments twice. The first pass locates
//! the last durable checkpoint, its transaction map and the allocator
//! high water mark. The second pass re-applies every page image in
//! stream order, idempotent since later images overwrite earlier ones,
//! and rebuilds the transaction map from the checkpoint's TM plus the
//! TS/TC/TR records behind it. A transaction still live at the end of
//! the stream crashed without committing and is declared aborted; its
//! versions are pruned out of MVVs lazily, on first touch.
//!
//! A short or checksum-failing record marks the torn tail of the crash
//! and ends the scan; everything behind it is intact by write ordering.

use std::{
    collections::{HashMap, HashSet},
    convert::TryFrom,
    ffi, fs,
    io::Read,
    sync::Arc,
};

use crate::{
    journal::{
        record::{decode_payload, Record, RecordType},
        wal::Journal,
        Checkpoint, Config, PageImage, TxnCommit, TxnMapRec, TxnRollback, TxnStart,
    },
    page::Page,
    vol::VolumeSet,
    Error, Result,
};

/// Outcome of journal recovery.
pub struct Recovered {
    /// Journal positioned to append into a fresh segment.
    pub journal: Journal,
    /// Committed transactions, `(start_ts, commit_ts)`.
    pub committed: Vec<(u64, u64)>,
    /// Aborted transactions, includes every transaction in flight at
    /// the crash point.
    pub aborted: Vec<u64>,
    /// Timestamp allocator restart point.
    pub last_ts: u64,
    /// Number of page images applied to volumes.
    pub applied_pages: usize,
}

/// Scan the journal under `config` and replay it into `volumes`.
/// Returns a journal open for appends plus the recovered transaction
/// state. A directory with no matching segments yields a fresh journal.
pub fn recover(config: Config, volumes: &Arc<VolumeSet>) -> Result<Recovered> {
    let segments = crate::journal::list_segments(&config)?;
    let segment_size = u64::try_from(config.segment_size).unwrap();

    if segments.is_empty() {
        let journal = Journal::start(config, 0, 0)?;
        return Ok(Recovered {
            journal,
            committed: vec![],
            aborted: vec![],
            last_ts: 0,
            applied_pages: 0,
        });
    }

    // pass 1: locate the last checkpoint and its transaction map.
    let mut last_cu: Option<(u64, Checkpoint)> = None;
    let mut last_tm: Option<(u64, TxnMapRec)> = None;
    let mut max_ts = 0;
    for (num, loc) in segments.iter() {
        scan_segment(loc, *num, segment_size, |addr, record| {
            max_ts = std::cmp::max(max_ts, record.timestamp);
            match record.typ {
                RecordType::Checkpoint => {
                    last_cu = Some((addr, decode_payload(&record.payload)?));
                }
                RecordType::TxnMap => {
                    last_tm = Some((addr, decode_payload(&record.payload)?));
                }
                _ => (),
            }
            Ok(())
        })?;
    }

    // the TM belonging to the last CU follows it in the stream; a crash
    // between the two invalidates the checkpoint.
    let (cu_addr, checkpoint, tm) = match (last_cu, last_tm) {
        (Some((cu_addr, cu)), Some((tm_addr, tm))) if tm_addr > cu_addr => {
            (cu_addr, Some(cu), tm)
        }
        _ => (0, None, TxnMapRec { entries: vec![] }),
    };

    // seed transaction state from the checkpoint.
    let mut active: HashSet<u64> = HashSet::new();
    let mut committed: HashMap<u64, u64> = HashMap::new();
    let mut aborted: HashSet<u64> = HashSet::new();
    for entry in tm.entries.iter() {
        match (entry.aborted, entry.commit_ts) {
            (true, _) => {
                aborted.insert(entry.start_ts);
            }
            (false, 0) => {
                active.insert(entry.start_ts);
            }
            (false, commit_ts) => {
                committed.insert(entry.start_ts, commit_ts);
            }
        }
    }

    // pass 2: apply page images, fold transaction records behind the
    // checkpoint into the maps.
    let mut applied_pages = 0;
    for (num, loc) in segments.iter() {
        scan_segment(loc, *num, segment_size, |addr, record| {
            match record.typ {
                RecordType::PageImage => {
                    let image = PageImage::decode(&record.payload)?;
                    applied_pages += apply_page(volumes, image)?;
                }
                RecordType::TxnStart if addr > cu_addr => {
                    let rec: TxnStart = decode_payload(&record.payload)?;
                    active.insert(rec.start_ts);
                }
                RecordType::TxnCommit if addr > cu_addr => {
                    let rec: TxnCommit = decode_payload(&record.payload)?;
                    active.remove(&rec.start_ts);
                    committed.insert(rec.start_ts, rec.commit_ts);
                }
                RecordType::TxnRollback if addr > cu_addr => {
                    let rec: TxnRollback = decode_payload(&record.payload)?;
                    active.remove(&rec.start_ts);
                    aborted.insert(rec.start_ts);
                }
                _ => (),
            }
            Ok(())
        })?;
    }

    // in-flight at end-of-journal means crashed before commit.
    for start_ts in active.into_iter() {
        aborted.insert(start_ts);
    }

    // head fields may have been rewritten by page-0 images.
    for vol in volumes.iter() {
        vol.reload_head()?;
        vol.sync()?;
    }

    let last_ts = std::cmp::max(
        max_ts,
        checkpoint.as_ref().map(|cu| cu.last_ts).unwrap_or(0),
    );
    let next_segment = segments.last().map(|(num, _)| num + 1).unwrap();
    let base = segments.first().map(|(num, _)| num * segment_size).unwrap();

    log::info!(
        target: "journal",
        "recovered {} pages, {} committed, {} aborted txns, last_ts {}",
        applied_pages, committed.len(), aborted.len(), last_ts
    );

    let journal = Journal::start(config, next_segment, base)?;
    Ok(Recovered {
        journal,
        committed: committed.into_iter().collect(),
        aborted: aborted.into_iter().collect(),
        last_ts,
        applied_pages,
    })
}

// apply one page image; images for unknown volumes, dropped from the
// configuration, are skipped with a warning.
fn apply_page(volumes: &Arc<VolumeSet>, image: PageImage) -> Result<usize> {
    let vol = match volumes.by_id(image.volume_id) {
        Ok(vol) => vol,
        Err(_) => {
            log::warn!(
                target: "journal",
                "page image for unknown volume {}", image.volume_id
            );
            return Ok(0);
        }
    };
    let mut page = Page::from_buffer(image.page)?;
    if page.to_address() != image.address {
        return err_at!(
            CorruptRecord, msg: "page image address {} != {}",
            page.to_address(), image.address
        );
    }
    vol.restore_page(&mut page)?;
    Ok(1)
}

// scan one segment, handing each record to `f` along with its logical
// address. Stops cleanly at the JE footer, at end-of-file, or at the
// torn tail of a crashed segment.
fn scan_segment<F>(
    loc: &ffi::OsStr,
    segment_index: u64,
    segment_size: u64,
    mut f: F,
) -> Result<()>
where
    F: FnMut(u64, Record) -> Result<()>,
{
    let min_frame = u64::try_from(Record::frame_size(0)).unwrap();
    let mut file = err_at!(IOError, fs::OpenOptions::new().read(true).open(loc))?;
    let file_len = err_at!(IOError, file.metadata())?.len();
    let mut offset = 0_u64;

    while offset + min_frame <= file_len {
        let mut head = [0_u8; 4];
        {
            use std::io::Seek;
            err_at!(IOError, file.seek(std::io::SeekFrom::Start(offset)))?;
            err_at!(IOError, file.read_exact(&mut head))?;
        }
        let length = u32::from_be_bytes(head) as u64;
        if length < min_frame || offset + length > file_len {
            log::warn!(target: "journal", "torn record at {:?}:{}", loc, offset);
            break;
        }

        let mut buf = vec![0; length as usize];
        buf[..4].copy_from_slice(&head);
        err_at!(IOError, file.read_exact(&mut buf[4..]))?;

        let record = match Record::decode(&buf) {
            Ok((record, _)) => record,
            Err(err) => {
                log::warn!(target: "journal", "bad record at {:?}:{} {}", loc, offset, err);
                break;
            }
        };
        let typ = record.typ;
        f(segment_index * segment_size + offset, record)?;
        offset += length;
        if typ == RecordType::SegmentEnd {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "recovery_test.rs"]
mod recovery_test;
