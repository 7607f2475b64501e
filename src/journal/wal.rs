//! Journal writer, the single append position plus the durable
//! boundary, the page map and the base address bookkeeping.

use std::{
    collections::HashMap,
    convert::TryFrom,
    ffi, fs, path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
        Condvar, Mutex,
    },
    time::Duration,
};

use crate::{
    journal::{
        record::{
            Checkpoint, PageImage, PageMapEntry, PageMapRec, Record, RecordType,
            SegmentEnd, SegmentHeader, TreeDelete, TxnCommit, TxnMapRec, TxnRollback,
            TxnStart,
        },
        Config, JournalFileName,
    },
    page::Page,
    util, Error, Result,
};

// room reserved at the segment tail for the JE footer.
const SEGMENT_END_ROOM: usize = 256;

struct Writer {
    file: fs::File,
    segment_index: u64,
    offset: u64,
}

#[derive(Default)]
struct FlushState {
    written: u64,
    synced: u64,
}

/// The write-ahead journal manager. A single instance is shared by the
/// buffer pool, the btree layer, the transaction layer and the journal
/// daemons.
pub struct Journal {
    config: Config,

    wtr: Mutex<Writer>,
    flush_state: Mutex<FlushState>,
    flush_cond: Condvar,

    // live page map, latest un-copied PA per page.
    page_map: Mutex<HashMap<(u32, u64), PageMapEntry>>,
    // TS record address per in-flight transaction.
    txn_starts: Mutex<HashMap<u64, u64>>,

    base: AtomicU64,
    last_checkpoint: AtomicU64,
    fenced: AtomicBool,
}

impl Journal {
    /// Start appending into a fresh segment numbered `segment_index`.
    /// Pre-existing segments below stay on disk until the base advances
    /// past them.
    pub fn start(config: Config, segment_index: u64, base: u64) -> Result<Journal> {
        let segment_size = u64::try_from(config.segment_size).unwrap();
        let (file, offset) = open_segment(&config, segment_index, base)?;
        let written = segment_index * segment_size + offset;

        let journal = Journal {
            config,
            wtr: Mutex::new(Writer {
                file,
                segment_index,
                offset,
            }),
            flush_state: Mutex::new(FlushState {
                written,
                synced: written,
            }),
            flush_cond: Condvar::new(),
            page_map: Mutex::new(HashMap::new()),
            txn_starts: Mutex::new(HashMap::new()),
            base: AtomicU64::new(base),
            last_checkpoint: AtomicU64::new(0),
            fenced: AtomicBool::new(false),
        };
        Ok(journal)
    }

    pub fn close(&self) -> Result<()> {
        self.flush()
    }
}

// append paths.
impl Journal {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(SeqCst)
    }

    /// Fence the journal; every subsequent append or flush fails. Used
    /// by [Engine::crash][crate::Engine::crash] and on unrecoverable
    /// journal I/O failure.
    pub fn fence(&self) {
        self.fenced.store(true, SeqCst);
    }

    // a journal I/O fault fences the instance, further writes are
    // rejected while reads of clean pages keep working.
    fn fence_on_err<T>(&self, res: Result<T>) -> Result<T> {
        if res.is_err() {
            self.fenced.store(true, SeqCst);
            log::error!(target: "journal", "journal fenced on write failure");
        }
        res
    }

    fn append_record(&self, typ: RecordType, timestamp: u64, payload: Vec<u8>) -> Result<u64> {
        if self.is_fenced() {
            return err_at!(Fenced, msg: "journal is fenced");
        }
        let segment_size = u64::try_from(self.config.segment_size).unwrap();
        let data = Record::new(typ, timestamp, payload).encode()?;

        let mut wtr = err_at!(Fatal, self.wtr.lock())?;

        let fits = wtr.offset + u64::try_from(data.len()).unwrap()
            + u64::try_from(SEGMENT_END_ROOM).unwrap()
            <= segment_size;
        if !fits {
            let res = self.rotate(&mut wtr);
            self.fence_on_err(res)?;
        }

        let address = wtr.segment_index * segment_size + wtr.offset;
        let offset = wtr.offset;
        let res = util::write_at(&mut wtr.file, offset, &data);
        self.fence_on_err(res)?;
        wtr.offset += u64::try_from(data.len()).unwrap();

        {
            let mut state = err_at!(Fatal, self.flush_state.lock())?;
            state.written = wtr.segment_index * segment_size + wtr.offset;
        }
        Ok(address)
    }

    // seal the working segment with JE and open the next one.
    fn rotate(&self, wtr: &mut Writer) -> Result<()> {
        let segment_size = u64::try_from(self.config.segment_size).unwrap();
        let end_address = wtr.segment_index * segment_size + wtr.offset;
        let payload = util::into_cbor_bytes(SegmentEnd {
            segment_index: wtr.segment_index,
            end_address,
        })?;
        let data = Record::new(RecordType::SegmentEnd, 0, payload).encode()?;
        util::write_at(&mut wtr.file, wtr.offset, &data)?;
        err_at!(IOError, wtr.file.sync_all())?;

        let next = wtr.segment_index + 1;
        let (file, offset) = open_segment(&self.config, next, self.base.load(SeqCst))?;
        wtr.file = file;
        wtr.segment_index = next;
        wtr.offset = offset;
        Ok(())
    }

    /// Append a page image, the caller holds the page latched
    /// exclusive. Returns the record address.
    pub fn append_page_image(&self, volume_id: u32, page: &Page) -> Result<u64> {
        // seal a copy so that recovery can re-verify the page checksum
        // when it re-applies the image.
        let image = {
            let mut copy = page.clone();
            copy.seal();
            PageImage {
                volume_id,
                address: copy.to_address(),
                page: copy.into_buffer(),
            }
        };
        let generation = page.to_generation();
        let address =
            self.append_record(RecordType::PageImage, generation, image.encode())?;

        let mut page_map = err_at!(Fatal, self.page_map.lock())?;
        page_map.insert(
            (volume_id, page.to_address()),
            PageMapEntry {
                volume_id: volume_id as u64,
                address: page.to_address(),
                journal_addr: address,
                generation,
            },
        );
        Ok(address)
    }

    pub fn append_txn_start(&self, start_ts: u64) -> Result<u64> {
        let payload = util::into_cbor_bytes(TxnStart { start_ts })?;
        let address = self.append_record(RecordType::TxnStart, start_ts, payload)?;
        let mut txn_starts = err_at!(Fatal, self.txn_starts.lock())?;
        txn_starts.insert(start_ts, address);
        Ok(address)
    }

    pub fn append_txn_commit(&self, start_ts: u64, commit_ts: u64) -> Result<u64> {
        let payload = util::into_cbor_bytes(TxnCommit {
            start_ts,
            commit_ts,
        })?;
        let address = self.append_record(RecordType::TxnCommit, commit_ts, payload)?;
        let mut txn_starts = err_at!(Fatal, self.txn_starts.lock())?;
        txn_starts.remove(&start_ts);
        Ok(address)
    }

    pub fn append_txn_rollback(&self, start_ts: u64) -> Result<u64> {
        let payload = util::into_cbor_bytes(TxnRollback { start_ts })?;
        let address = self.append_record(RecordType::TxnRollback, start_ts, payload)?;
        let mut txn_starts = err_at!(Fatal, self.txn_starts.lock())?;
        txn_starts.remove(&start_ts);
        Ok(address)
    }

    pub fn append_tree_delete(
        &self,
        volume_id: u32,
        name: &str,
        root: u64,
        timestamp: u64,
    ) -> Result<u64> {
        let payload = util::into_cbor_bytes(TreeDelete {
            volume_id: volume_id as u64,
            name: name.to_string(),
            root,
        })?;
        self.append_record(RecordType::TreeDelete, timestamp, payload)
    }

    /// Append the CU/PM/TM checkpoint record group. The caller holds
    /// the registry's commit lock, quiescing commits across the group.
    pub fn append_checkpoint(
        &self,
        checkpoint_ts: u64,
        last_ts: u64,
        tm: TxnMapRec,
    ) -> Result<u64> {
        let payload = util::into_cbor_bytes(Checkpoint {
            checkpoint_ts,
            last_ts,
        })?;
        let cu_addr = self.append_record(RecordType::Checkpoint, checkpoint_ts, payload)?;

        let entries: Vec<PageMapEntry> = {
            let page_map = err_at!(Fatal, self.page_map.lock())?;
            page_map.values().cloned().collect()
        };
        let payload = util::into_cbor_bytes(PageMapRec { entries })?;
        self.append_record(RecordType::PageMap, checkpoint_ts, payload)?;

        let payload = util::into_cbor_bytes(tm)?;
        self.append_record(RecordType::TxnMap, checkpoint_ts, payload)?;

        self.last_checkpoint.store(cu_addr, SeqCst);
        Ok(cu_addr)
    }
}

// durability and the base address.
impl Journal {
    /// Force the journal tail to disk and move the durable boundary.
    pub fn flush(&self) -> Result<()> {
        if self.is_fenced() {
            return err_at!(Fenced, msg: "journal is fenced");
        }
        let wtr = err_at!(Fatal, self.wtr.lock())?;
        let res = err_at!(IOError, wtr.file.sync_data());
        self.fence_on_err(res)?;

        let segment_size = u64::try_from(self.config.segment_size).unwrap();
        let synced = wtr.segment_index * segment_size + wtr.offset;
        drop(wtr);

        let mut state = err_at!(Fatal, self.flush_state.lock())?;
        state.synced = std::cmp::max(state.synced, synced);
        self.flush_cond.notify_all();
        Ok(())
    }

    /// Wait until the durable boundary covers `address`.
    pub fn wait_flushed(&self, address: u64, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = err_at!(Fatal, self.flush_state.lock())?;
        while state.synced < address {
            let now = std::time::Instant::now();
            if now > deadline {
                return err_at!(Timeout, msg: "journal flush wait {:?}", timeout);
            }
            let (new_state, _) = err_at!(
                Fatal,
                self.flush_cond.wait_timeout(state, deadline - now)
            )?;
            state = new_state;
        }
        Ok(())
    }

    /// Make the journal durable upto the page image of a page stamped
    /// `generation`, write-ahead gate for every page write-back.
    pub fn flush_for_page(&self, _generation: u64) -> Result<()> {
        let behind = {
            let state = err_at!(Fatal, self.flush_state.lock())?;
            state.synced < state.written
        };
        match behind {
            true => self.flush(),
            false => Ok(()),
        }
    }

    /// Note that the page image is now durable in its volume file; the
    /// matching page-map entry stops pinning the base address.
    pub fn note_copied(&self, volume_id: u32, address: u64, generation: u64) {
        let mut page_map = match self.page_map.lock() {
            Ok(page_map) => page_map,
            Err(_) => return,
        };
        match page_map.get(&(volume_id, address)) {
            Some(entry) if entry.generation <= generation => {
                page_map.remove(&(volume_id, address));
            }
            _ => (),
        }
    }

    pub fn to_base_address(&self) -> u64 {
        self.base.load(SeqCst)
    }

    pub fn to_current_address(&self) -> u64 {
        match self.flush_state.lock() {
            Ok(state) => state.written,
            Err(_) => 0,
        }
    }

    /// Snapshot of the live page map.
    pub fn to_page_map(&self) -> Vec<PageMapEntry> {
        match self.page_map.lock() {
            Ok(page_map) => page_map.values().cloned().collect(),
            Err(_) => vec![],
        }
    }

    /// Advance the base address past journal bytes recovery no longer
    /// needs and unlink segments wholly below it. No-op until the first
    /// checkpoint lands, and unlinking is skipped in append-only mode.
    pub fn advance_base(&self) -> Result<u64> {
        let mut low = match self.last_checkpoint.load(SeqCst) {
            0 => return Ok(self.base.load(SeqCst)),
            addr => addr,
        };
        {
            let page_map = err_at!(Fatal, self.page_map.lock())?;
            for entry in page_map.values() {
                low = std::cmp::min(low, entry.journal_addr);
            }
        }
        {
            let txn_starts = err_at!(Fatal, self.txn_starts.lock())?;
            for addr in txn_starts.values() {
                low = std::cmp::min(low, *addr);
            }
        }

        let old = self.base.load(SeqCst);
        if low <= old {
            return Ok(old);
        }
        self.base.store(low, SeqCst);
        log::debug!(target: "journal", "base address {} -> {}", old, low);

        if !self.config.append_only {
            self.purge_below(low)?;
        }
        Ok(low)
    }

    // unlink segments wholly below `address`.
    fn purge_below(&self, address: u64) -> Result<()> {
        let segment_size = u64::try_from(self.config.segment_size).unwrap();
        let keep_from = address / segment_size;
        for (num, loc) in crate::journal::list_segments(&self.config)?.into_iter() {
            if num < keep_from {
                log::info!(target: "journal", "purging segment {:?}", loc);
                err_at!(IOError, fs::remove_file(&loc))?;
            }
        }
        Ok(())
    }
}

// create a segment file and write its JH record, return the open file
// and the offset past the header.
fn open_segment(config: &Config, segment_index: u64, base: u64) -> Result<(fs::File, u64)> {
    let location: path::PathBuf = {
        let file: ffi::OsString =
            JournalFileName::from((config.name.clone(), segment_index)).0;
        [config.dir.as_os_str(), &file].iter().collect()
    };
    let mut file = util::create_file_rw(location.as_os_str(), true)?;

    let header = SegmentHeader::new(segment_index, base);
    let payload = util::into_cbor_bytes(header)?;
    let data = Record::new(RecordType::SegmentHeader, 0, payload).encode()?;
    util::write_at(&mut file, 0, &data)?;
    err_at!(IOError, file.sync_all())?;

    log::debug!(target: "journal", "opened segment {} {:?}", segment_index, location);
    Ok((file, u64::try_from(data.len()).unwrap()))
}

#[cfg(test)]
#[path = "wal_test.rs"]
mod wal_test;
