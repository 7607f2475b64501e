//! Module implement the shared buffer pool, a fixed set of in-memory
//! frames caching volume pages.
//!
//! Every page access, btree descent, allocation, garbage walk, goes
//! through [Pool::pin_shared] or [Pool::pin_exclusive]. A pin resolves
//! `(volume_id, page_address)` through a sharded hash index, latches the
//! frame and re-validates the binding, frames can be recycled between
//! the lookup and the latch. On a miss a victim frame is claimed with a
//! CLOCK sweep over the untouched, unlatched frames; a dirty victim is
//! written back, journal first, before the frame is recycled.
//!
//! Latch acquisition is bounded by the configured timeout and fails
//! with [Error::InUse] under contention, never blocking indefinitely
//! inside a frame.

use std::{
    collections::HashMap,
    fmt, result,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::SeqCst},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    journal::Journal,
    page::Page,
    util::spinlock::{ReadGuard, Spinlock, WriteGuard},
    vol::VolumeSet,
    Error, Result,
};

/// Default number of frames in a pool.
pub const POOL_FRAMES: usize = 1024;
/// Default latch/flush timeout.
pub const TIMEOUT: Duration = Duration::from_secs(10);

const INDEX_SHARDS: usize = 16;

/// Buffer pool configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of page frames.
    pub frames: usize,
    /// Page size served by this pool, every volume wired to the pool
    /// must match.
    pub page_size: usize,
    /// Upper bound on latch acquisition and write-back waits.
    pub timeout: Duration,
}

impl Config {
    pub fn new(page_size: usize) -> Config {
        Config {
            frames: POOL_FRAMES,
            page_size,
            timeout: TIMEOUT,
        }
    }

    pub fn set_frames(mut self, frames: usize) -> Config {
        self.frames = frames;
        self
    }

    /// Size the pool by memory budget instead of frame count.
    pub fn set_memory(mut self, bytes: usize) -> Config {
        self.frames = std::cmp::max(bytes / self.page_size, 4);
        self
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Config {
        self.timeout = timeout;
        self
    }
}

// content of one frame.
struct Slot {
    key: Option<(u32, u64)>,
    page: Option<Page>,
    dirty: bool,
}

struct Frame {
    lock: Spinlock<Slot>,
    touched: AtomicBool,
}

/// Pool hit/miss/eviction counters.
#[derive(Default)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{{ hits = {}, misses = {}, evictions = {}, write_backs = {} }}",
            self.hits, self.misses, self.evictions, self.write_backs
        )
    }
}

/// Shared buffer pool over a [VolumeSet].
pub struct Pool {
    config: Config,
    frames: Vec<Frame>,
    index: Vec<Mutex<HashMap<(u32, u64), usize>>>,
    hand: AtomicUsize,
    volumes: Arc<VolumeSet>,
    journal: Arc<Journal>,

    n_hits: AtomicU64,
    n_misses: AtomicU64,
    n_evictions: AtomicU64,
    n_write_backs: AtomicU64,
}

impl Pool {
    pub fn new(config: Config, volumes: Arc<VolumeSet>, journal: Arc<Journal>) -> Pool {
        let frames = (0..config.frames)
            .map(|_| Frame {
                lock: Spinlock::new(Slot {
                    key: None,
                    page: None,
                    dirty: false,
                }),
                touched: AtomicBool::new(false),
            })
            .collect();
        let index = (0..INDEX_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();

        Pool {
            config,
            frames,
            index,
            hand: AtomicUsize::new(0),
            volumes,
            journal,

            n_hits: AtomicU64::new(0),
            n_misses: AtomicU64::new(0),
            n_evictions: AtomicU64::new(0),
            n_write_backs: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn to_stats(&self) -> Stats {
        Stats {
            hits: self.n_hits.load(SeqCst),
            misses: self.n_misses.load(SeqCst),
            evictions: self.n_evictions.load(SeqCst),
            write_backs: self.n_write_backs.load(SeqCst),
        }
    }

    fn shard(&self, key: &(u32, u64)) -> &Mutex<HashMap<(u32, u64), usize>> {
        let n = (key.0 as u64).wrapping_mul(31).wrapping_add(key.1) as usize;
        &self.index[n % INDEX_SHARDS]
    }

    fn lookup(&self, key: &(u32, u64)) -> Option<usize> {
        let shard = self.shard(key).lock().unwrap();
        shard.get(key).copied()
    }
}

// pin paths.
impl Pool {
    /// Latch the page shared, reading it from the volume on a miss.
    pub fn pin_shared(&self, vol_id: u32, address: u64) -> Result<PageShared> {
        let key = (vol_id, address);
        loop {
            match self.lookup(&key) {
                Some(n) => {
                    let frame = &self.frames[n];
                    let guard = frame.lock.read_timeout(self.config.timeout)?;
                    if guard.key == Some(key) {
                        frame.touched.store(true, SeqCst);
                        self.n_hits.fetch_add(1, SeqCst);
                        break Ok(PageShared { guard });
                    }
                    // frame recycled underneath the lookup, retry.
                }
                None => self.load(key)?,
            }
        }
    }

    /// Latch the page exclusive, reading it from the volume on a miss.
    pub fn pin_exclusive(&self, vol_id: u32, address: u64) -> Result<PageExcl> {
        let key = (vol_id, address);
        loop {
            match self.lookup(&key) {
                Some(n) => {
                    let frame = &self.frames[n];
                    let guard = frame.lock.write_timeout(self.config.timeout)?;
                    if guard.key == Some(key) {
                        frame.touched.store(true, SeqCst);
                        self.n_hits.fetch_add(1, SeqCst);
                        break Ok(PageExcl { guard });
                    }
                }
                None => self.load(key)?,
            }
        }
    }

    /// Install a freshly initialized page, allocation and extension use
    /// this instead of reading stale bytes from the volume file.
    pub fn install(&self, vol_id: u32, page: Page) -> Result<PageExcl> {
        let key = (vol_id, page.to_address());
        loop {
            match self.lookup(&key) {
                Some(n) => {
                    let frame = &self.frames[n];
                    let mut guard = frame.lock.write_timeout(self.config.timeout)?;
                    if guard.key == Some(key) {
                        frame.touched.store(true, SeqCst);
                        guard.page = Some(page);
                        break Ok(PageExcl { guard });
                    }
                }
                None => {
                    self.install_into_victim(key, Some(page.clone()))?;
                }
            }
        }
    }

    // read the page from its volume and install into a victim frame.
    fn load(&self, key: (u32, u64)) -> Result<()> {
        self.n_misses.fetch_add(1, SeqCst);
        let page = self.volumes.by_id(key.0)?.read_page(key.1)?;
        self.install_into_victim(key, Some(page))?;
        Ok(())
    }

    // claim a victim frame and bind it to `key`.
    fn install_into_victim(&self, key: (u32, u64), page: Option<Page>) -> Result<()> {
        let n = self.frames.len();
        let deadline = std::time::Instant::now() + self.config.timeout;

        let (frame_n, mut guard) = loop {
            let at = self.hand.fetch_add(1, SeqCst) % n;
            let frame = &self.frames[at];

            // second-chance, clear the touched bit and move on.
            if frame.touched.swap(false, SeqCst) {
                continue;
            }
            match frame.lock.try_write() {
                Some(guard) => break (at, guard),
                None => (),
            }
            if std::time::Instant::now() > deadline {
                return err_at!(Timeout, msg: "no evictable frame");
            }
            std::thread::yield_now();
        };

        // write back a dirty victim before recycling it.
        if guard.dirty {
            self.write_back_slot(&mut guard, true)?;
            self.n_evictions.fetch_add(1, SeqCst);
        }

        let old_key = guard.key.take();

        // publish the new binding, unless a racing thread already did.
        {
            if let Some(old_key) = old_key {
                let mut shard = self.shard(&old_key).lock().unwrap();
                shard.remove(&old_key);
            }
            let mut shard = self.shard(&key).lock().unwrap();
            if shard.contains_key(&key) {
                // lost the race, leave the victim empty for the next miss.
                guard.page = None;
                guard.dirty = false;
                return Ok(());
            }
            shard.insert(key, frame_n);
        }

        guard.key = Some(key);
        guard.page = page;
        guard.dirty = false;
        Ok(())
    }

    // journal-first write back of one dirty slot. With `durable` the
    // volume is synced and the journal releases its page-map pin right
    // away; sweep callers batch the sync instead.
    fn write_back_slot(&self, slot: &mut Slot, durable: bool) -> Result<Option<(u32, u64, u64)>> {
        let (vol_id, _) = match slot.key {
            Some(key) => key,
            None => return Ok(None),
        };
        let vol = self.volumes.by_id(vol_id)?;
        let page = slot.page.as_mut().unwrap();
        self.journal.flush_for_page(page.to_generation())?;
        vol.write_page(page)?;
        let record = (vol_id, page.to_address(), page.to_generation());
        if durable {
            vol.sync()?;
            self.journal.note_copied(record.0, record.1, record.2);
        }
        slot.dirty = false;
        self.n_write_backs.fetch_add(1, SeqCst);
        Ok(Some(record))
    }

    /// Write back every dirty frame, the journal copier drains the pool
    /// through this on its cycle; `upto` limits the sweep to pages whose
    /// generation is at-or-before the timestamp. Volumes are synced once
    /// at the end, before the journal lets go of the page images.
    pub fn write_back_dirty(&self, upto: Option<u64>) -> Result<usize> {
        let mut written = vec![];
        for frame in self.frames.iter() {
            let mut guard = match frame.lock.try_write() {
                Some(guard) => guard,
                // latched by a session, the next cycle picks it up.
                None => continue,
            };
            let skip = match (&guard.page, upto) {
                (None, _) => true,
                (Some(page), Some(upto)) => page.to_generation() > upto,
                (Some(_), None) => false,
            };
            if !skip && guard.dirty {
                if let Some(record) = self.write_back_slot(&mut guard, false)? {
                    written.push(record);
                }
            }
        }

        let count = written.len();
        let mut vol_ids: Vec<u32> = written.iter().map(|(vol_id, _, _)| *vol_id).collect();
        vol_ids.sort_unstable();
        vol_ids.dedup();
        for vol_id in vol_ids.into_iter() {
            self.volumes.by_id(vol_id)?.sync()?;
        }
        for (vol_id, address, generation) in written.into_iter() {
            self.journal.note_copied(vol_id, address, generation);
        }
        Ok(count)
    }

    /// Oldest generation among dirty frames, None when the pool is
    /// clean. Checkpointing uses this to clamp the journal base.
    pub fn oldest_dirty(&self) -> Option<u64> {
        let mut oldest: Option<u64> = None;
        for frame in self.frames.iter() {
            if let Some(guard) = frame.lock.try_read() {
                if guard.dirty {
                    let gen = guard.page.as_ref().map(Page::to_generation).unwrap_or(0);
                    oldest = Some(match oldest {
                        Some(oldest) => std::cmp::min(oldest, gen),
                        None => gen,
                    });
                }
            }
        }
        oldest
    }
}

/// Shared latch over a cached page.
pub struct PageShared<'a> {
    guard: ReadGuard<'a, Slot>,
}

impl<'a> PageShared<'a> {
    pub fn page(&self) -> &Page {
        self.guard.page.as_ref().unwrap()
    }
}

/// Exclusive latch over a cached page.
pub struct PageExcl<'a> {
    guard: WriteGuard<'a, Slot>,
}

impl<'a> PageExcl<'a> {
    pub fn page(&self) -> &Page {
        self.guard.page.as_ref().unwrap()
    }

    pub fn page_mut(&mut self) -> &mut Page {
        self.guard.page.as_mut().unwrap()
    }

    /// Stamp the mutation timestamp and mark the frame dirty. Callers
    /// append the page image to the journal in the same latch scope,
    /// keeping write-ahead ordering.
    pub fn mark_dirty(&mut self, generation: u64) {
        self.guard.page.as_mut().unwrap().set_generation(generation);
        self.guard.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.guard.dirty
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
