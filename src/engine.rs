//! Engine, the instance context owning volumes, the buffer pool, the
//! journal, the transaction registry and the background daemons.
//!
//! Opening an engine acquires the data-directory lock, opens every
//! configured volume, replays the journal, writes a fresh checkpoint
//! and starts the daemons. [Engine::close] checkpoints and drains
//! before shutting down; [Engine::crash] fences the journal and tears
//! down without flushing, simulating a hard failure for recovery
//! tests.

use fs2::FileExt;

use std::{
    collections::HashMap,
    ffi, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{
    btree::{Btree, CellOp, TreeInfo, TreeRecord},
    exchange::{Direction, Exchange},
    journal::{self, daemon::Daemons, Journal},
    key::{Key, KeyFilter},
    pool::Pool,
    txn::{Durability, Session, Txns},
    util::Spinlock,
    vol::{Volume, VolumeSet, VolumeSpec},
    Config, Error, Result,
};

// engine-wide shared state; sessions, exchanges and daemons all hang
// off an Arc of this.
pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) volumes: Arc<VolumeSet>,
    pub(crate) pool: Arc<Pool>,
    pub(crate) journal: Arc<Journal>,
    pub(crate) txns: Arc<Txns>,

    // per-volume directory trees and open-tree registry.
    dirs: Mutex<HashMap<u32, Arc<Btree>>>,
    trees: Mutex<HashMap<(u32, String), Arc<Spinlock<TreeInfo>>>>,

    daemons: Mutex<Option<Daemons>>,
    lock_file: Mutex<Option<fs::File>>,
}

impl Inner {
    pub(crate) fn directory(&self, vol: &Arc<Volume>) -> Result<Arc<Btree>> {
        let mut dirs = err_at!(Fatal, self.dirs.lock())?;
        match dirs.get(&vol.to_id()) {
            Some(dir) => Ok(Arc::clone(dir)),
            None => {
                let ts = self.txns.next_ts();
                let dir = Btree::directory(vol, &self.pool, &self.journal, ts)?;
                dirs.insert(vol.to_id(), Arc::clone(&dir));
                Ok(dir)
            }
        }
    }

    /// Open a named tree, creating it when `create` is set. Returns
    /// None for a missing tree without `create`.
    pub(crate) fn open_tree(
        &self,
        volume: &str,
        name: &str,
        create: bool,
    ) -> Result<Option<Btree>> {
        let vol = self.volumes.by_name(volume)?;
        let dir = self.directory(&vol)?;

        let record = match Btree::lookup_tree(&dir, name)? {
            Some(record) => record,
            None if create => Btree::create_tree(&dir, name, self.txns.next_ts())?,
            None => return Ok(None),
        };

        let info = {
            let cached = {
                let trees = err_at!(Fatal, self.trees.lock())?;
                trees.get(&(vol.to_id(), name.to_string())).map(Arc::clone)
            };
            match cached {
                Some(info) => info,
                None => {
                    // measured outside the registry lock, the walk pins
                    // pages.
                    let loaded =
                        TreeInfo::from_record(vol.as_ref(), self.pool.as_ref(), &record)?;
                    let mut trees = err_at!(Fatal, self.trees.lock())?;
                    let entry = trees
                        .entry((vol.to_id(), name.to_string()))
                        .or_insert_with(|| Arc::new(Spinlock::new(loaded)));
                    Arc::clone(entry)
                }
            }
        };
        Ok(Some(Btree::new(
            vol,
            Arc::clone(&self.pool),
            Arc::clone(&self.journal),
            info,
            name,
        )))
    }

    /// Write the running per-tree counters back into their directory
    /// records. Close and checkpoint call this so that `len()` and
    /// `to_seqno()` survive a restart. Returns the number of open
    /// trees visited.
    pub(crate) fn persist_tree_stats(&self) -> Result<usize> {
        let entries: Vec<((u32, String), Arc<Spinlock<TreeInfo>>)> = {
            let trees = err_at!(Fatal, self.trees.lock())?;
            trees
                .iter()
                .map(|(key, info)| (key.clone(), Arc::clone(info)))
                .collect()
        };

        for ((vol_id, name), info) in entries.iter() {
            let vol = self.volumes.by_id(*vol_id)?;
            if vol.is_read_only() {
                continue;
            }
            let dir = self.directory(&vol)?;
            let (root, seqno, n_count) = {
                let info = info.read();
                (info.root, info.seqno, std::cmp::max(info.n_count, 0) as u64)
            };

            let ts = self.txns.next_ts();
            let key = crate::btree::tree_key(name);
            dir.update_cell(&key, ts, Default::default(), |old| {
                let old = match old {
                    Some(old) => old,
                    // removed from under the registry entry, nothing to
                    // sync.
                    None => return Ok(CellOp::Keep),
                };
                let (mut record, _): (TreeRecord, usize) =
                    crate::util::from_cbor_bytes(old)?;
                if (record.seqno, record.n_count) == (seqno, n_count) {
                    return Ok(CellOp::Keep);
                }
                record.root = root;
                record.seqno = seqno;
                record.n_count = n_count;
                Ok(CellOp::Put(crate::util::into_cbor_bytes(record)?))
            })?;
        }
        Ok(entries.len())
    }

    /// Synchronous flush through the flusher daemon, batching every
    /// hard commit queued behind it.
    pub(crate) fn group_commit(&self, address: u64) -> Result<()> {
        let tx = {
            let daemons = err_at!(Fatal, self.daemons.lock())?;
            daemons.as_ref().map(|daemons| daemons.flusher.to_tx())
        };
        match tx {
            Some(tx) => tx.request(())?,
            None => self.journal.flush()?,
        }
        self.journal.wait_flushed(address, self.config.timeout)
    }
}

/// The storage engine. One instance per data directory; a second open
/// of the same directory fails on the data-directory lock.
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Open per `config`: lock the data directory, open volumes, replay
    /// the journal, checkpoint and start the background daemons.
    pub fn open(config: Config) -> Result<Engine> {
        config.validate()?;
        err_at!(IOError, fs::create_dir_all(&config.datapath))?;
        let lock_file = acquire_datapath_lock(&config.datapath)?;
        if let Some(logfile) = &config.logfile {
            log::info!(target: "engine", "operational log expected at {:?}", logfile);
        }

        let specs = resolve_volume_paths(&config)?;
        let page_size = specs[0].page_size;
        for spec in specs.iter() {
            if spec.page_size != page_size {
                // a single shared pool serves every volume; mixed page
                // sizes would need one pool per size.
                return err_at!(
                    InvalidInput, msg: "volumes disagree on page size {} != {}",
                    spec.page_size, page_size
                );
            }
        }
        let volumes = Arc::new(VolumeSet::open(specs)?);

        let (dir, name) = config.to_journal_location();
        let mut jconfig = journal::Config::new(&dir, &name);
        jconfig
            .set_segment_size(config.journalsize)
            .set_append_only(config.appendonly);

        let recovered = journal::recover(jconfig, &volumes)?;
        let journal = Arc::new(recovered.journal);
        let txns = Arc::new(Txns::new(
            recovered.last_ts,
            recovered.committed,
            recovered.aborted,
        ));
        let pool = Arc::new(Pool::new(
            config.to_pool_config(page_size),
            Arc::clone(&volumes),
            Arc::clone(&journal),
        ));

        // checkpoint immediately so the recovered transaction map is
        // durable and the base can move past the replayed segments.
        journal::daemon::run_checkpoint(&journal, &pool, &txns)?;

        let daemons = Daemons::start(
            Arc::clone(&journal),
            Arc::clone(&pool),
            Arc::clone(&txns),
        );

        log::info!(
            target: "engine",
            "engine open, {} volumes, journal base {}",
            volumes.iter().count(), journal.to_base_address()
        );

        let inner = Inner {
            config,
            volumes,
            pool,
            journal,
            txns,
            dirs: Mutex::new(HashMap::new()),
            trees: Mutex::new(HashMap::new()),
            daemons: Mutex::new(Some(daemons)),
            lock_file: Mutex::new(Some(lock_file)),
        };
        Ok(Engine {
            inner: Arc::new(inner),
        })
    }

    /// New session with [Durability::Soft].
    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.inner), Durability::Soft)
    }

    /// New session with the given durability.
    pub fn session_with(&self, durability: Durability) -> Session {
        Session::new(Arc::clone(&self.inner), durability)
    }

    /// Force a checkpoint now, returning its timestamp.
    pub fn checkpoint(&self) -> Result<u64> {
        self.inner.persist_tree_stats()?;
        journal::daemon::run_checkpoint(
            &self.inner.journal,
            &self.inner.pool,
            &self.inner.txns,
        )
    }

    /// Earliest journal byte recovery still needs.
    pub fn to_base_address(&self) -> u64 {
        self.inner.journal.to_base_address()
    }

    /// Next journal append position.
    pub fn to_current_address(&self) -> u64 {
        self.inner.journal.to_current_address()
    }

    /// Buffer pool counters.
    pub fn to_pool_stats(&self) -> crate::pool::Stats {
        self.inner.pool.to_stats()
    }
}

// tree administration.
impl Engine {
    /// Destroy `tree`: unlink its directory record and chain every
    /// owned page into the volume's garbage chain.
    pub fn remove_tree(&self, volume: &str, tree: &str) -> Result<()> {
        let vol = self.inner.volumes.by_name(volume)?;
        let dir = self.inner.directory(&vol)?;
        let ts = self.inner.txns.next_ts();

        let handle = match self.inner.open_tree(volume, tree, false)? {
            Some(handle) => handle,
            None => return err_at!(TreeNotFound, msg: "{}/{}", volume, tree),
        };
        let key = crate::btree::tree_key(tree);
        dir.update_cell(&key, ts, Default::default(), |_| Ok(CellOp::Delete))?;
        handle.remove_tree(ts)?;

        let mut trees = err_at!(Fatal, self.inner.trees.lock())?;
        trees.remove(&(vol.to_id(), tree.to_string()));
        Ok(())
    }

    /// Names of the trees in `volume`, directory order.
    pub fn list_trees(&self, volume: &str) -> Result<Vec<String>> {
        let vol = self.inner.volumes.by_name(volume)?;
        let dir = self.inner.directory(&vol)?;

        let mut names = vec![];
        let mut probe = Key::before().as_bytes().to_vec();
        while let Some((kbytes, cell)) = dir.seek(&probe, true, false)? {
            let (record, _): (crate::btree::TreeRecord, usize) =
                crate::util::from_cbor_bytes(&cell)?;
            names.push(record.name);
            probe = kbytes;
        }
        Ok(names)
    }

    /// Walk `tree` verifying structural invariants; returns the faults
    /// found, empty for a healthy tree.
    pub fn integrity_check(&self, volume: &str, tree: &str) -> Result<Vec<String>> {
        match self.inner.open_tree(volume, tree, false)? {
            Some(handle) => handle.integrity_check(),
            None => err_at!(TreeNotFound, msg: "{}/{}", volume, tree),
        }
    }

    /// Prune every MVV in `tree` against the current horizon. Returns
    /// the number of cells touched.
    pub fn prune(&self, volume: &str, tree: &str) -> Result<usize> {
        let session = self.session();
        let mut ex = session.exchange(volume, tree)?;
        ex.prune_tree()
    }

    /// Stream the live entries of `tree` accepted by `filter`.
    pub fn export_range(
        &self,
        volume: &str,
        tree: &str,
        filter: Option<KeyFilter>,
    ) -> Result<ExportScan> {
        let session = self.session();
        let ex = session.exchange(volume, tree)?;
        Ok(ExportScan {
            ex,
            filter,
            done: false,
        })
    }

    /// Load `(key, value)` pairs into `tree`, creating it if missing.
    /// Returns the number of entries stored.
    pub fn import<I>(&self, volume: &str, tree: &str, iter: I) -> Result<usize>
    where
        I: Iterator<Item = (Key, Vec<u8>)>,
    {
        let session = self.session();
        let mut ex = session.exchange(volume, tree)?;
        let mut count = 0;
        for (key, value) in iter {
            *ex.key_mut() = key;
            ex.value_mut().set(&value);
            ex.store()?;
            count += 1;
        }
        Ok(count)
    }
}

// shutdown paths.
impl Engine {
    /// Graceful shutdown: final checkpoint, daemon drain, dirty page
    /// write-back, volume sync, lock release.
    pub fn close(self) -> Result<()> {
        self.inner.persist_tree_stats()?;
        journal::daemon::run_checkpoint(
            &self.inner.journal,
            &self.inner.pool,
            &self.inner.txns,
        )?;

        let daemons = err_at!(Fatal, self.inner.daemons.lock())?.take();
        if let Some(daemons) = daemons {
            daemons.close()?;
        }

        self.inner.pool.write_back_dirty(None)?;
        self.inner.journal.advance_base()?;
        self.inner.journal.close()?;
        self.inner.volumes.close()?;

        let lock_file = err_at!(Fatal, self.inner.lock_file.lock())?.take();
        if let Some(lock_file) = lock_file {
            lock_file.unlock().ok();
        }
        log::info!(target: "engine", "engine closed");
        Ok(())
    }

    /// Simulated hard failure: fence the journal so no further bytes
    /// reach disk, then tear down without flushing. Recovery tests
    /// reopen the directory afterwards.
    pub fn crash(self) {
        self.inner.journal.fence();
        let daemons = match self.inner.daemons.lock() {
            Ok(mut daemons) => daemons.take(),
            Err(_) => None,
        };
        if let Some(daemons) = daemons {
            // daemons fail against the fenced journal and exit.
            daemons.close().ok();
        }
        if let Ok(mut lock_file) = self.inner.lock_file.lock() {
            if let Some(lock_file) = lock_file.take() {
                lock_file.unlock().ok();
            }
        }
        log::warn!(target: "engine", "engine crashed by request");
    }
}

/// Iterator over a tree's live entries, refer [Engine::export_range].
pub struct ExportScan {
    ex: Exchange,
    filter: Option<KeyFilter>,
    done: bool,
}

impl Iterator for ExportScan {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.ex.traverse(Direction::Forward, self.filter.as_ref()) {
            Ok(true) => {
                let key = self.ex.key().clone();
                let value = self.ex.value().as_bytes().to_vec();
                Some(Ok((key, value)))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn acquire_datapath_lock(datapath: &ffi::OsStr) -> Result<fs::File> {
    let location: PathBuf = Path::new(datapath).join("mvbt.lock");
    let file = err_at!(
        IOError,
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&location)
    )?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(_) => err_at!(
            InvalidInput, msg: "data directory {:?} locked by another process", datapath
        ),
    }
}

// volume paths resolve against datapath, transient volumes against
// tmpvoldir when configured.
fn resolve_volume_paths(config: &Config) -> Result<Vec<VolumeSpec>> {
    let mut specs = vec![];
    for spec in config.volumes.iter() {
        let mut spec = spec.clone();
        let path = Path::new(&spec.path);
        if path.is_relative() {
            let base = match (spec.transient, &config.tmpvoldir) {
                (true, Some(tmpvoldir)) => Path::new(tmpvoldir),
                _ => Path::new(&config.datapath),
            };
            spec.path = base.join(path).into_os_string();
        }
        specs.push(spec);
    }
    Ok(specs)
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
