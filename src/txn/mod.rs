//! Module implement transactions over multi-version-values.
//!
//! A single monotonic timestamp counter orders everything in the
//! engine: transaction starts, commits, page generations and
//! checkpoints. The [Txns] registry tracks every transaction's state,
//! in-flight, committed at some timestamp, or aborted, and resolves
//! [Visibility][crate::mvv::Visibility] for MVV readers and pruners.
//!
//! [Session] is the per-thread handle. A session without an open
//! transaction runs each operation as its own committed unit; between
//! [Session::begin] and [Session::commit] operations share one
//! snapshot, conflicts abort the transaction, and nested begin/commit
//! pairs fold into the outermost scope.

use std::{
    collections::{HashMap, HashSet},
    fmt, result,
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        Arc, Mutex, MutexGuard,
    },
};

use crate::{
    engine::Inner,
    exchange::Exchange,
    journal::{TxnEntry, TxnMapRec},
    mvv::Visibility,
    Error, Result,
};

/// Commit durability, per transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Durability {
    /// Commit returns once the TC record is appended; the journal tail
    /// is flushed by the flusher's next cycle. A crash can lose the
    /// last few milliseconds of commits, never a partial transaction.
    Soft,
    /// Commit returns only after the TC record is durable.
    Hard,
}

impl Default for Durability {
    fn default() -> Durability {
        Durability::Soft
    }
}

// registry tables.
#[derive(Default)]
struct TxnTable {
    active: HashSet<u64>,
    committed: HashMap<u64, u64>,
    aborted: HashSet<u64>,
}

/// Transaction registry plus the engine-wide timestamp allocator.
pub struct Txns {
    ts: AtomicU64,
    table: Mutex<TxnTable>,
    // held across TC appends and checkpoint record groups, so that a
    // TM snapshot is consistent with the record stream.
    commit_mu: Mutex<()>,
}

impl Txns {
    pub fn new(last_ts: u64, committed: Vec<(u64, u64)>, aborted: Vec<u64>) -> Txns {
        let table = TxnTable {
            active: HashSet::new(),
            committed: committed.into_iter().collect(),
            aborted: aborted.into_iter().collect(),
        };
        Txns {
            ts: AtomicU64::new(last_ts),
            table: Mutex::new(table),
            commit_mu: Mutex::new(()),
        }
    }

    /// Allocate the next timestamp.
    pub fn next_ts(&self) -> u64 {
        self.ts.fetch_add(1, SeqCst) + 1
    }

    /// Most recently allocated timestamp.
    pub fn current_ts(&self) -> u64 {
        self.ts.load(SeqCst)
    }

    pub fn quiesce_commits(&self) -> Result<MutexGuard<()>> {
        err_at!(Fatal, self.commit_mu.lock())
    }

    fn begin(&self) -> u64 {
        let start_ts = self.next_ts();
        self.table.lock().unwrap().active.insert(start_ts);
        start_ts
    }

    fn mark_committed(&self, start_ts: u64, commit_ts: u64) {
        let mut table = self.table.lock().unwrap();
        table.active.remove(&start_ts);
        table.committed.insert(start_ts, commit_ts);
    }

    fn mark_aborted(&self, start_ts: u64) {
        let mut table = self.table.lock().unwrap();
        table.active.remove(&start_ts);
        table.aborted.insert(start_ts);
    }

    /// Register a single non-transactional operation as committed at
    /// its own timestamp.
    pub fn autocommit(&self, ts: u64) {
        self.table.lock().unwrap().committed.insert(ts, ts);
    }

    /// Commit state of the transaction that started at `start_ts`.
    ///
    /// History pruned below the horizon resolves as committed at its
    /// start timestamp; every pruned commit is older than any live
    /// snapshot, so the approximation is invisible to readers.
    pub fn resolve(&self, start_ts: u64) -> Visibility {
        let table = self.table.lock().unwrap();
        if table.active.contains(&start_ts) {
            Visibility::Active
        } else if let Some(commit_ts) = table.committed.get(&start_ts) {
            Visibility::Committed(*commit_ts)
        } else if table.aborted.contains(&start_ts) {
            Visibility::Aborted
        } else {
            Visibility::Committed(start_ts)
        }
    }

    /// Start timestamp of the oldest in-flight transaction.
    pub fn oldest_active(&self) -> Option<u64> {
        let table = self.table.lock().unwrap();
        table.active.iter().min().copied()
    }

    /// Oldest timestamp any live or future snapshot can read at; MVV
    /// versions shadowed below this are prunable.
    pub fn horizon(&self) -> u64 {
        match self.oldest_active() {
            Some(oldest) => oldest.saturating_sub(1),
            None => self.current_ts(),
        }
    }

    /// Checkpoint timestamp, never past the oldest in-flight
    /// transaction's start.
    pub fn checkpoint_ts(&self) -> u64 {
        match self.oldest_active() {
            Some(oldest) => oldest.saturating_sub(1),
            None => self.next_ts(),
        }
    }

    /// Snapshot for the TM checkpoint payload.
    pub fn to_txn_map(&self) -> TxnMapRec {
        let table = self.table.lock().unwrap();
        let mut entries = vec![];
        for start_ts in table.active.iter() {
            entries.push(TxnEntry {
                start_ts: *start_ts,
                commit_ts: 0,
                aborted: false,
            });
        }
        for (start_ts, commit_ts) in table.committed.iter() {
            entries.push(TxnEntry {
                start_ts: *start_ts,
                commit_ts: *commit_ts,
                aborted: false,
            });
        }
        for start_ts in table.aborted.iter() {
            entries.push(TxnEntry {
                start_ts: *start_ts,
                commit_ts: 0,
                aborted: true,
            });
        }
        TxnMapRec { entries }
    }

    /// Drop committed entries below the horizon; unknown handles
    /// resolve as committed, refer [Txns::resolve]. Aborted entries are
    /// retained until their versions are pruned from every MVV.
    pub fn prune_history(&self) {
        let horizon = self.horizon();
        let mut table = self.table.lock().unwrap();
        table.committed.retain(|_, commit_ts| *commit_ts > horizon);
    }

    pub fn n_active(&self) -> usize {
        self.table.lock().unwrap().active.len()
    }
}

// per-session transaction context.
#[derive(Clone, Debug)]
pub(crate) enum TxnStatus {
    Inactive,
    Active,
    RollbackOnly,
}

pub(crate) struct TxnCtx {
    pub(crate) status: TxnStatus,
    pub(crate) start_ts: u64,
    pub(crate) step: u16,
    pub(crate) depth: usize,
    pub(crate) durability: Durability,
}

impl TxnCtx {
    fn new(durability: Durability) -> TxnCtx {
        TxnCtx {
            status: TxnStatus::Inactive,
            start_ts: 0,
            step: 0,
            depth: 0,
            durability,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        !matches!(self.status, TxnStatus::Inactive)
    }
}

/// A session binds one thread of work to the engine. Sessions are
/// cheap, hold the per-transaction context and mint [Exchange] cursors.
pub struct Session {
    pub(crate) inner: Arc<Inner>,
    pub(crate) ctx: Arc<Mutex<TxnCtx>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let ctx = self.ctx.lock().unwrap();
        write!(f, "Session<{:?} start:{}>", ctx.status, ctx.start_ts)
    }
}

impl Session {
    pub(crate) fn new(inner: Arc<Inner>, durability: Durability) -> Session {
        Session {
            inner,
            ctx: Arc::new(Mutex::new(TxnCtx::new(durability))),
        }
    }

    /// Open an [Exchange] cursor over `(volume, tree)`, creating the
    /// tree on first store when `create` is set.
    pub fn exchange(&self, volume: &str, tree: &str) -> Result<Exchange> {
        Exchange::new(Arc::clone(&self.inner), Arc::clone(&self.ctx), volume, tree)
    }

    /// Begin a transaction, or deepen the enclosing one. Nested scopes
    /// fold into the outermost begin/commit pair.
    pub fn begin(&self) -> Result<()> {
        let mut ctx = err_at!(Fatal, self.ctx.lock())?;
        if ctx.is_active() {
            ctx.depth += 1;
            return Ok(());
        }
        let start_ts = self.inner.txns.begin();
        self.inner.journal.append_txn_start(start_ts)?;
        ctx.status = TxnStatus::Active;
        ctx.start_ts = start_ts;
        ctx.step = 0;
        ctx.depth = 1;
        Ok(())
    }

    /// Commit the transaction. Inner scopes just unwind; the outermost
    /// commit assigns the commit timestamp, appends the TC record and,
    /// under [Durability::Hard], waits for the journal flush.
    pub fn commit(&self) -> Result<()> {
        let mut ctx = err_at!(Fatal, self.ctx.lock())?;
        match ctx.status {
            TxnStatus::Inactive => {
                return err_at!(InvalidInput, msg: "commit without begin")
            }
            TxnStatus::RollbackOnly if ctx.depth == 1 => {
                let start_ts = ctx.start_ts;
                ctx.status = TxnStatus::Inactive;
                ctx.start_ts = 0;
                ctx.depth = 0;
                drop(ctx);
                self.abort(start_ts)?;
                return err_at!(Rollback, msg: "transaction {} conflicted", start_ts);
            }
            _ => (),
        }
        if ctx.depth > 1 {
            ctx.depth -= 1;
            return Ok(());
        }

        let start_ts = ctx.start_ts;
        let durability = ctx.durability;
        let (commit_ts, address) = {
            let _quiesce = self.inner.txns.quiesce_commits()?;
            let commit_ts = self.inner.txns.next_ts();
            let address = self.inner.journal.append_txn_commit(start_ts, commit_ts)?;
            self.inner.txns.mark_committed(start_ts, commit_ts);
            (commit_ts, address)
        };
        ctx.status = TxnStatus::Inactive;
        ctx.start_ts = 0;
        ctx.depth = 0;
        drop(ctx);

        if let Durability::Hard = durability {
            self.inner.group_commit(address)?;
        }
        log::debug!(target: "txn", "committed {} at {}", start_ts, commit_ts);
        Ok(())
    }

    /// Roll the transaction back. Versions written by it stay in their
    /// MVVs until pruned, invisible to every snapshot.
    pub fn rollback(&self) -> Result<()> {
        let mut ctx = err_at!(Fatal, self.ctx.lock())?;
        if !ctx.is_active() {
            return err_at!(InvalidInput, msg: "rollback without begin");
        }
        if ctx.depth > 1 {
            ctx.depth -= 1;
            ctx.status = TxnStatus::RollbackOnly;
            return Ok(());
        }
        let start_ts = ctx.start_ts;
        ctx.status = TxnStatus::Inactive;
        ctx.start_ts = 0;
        ctx.depth = 0;
        drop(ctx);
        self.abort(start_ts)
    }

    fn abort(&self, start_ts: u64) -> Result<()> {
        self.inner.journal.append_txn_rollback(start_ts)?;
        self.inner.txns.mark_aborted(start_ts);
        log::debug!(target: "txn", "rolled back {}", start_ts);
        Ok(())
    }

    /// Set durability for subsequent transactions on this session.
    pub fn set_durability(&self, durability: Durability) -> Result<()> {
        let mut ctx = err_at!(Fatal, self.ctx.lock())?;
        ctx.durability = durability;
        Ok(())
    }

    /// Whether a transaction is open on this session.
    pub fn is_active(&self) -> bool {
        self.ctx.lock().map(|ctx| ctx.is_active()).unwrap_or(false)
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
