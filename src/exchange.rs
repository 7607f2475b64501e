//! Exchange, the user-facing cursor bound to a `(session, volume,
//! tree)` triple.
//!
//! An exchange owns a mutable [Key] and [Value] buffer, a traversal
//! position and a split policy, and is not thread-safe; one session
//! works one exchange at a time. All store/fetch/remove/traverse
//! operations run against the session's transaction when one is open,
//! otherwise each operation commits as its own unit.
//!
//! Writes inside a transaction append versions into the target cell's
//! MVV; a version from a concurrently committed transaction aborts the
//! writer with [Error::Conflict] and poisons the transaction, commit
//! will roll it back. Reads resolve the version visible at the
//! session's snapshot.

use std::sync::{Arc, Mutex};

use crate::{
    btree::{Btree, CellOp},
    engine::Inner,
    key::{Key, KeyFilter, Segment},
    mvv,
    page::{SplitPolicy, HEADER_SIZE},
    txn::{TxnCtx, TxnStatus},
    value::Value,
    Error, Result,
};

/// Traversal direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Cursor over one tree. Obtain one through
/// [Session::exchange][crate::Session::exchange].
pub struct Exchange {
    inner: Arc<Inner>,
    ctx: Arc<Mutex<TxnCtx>>,
    volume: String,
    tree_name: String,
    tree: Option<Btree>,

    key: Key,
    value: Value,
    policy: SplitPolicy,
}

impl Exchange {
    pub(crate) fn new(
        inner: Arc<Inner>,
        ctx: Arc<Mutex<TxnCtx>>,
        volume: &str,
        tree_name: &str,
    ) -> Result<Exchange> {
        inner.volumes.by_name(volume)?; // fail early on bad volume
        let mut ex = Exchange {
            inner,
            ctx,
            volume: volume.to_string(),
            tree_name: tree_name.to_string(),
            tree: None,
            key: Key::new(),
            value: Value::new(),
            policy: SplitPolicy::default(),
        };
        // bind eagerly when the tree already exists; otherwise it is
        // created lazily by the first store.
        ex.tree = ex.inner.open_tree(&ex.volume, &ex.tree_name, false)?;
        Ok(ex)
    }

    fn tree(&mut self, create: bool) -> Result<Option<&Btree>> {
        if self.tree.is_none() {
            self.tree = self.inner.open_tree(&self.volume, &self.tree_name, create)?;
        }
        Ok(self.tree.as_ref())
    }

    // size beyond which a touched MVV is opportunistically pruned.
    fn prune_trigger(&self) -> usize {
        (self.inner.pool.page_size() - HEADER_SIZE) / 8
    }
}

// key and value plumbing.
impl Exchange {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut Key {
        &mut self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Append a typed segment to the key.
    pub fn append(&mut self, seg: Segment) -> Result<&mut Self> {
        self.key.append(seg)?;
        Ok(self)
    }

    /// Clear the key to zero segments.
    pub fn clear(&mut self) -> &mut Self {
        self.key.clear();
        self
    }

    /// Remove the key's last segment.
    pub fn cut(&mut self) -> &mut Self {
        self.key.cut();
        self
    }

    /// Replace the key's last segment.
    pub fn to(&mut self, seg: Segment) -> Result<&mut Self> {
        self.key.to(seg)?;
        Ok(self)
    }

    /// Park the cursor below every key.
    pub fn to_before(&mut self) -> &mut Self {
        self.key = Key::before();
        self
    }

    /// Park the cursor above every key.
    pub fn to_after(&mut self) -> &mut Self {
        self.key = Key::after();
        self
    }

    /// Split policy for subsequent stores through this exchange.
    pub fn set_split_policy(&mut self, policy: SplitPolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    fn check_key(&self) -> Result<()> {
        if self.key.is_empty() || self.key.is_sentinel() {
            return err_at!(InvalidInput, msg: "operation needs a real key");
        }
        Ok(())
    }

    // snapshot parameters: (own-transaction start, read timestamp).
    fn snapshot(&self) -> (Option<u64>, u64) {
        let ctx = self.ctx.lock().unwrap();
        match ctx.is_active() {
            true => (Some(ctx.start_ts), ctx.start_ts),
            false => (None, self.inner.txns.current_ts()),
        }
    }
}

// write operations.
impl Exchange {
    /// Store the value buffer under the key buffer.
    pub fn store(&mut self) -> Result<()> {
        self.check_key()?;
        if !self.value.is_defined() {
            return err_at!(InvalidInput, msg: "store needs a defined value");
        }
        let bytes = self.value.as_bytes().to_vec();
        self.write_cell(&bytes)
    }

    /// Remove the key; a transactional remove writes a tombstone
    /// version, outside a transaction the entry is deleted physically.
    /// Returns whether a live value was visible to this session.
    pub fn remove(&mut self) -> Result<bool> {
        self.check_key()?;
        let (own, read_ts) = self.snapshot();
        let txns = Arc::clone(&self.inner.txns);

        if self.tree(false)?.is_none() {
            return Ok(false);
        }
        let tree = self.tree.as_ref().unwrap();
        let ts = txns.next_ts();
        let key = self.key.as_bytes().to_vec();

        let mut ctx = err_at!(Fatal, self.ctx.lock())?;
        let was_visible = match ctx.is_active() {
            true => {
                let handle = mvv::to_handle(ctx.start_ts, ctx.step);
                let start_ts = ctx.start_ts;
                let resolve = |t| txns.resolve(t);
                let res = tree.update_cell(&key, ts, self.policy, |old| {
                    let old = match old {
                        Some(old) => old,
                        None => return Ok(CellOp::Keep),
                    };
                    if mvv::is_conflicting(old, start_ts, resolve)? {
                        return err_at!(Conflict, msg: "write-write on remove");
                    }
                    Ok(CellOp::Put(mvv::append_version(Some(old), handle, &[])?))
                });
                let old = Self::poison_on_conflict(&mut ctx, res)?;
                ctx.step = ctx.step.saturating_add(1);
                match old {
                    Some(old) => {
                        mvv::read_visible(&old, own, read_ts, |t| txns.resolve(t))?
                            .is_some()
                    }
                    None => false,
                }
            }
            false => {
                drop(ctx);
                let resolve = |t| txns.resolve(t);
                let old = tree.update_cell(&key, ts, self.policy, |old| {
                    match old {
                        None => Ok(CellOp::Keep),
                        Some(old) if mvv::is_mvv(old) => {
                            if mvv::is_conflicting(old, ts, resolve)? {
                                return err_at!(Conflict, msg: "contended remove");
                            }
                            let handle = mvv::to_handle(ts, 0);
                            Ok(CellOp::Put(mvv::append_version(Some(old), handle, &[])?))
                        }
                        Some(_) => Ok(CellOp::Delete),
                    }
                })?;
                match old {
                    Some(old) => {
                        mvv::read_visible(&old, own, read_ts, |t| txns.resolve(t))?
                            .is_some()
                    }
                    None => false,
                }
            }
        };
        self.value.undefine();
        Ok(was_visible)
    }

    /// Remove the inclusive key range `[low, high]`. Returns the number
    /// of keys removed that were visible to this session.
    pub fn remove_range(&mut self, low: &Key, high: &Key) -> Result<usize> {
        let (own, read_ts) = self.snapshot();
        let txns = Arc::clone(&self.inner.txns);
        let in_txn = own.is_some();

        if self.tree(false)?.is_none() {
            return Ok(0);
        }
        let tree = self.tree.as_ref().unwrap();

        if !in_txn {
            let ts = txns.next_ts();
            return tree.remove_range_phys(low.as_bytes(), high.as_bytes(), ts);
        }

        // transactional range delete tombstones each key in range.
        let mut removed = 0;
        let mut probe = low.as_bytes().to_vec();
        let mut inclusive = true;
        loop {
            let (kbytes, cell) = match tree.seek(&probe, true, inclusive)? {
                Some(hit) => hit,
                None => break,
            };
            if kbytes[..] > *high.as_bytes() {
                break;
            }

            let mut ctx = err_at!(Fatal, self.ctx.lock())?;
            let handle = mvv::to_handle(ctx.start_ts, ctx.step);
            let start_ts = ctx.start_ts;
            let ts = txns.next_ts();
            let resolve = |t| txns.resolve(t);
            let res = tree.update_cell(&kbytes, ts, self.policy, |old| {
                if let Some(old) = old {
                    if mvv::is_conflicting(old, start_ts, resolve)? {
                        return err_at!(Conflict, msg: "write-write on range remove");
                    }
                }
                Ok(CellOp::Put(mvv::append_version(old, handle, &[])?))
            });
            Self::poison_on_conflict(&mut ctx, res)?;
            ctx.step = ctx.step.saturating_add(1);
            drop(ctx);

            if mvv::read_visible(&cell, own, read_ts, |t| txns.resolve(t))?.is_some() {
                removed += 1;
            }
            probe = kbytes;
            inclusive = false;
        }
        Ok(removed)
    }

    fn write_cell(&mut self, bytes: &[u8]) -> Result<()> {
        let txns = Arc::clone(&self.inner.txns);
        let prune_trigger = self.prune_trigger();
        let policy = self.policy;
        let key = self.key.as_bytes().to_vec();

        self.tree(true)?;
        let tree = self.tree.as_ref().unwrap();
        let ts = txns.next_ts();

        let mut ctx = err_at!(Fatal, self.ctx.lock())?;
        match ctx.is_active() {
            true => {
                let handle = mvv::to_handle(ctx.start_ts, ctx.step);
                let start_ts = ctx.start_ts;
                let horizon = txns.horizon();
                let resolve = |t| txns.resolve(t);
                let res = tree.update_cell(&key, ts, policy, |old| {
                    if let Some(old) = old {
                        if mvv::is_conflicting(old, start_ts, resolve)? {
                            return err_at!(Conflict, msg: "write-write conflict");
                        }
                    }
                    let cell = mvv::append_version(old, handle, bytes)?;
                    let cell = match cell.len() > prune_trigger {
                        true => mvv::prune(&cell, horizon, resolve)?.cell,
                        false => cell,
                    };
                    Ok(CellOp::Put(cell))
                });
                Self::poison_on_conflict(&mut ctx, res)?;
                ctx.step = ctx.step.saturating_add(1);
                Ok(())
            }
            false => {
                drop(ctx);
                let horizon = txns.horizon();
                let resolve = |t| txns.resolve(t);
                tree.update_cell(&key, ts, policy, |old| match old {
                    Some(old) if mvv::is_mvv(old) => {
                        if mvv::is_conflicting(old, ts, resolve)? {
                            return err_at!(Conflict, msg: "contended store");
                        }
                        let handle = mvv::to_handle(ts, 0);
                        let cell = mvv::append_version(Some(old), handle, bytes)?;
                        let cell = match cell.len() > prune_trigger {
                            true => mvv::prune(&cell, horizon, resolve)?.cell,
                            false => cell,
                        };
                        Ok(CellOp::Put(cell))
                    }
                    _ => Ok(CellOp::Put(mvv::encode_bare(bytes))),
                })?;
                Ok(())
            }
        }
    }

    // a conflict poisons the enclosing transaction; commit will roll
    // it back.
    fn poison_on_conflict<T>(
        ctx: &mut TxnCtx,
        res: Result<T>,
    ) -> Result<T> {
        match res {
            Err(Error::Conflict(p, m)) => {
                if ctx.is_active() {
                    ctx.status = TxnStatus::RollbackOnly;
                }
                Err(Error::Conflict(p, m))
            }
            res => res,
        }
    }
}

// read operations.
impl Exchange {
    /// Fetch the value visible at the session's snapshot into the value
    /// buffer. Returns whether the value is defined.
    pub fn fetch(&mut self) -> Result<bool> {
        self.check_key()?;
        let (own, read_ts) = self.snapshot();
        let txns = Arc::clone(&self.inner.txns);

        let key = self.key.as_bytes().to_vec();
        if self.tree(false)?.is_none() {
            self.value.undefine();
            return Ok(false);
        }
        let tree = self.tree.as_ref().unwrap();
        match tree.fetch_cell(&key)? {
            Some(cell) => {
                match mvv::read_visible(&cell, own, read_ts, |t| txns.resolve(t))? {
                    Some(bytes) => {
                        self.value.set(&bytes);
                        Ok(true)
                    }
                    None => {
                        self.value.undefine();
                        Ok(false)
                    }
                }
            }
            None => {
                self.value.undefine();
                Ok(false)
            }
        }
    }

    /// Step to the next live key in sort order.
    pub fn next(&mut self) -> Result<bool> {
        self.traverse(Direction::Forward, None)
    }

    /// Step to the previous live key in sort order.
    pub fn previous(&mut self) -> Result<bool> {
        self.traverse(Direction::Reverse, None)
    }

    /// Advance one live key in `direction`, skipping keys rejected by
    /// `filter`. On success the key and value buffers hold the entry
    /// and true is returned; false leaves the value undefined.
    pub fn traverse(
        &mut self,
        direction: Direction,
        filter: Option<&KeyFilter>,
    ) -> Result<bool> {
        let (own, read_ts) = self.snapshot();
        let txns = Arc::clone(&self.inner.txns);
        let forward = direction == Direction::Forward;

        if self.tree(false)?.is_none() {
            self.value.undefine();
            return Ok(false);
        }
        let tree = self.tree.as_ref().unwrap();

        let mut probe = self.key.as_bytes().to_vec();
        if probe.is_empty() {
            probe = match forward {
                true => Key::before().as_bytes().to_vec(),
                false => Key::after().as_bytes().to_vec(),
            };
        }
        let mut inclusive = false;

        loop {
            let (kbytes, cell) = match tree.seek(&probe, forward, inclusive)? {
                Some(hit) => hit,
                None => {
                    self.value.undefine();
                    return Ok(false);
                }
            };
            inclusive = false;

            if let Some(filter) = filter {
                let key = Key::from_encoded(&kbytes)?;
                if !filter.selected(&key) {
                    // leap past the rejected region.
                    match filter.next(&key, forward) {
                        Some(pos) => {
                            probe = pos.as_bytes().to_vec();
                            inclusive = true;
                        }
                        None => {
                            self.value.undefine();
                            return Ok(false);
                        }
                    }
                    continue;
                }
            }

            match mvv::read_visible(&cell, own, read_ts, |t| txns.resolve(t))? {
                Some(bytes) => {
                    self.key = Key::from_encoded(&kbytes)?;
                    self.value.set(&bytes);
                    return Ok(true);
                }
                // tombstoned or invisible, keep walking.
                None => probe = kbytes,
            }
        }
    }

    /// Prune every MVV in the tree against the current horizon,
    /// physically dropping keys whose history collapsed to nothing.
    /// This is the sweep behind
    /// [Engine::prune][crate::Engine::prune].
    pub(crate) fn prune_tree(&mut self) -> Result<usize> {
        let txns = Arc::clone(&self.inner.txns);
        if self.tree(false)?.is_none() {
            return Ok(0);
        }
        let tree = self.tree.as_ref().unwrap();

        let mut pruned = 0;
        let mut probe = Key::before().as_bytes().to_vec();
        loop {
            let (kbytes, cell) = match tree.seek(&probe, true, false)? {
                Some(hit) => hit,
                None => break Ok(pruned),
            };
            if mvv::is_mvv(&cell) {
                let horizon = txns.horizon();
                let ts = txns.next_ts();
                let resolve = |t| txns.resolve(t);
                tree.update_cell(&kbytes, ts, self.policy, |old| {
                    let old = match old {
                        Some(old) if mvv::is_mvv(old) => old,
                        _ => return Ok(CellOp::Keep),
                    };
                    let out = mvv::prune(old, horizon, resolve)?;
                    match (out.changed, out.cell.is_empty()) {
                        (false, _) => Ok(CellOp::Keep),
                        (true, true) => Ok(CellOp::Delete),
                        (true, false) => Ok(CellOp::Put(out.cell)),
                    }
                })?;
                pruned += 1;
            }
            probe = kbytes;
        }
    }
}

#[cfg(test)]
#[path = "exchange_test.rs"]
mod exchange_test;
