//! Module implement the on-disk B+tree, an ordered map from encoded
//! keys to cells, layered over the buffer pool.
//!
//! Interior INDEX pages hold upper-bound separators: the separator at
//! slot `i` is greater-or-equal to every key in child `i` and strictly
//! less than every key in child `i+1`; the rightmost spine carries the
//! AFTER sentinel as its final separator, so inserting a new maximum
//! key never touches the parents. Leaf DATA pages form a doubly-linked
//! sibling list used by traversal.
//!
//! The root page address of a tree is stable for the tree's lifetime.
//! A root split moves content into two fresh children and rewrites the
//! root in place as an INDEX page; a root collapse folds a single
//! remaining child back into the root page. The tree directory never
//! needs updating for structural changes.
//!
//! Writers latch the descent path exclusive, top-down, and release
//! bottom-up after the split or join decision is final. Readers couple
//! shared latches down the path and chase leaf siblings, re-descending
//! if a concurrent restructure moved the chase target.
//!
//! Cells larger than the per-page budget spill into a singly-linked
//! chain of LONG pages; the leaf keeps a 16-byte `{total, first_page}`
//! pointer flagged [FLAG_LONG].

use cbordata::Cborize;

use std::{cmp, convert::TryFrom, sync::Arc};

use crate::{
    journal::Journal,
    key::{MAX_KEY_LENGTH, TAG_AFTER},
    mvv,
    page::{split_point, Entry, Page, PageType, SplitPolicy, FLAG_LONG, NIL_PAGE},
    pool::{PageExcl, PageShared, Pool},
    util::Spinlock,
    vol::Volume,
    Error, Result,
};

mod alloc;

/// Leaf/index occupancy denominator below which a page tries to join
/// with a sibling, `used < page_size / JOIN_FRACTION`.
pub const JOIN_FRACTION: usize = 3;

const TREE_RECORD_VER: u32 = 0x00010001;

/// Persisted tree directory record.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct TreeRecord {
    pub name: String,
    pub root: u64,
    pub created_ts: u64,
    pub seqno: u64,
    pub n_count: u64,
}

impl TreeRecord {
    const ID: u32 = TREE_RECORD_VER;
}

// in-memory, shared state of an open tree.
pub(crate) struct TreeInfo {
    pub(crate) root: u64,
    pub(crate) depth: usize,
    pub(crate) seqno: u64,
    pub(crate) n_count: i64,
}

impl TreeInfo {
    /// Rebuild shared state for an existing tree. The persisted record
    /// carries the counters; the depth is measured from the pages, a
    /// stale number here would corrupt the split/collapse accounting.
    pub(crate) fn from_record(
        vol: &Volume,
        pool: &Pool,
        record: &TreeRecord,
    ) -> Result<TreeInfo> {
        Ok(TreeInfo {
            root: record.root,
            depth: measure_depth(vol, pool, record.root)?,
            seqno: record.seqno,
            n_count: record.n_count as i64,
        })
    }
}

// number of levels from `root` down to its leaves, walking the
// leftmost spine.
fn measure_depth(vol: &Volume, pool: &Pool, root: u64) -> Result<usize> {
    let mut depth = 1;
    let mut address = root;
    loop {
        let guard = pool.pin_shared(vol.to_id(), address)?;
        match guard.page().to_type() {
            PageType::Data => break Ok(depth),
            PageType::Index => {
                address = guard.page().child_at(0);
                depth += 1;
            }
            typ => break err_at!(CorruptPage, msg: "depth walk hits {} page", typ),
        }
    }
}

/// What [Btree::update_cell]'s closure decided to do with a cell.
pub(crate) enum CellOp {
    Keep,
    Put(Vec<u8>),
    Delete,
}

/// Handle over one tree within a volume. Cheap to construct, state is
/// shared through the `info` spinlock.
pub struct Btree {
    vol: Arc<Volume>,
    pool: Arc<Pool>,
    journal: Arc<Journal>,
    pub(crate) info: Arc<Spinlock<TreeInfo>>,
    // None marks the volume's directory tree, whose root rides in the
    // volume head page.
    name: Option<String>,
}

// encoded directory key for a tree name.
pub(crate) fn tree_key(name: &str) -> Vec<u8> {
    let mut key = crate::key::Key::new();
    key.append_str(name).unwrap();
    key.as_bytes().to_vec()
}

fn after_key() -> Vec<u8> {
    vec![TAG_AFTER]
}

fn child_entry(key: Vec<u8>, address: u64) -> Entry {
    Entry::new(key, 0, address.to_be_bytes().to_vec())
}

impl Btree {
    /// Open the volume's directory tree, creating its root on first
    /// use. The directory maps tree names to [TreeRecord] cells.
    pub(crate) fn directory(
        vol: &Arc<Volume>,
        pool: &Arc<Pool>,
        journal: &Arc<Journal>,
        ts: u64,
    ) -> Result<Arc<Btree>> {
        let root = match vol.read_head().directory_root {
            NIL_PAGE => {
                let root = {
                    let guard = alloc::allocate_page(
                        vol,
                        pool.as_ref(),
                        journal.as_ref(),
                        PageType::Data,
                        ts,
                    )?;
                    guard.page().to_address()
                };
                let (_, head_page) = vol.with_head(|head| {
                    head.directory_root = root;
                    Ok(())
                })?;
                alloc::publish_head(vol, pool.as_ref(), journal.as_ref(), head_page, ts)?;
                root
            }
            root => root,
        };

        let info = TreeInfo {
            root,
            depth: measure_depth(vol.as_ref(), pool.as_ref(), root)?,
            seqno: 0,
            n_count: 0,
        };
        let tree = Btree {
            vol: Arc::clone(vol),
            pool: Arc::clone(pool),
            journal: Arc::clone(journal),
            info: Arc::new(Spinlock::new(info)),
            name: None,
        };
        Ok(Arc::new(tree))
    }

    /// Look up `name` in the directory tree.
    pub(crate) fn lookup_tree(dir: &Btree, name: &str) -> Result<Option<TreeRecord>> {
        match dir.fetch_cell(&tree_key(name))? {
            Some(cell) => Ok(Some(crate::util::from_cbor_bytes(&cell)?.0)),
            None => Ok(None),
        }
    }

    /// Create `name`, allocating an empty root leaf and storing its
    /// directory record. Fail if the tree exists.
    pub(crate) fn create_tree(
        dir: &Btree,
        name: &str,
        ts: u64,
    ) -> Result<TreeRecord> {
        if Self::lookup_tree(dir, name)?.is_some() {
            return err_at!(TreeExists, msg: "{}", name);
        }
        let root = {
            let guard = alloc::allocate_page(
                dir.vol.as_ref(),
                dir.pool.as_ref(),
                dir.journal.as_ref(),
                PageType::Data,
                ts,
            )?;
            guard.page().to_address()
        };
        let record = TreeRecord {
            name: name.to_string(),
            root,
            created_ts: ts,
            seqno: 0,
            n_count: 0,
        };
        let cell = crate::util::into_cbor_bytes(record.clone())?;
        dir.update_cell(&tree_key(name), ts, SplitPolicy::Nice, |_| {
            Ok(CellOp::Put(cell))
        })?;
        log::info!(target: "btree", "created tree {} root {}", name, root);
        Ok(record)
    }

    /// Construct a handle over an existing tree.
    pub(crate) fn new(
        vol: Arc<Volume>,
        pool: Arc<Pool>,
        journal: Arc<Journal>,
        info: Arc<Spinlock<TreeInfo>>,
        name: &str,
    ) -> Btree {
        Btree {
            vol,
            pool,
            journal,
            info,
            name: Some(name.to_string()),
        }
    }

    pub fn to_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => "<directory>".to_string(),
        }
    }

    pub(crate) fn to_root(&self) -> u64 {
        self.info.read().root
    }

    pub(crate) fn to_volume(&self) -> &Arc<Volume> {
        &self.vol
    }

    pub fn to_seqno(&self) -> u64 {
        self.info.read().seqno
    }

    /// Number of levels from the root down to the leaves.
    pub fn to_depth(&self) -> usize {
        self.info.read().depth
    }

    pub fn len(&self) -> i64 {
        self.info.read().n_count
    }
}

// page write helper.
impl Btree {
    // finalize a mutated page: stamp, journal, mark dirty.
    fn log_page(&self, guard: &mut PageExcl, ts: u64) -> Result<()> {
        guard.page_mut().set_generation(ts);
        if !self.vol.is_transient() {
            self.journal.append_page_image(self.vol.to_id(), guard.page())?;
        }
        guard.mark_dirty(ts);
        Ok(())
    }

    fn is_underflow(&self, guard: &PageExcl) -> bool {
        let page_size = self.pool.page_size();
        let used = page_size - guard.page().free_space();
        used < page_size / JOIN_FRACTION
    }
}

// descent.
impl Btree {
    // exclusive descent, returns the latched path of (index page, slot)
    // plus the leaf.
    fn descend_excl<'a>(
        &self,
        pool: &'a Pool,
        key: &[u8],
    ) -> Result<(Vec<(PageExcl<'a>, usize)>, PageExcl<'a>)> {
        let mut path = vec![];
        let mut address = self.to_root();
        loop {
            let guard = pool.pin_exclusive(self.vol.to_id(), address)?;
            match guard.page().to_type() {
                PageType::Data => break Ok((path, guard)),
                PageType::Index => {
                    let pos = guard.page().find(key);
                    let slot = cmp::min(pos.index, guard.page().len() - 1);
                    address = guard.page().child_at(slot);
                    path.push((guard, slot));
                }
                typ => {
                    break err_at!(
                        CorruptPage, msg: "descent hits {} page {}", typ, address
                    )
                }
            }
        }
    }

    // shared descent with latch coupling, only the leaf stays latched.
    fn descend_shared<'a>(&self, pool: &'a Pool, key: &[u8]) -> Result<PageShared<'a>> {
        let mut guard = pool.pin_shared(self.vol.to_id(), self.to_root())?;
        loop {
            match guard.page().to_type() {
                PageType::Data => break Ok(guard),
                PageType::Index => {
                    let pos = guard.page().find(key);
                    let slot = cmp::min(pos.index, guard.page().len() - 1);
                    let child = guard.page().child_at(slot);
                    let next = pool.pin_shared(self.vol.to_id(), child)?;
                    guard = next;
                }
                typ => {
                    break err_at!(CorruptPage, msg: "descent hits {} page", typ)
                }
            }
        }
    }
}

// long records.
impl Btree {
    // spill an oversized cell into a LONG chain, return the flagged
    // 16-byte head cell.
    fn spill(&self, pool: &Pool, cell: Vec<u8>, ts: u64) -> Result<(u8, Vec<u8>)> {
        let page_size = self.pool.page_size();
        if cell.len() <= Page::cell_budget(page_size) {
            return Ok((0, cell));
        }

        let capacity = Page::long_capacity(page_size);
        let chunks: Vec<&[u8]> = cell.chunks(capacity).collect();
        let mut next = NIL_PAGE;
        // build back-to-front so each page links to its successor.
        for chunk in chunks.into_iter().rev() {
            let mut guard = alloc::allocate_page(
                self.vol.as_ref(),
                pool,
                self.journal.as_ref(),
                PageType::Long,
                ts,
            )?;
            guard.page_mut().set_long_payload(chunk)?;
            guard.page_mut().set_right_sibling(next);
            next = guard.page().to_address();
            self.log_page(&mut guard, ts)?;
        }

        let mut head = Vec::with_capacity(16);
        head.extend_from_slice(&u64::try_from(cell.len()).unwrap().to_be_bytes());
        head.extend_from_slice(&next.to_be_bytes());
        Ok((FLAG_LONG, head))
    }

    fn decode_long_head(cell: &[u8]) -> Result<(usize, u64)> {
        check_remaining!(cell, 16, "long-head")?;
        let mut scratch = [0_u8; 8];
        scratch.copy_from_slice(&cell[..8]);
        let total = usize::try_from(u64::from_be_bytes(scratch)).unwrap();
        scratch.copy_from_slice(&cell[8..16]);
        Ok((total, u64::from_be_bytes(scratch)))
    }

    // materialize a cell, following the LONG chain when flagged.
    fn materialize(&self, pool: &Pool, flags: u8, raw: &[u8]) -> Result<Vec<u8>> {
        if (flags & FLAG_LONG) == 0 {
            return Ok(raw.to_vec());
        }
        let (total, mut address) = Self::decode_long_head(raw)?;
        let mut cell = Vec::with_capacity(total);
        while address != NIL_PAGE {
            let guard = pool.pin_shared(self.vol.to_id(), address)?;
            if guard.page().to_type() != PageType::Long {
                return err_at!(
                    CorruptPage, msg: "long chain hits {:?}", guard.page()
                );
            }
            cell.extend_from_slice(guard.page().as_long_payload()?);
            address = guard.page().to_right_sibling();
        }
        if cell.len() != total {
            return err_at!(
                CorruptPage, msg: "long record {} != {} bytes", cell.len(), total
            );
        }
        Ok(cell)
    }

    // return the old chain to garbage.
    fn free_long(&self, pool: &Pool, raw: &[u8], ts: u64) -> Result<()> {
        let (_, mut address) = Self::decode_long_head(raw)?;
        while address != NIL_PAGE {
            let mut guard = pool.pin_exclusive(self.vol.to_id(), address)?;
            let next = guard.page().to_right_sibling();
            alloc::free_page(
                self.vol.as_ref(),
                pool,
                self.journal.as_ref(),
                &mut guard,
                ts,
            )?;
            address = next;
        }
        Ok(())
    }
}

// write path.
impl Btree {
    /// Read-modify-write of the cell at `key` under a single exclusive
    /// descent. The closure sees the materialized current cell and
    /// decides to keep, replace or delete it. Returns the old cell.
    pub(crate) fn update_cell<F>(
        &self,
        key: &[u8],
        ts: u64,
        policy: SplitPolicy,
        f: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(Option<&[u8]>) -> Result<CellOp>,
    {
        if self.vol.is_read_only() {
            return err_at!(ReadOnlyVolume, msg: "{}", self.vol.to_name());
        }
        if key.len() > MAX_KEY_LENGTH {
            return err_at!(KeyTooLong, msg: "key of {} bytes", key.len());
        }
        let pool = self.pool.as_ref();
        let (mut path, mut leaf) = self.descend_excl(pool, key)?;
        let pos = leaf.page().find(key);

        let (old_flags, old_raw) = match pos.exact {
            true => (
                leaf.page().flags_at(pos.index),
                Some(leaf.page().value_at(pos.index).to_vec()),
            ),
            false => (0, None),
        };
        let old_cell = match &old_raw {
            Some(raw) => Some(self.materialize(pool, old_flags, raw)?),
            None => None,
        };

        match f(old_cell.as_deref())? {
            CellOp::Keep => Ok(old_cell),
            CellOp::Put(cell) => {
                if (old_flags & FLAG_LONG) != 0 {
                    self.free_long(pool, old_raw.as_ref().unwrap(), ts)?;
                }
                let (flags, stored) = self.spill(pool, cell, ts)?;
                let mut entries = leaf.page().to_entries();
                let entry = Entry::new(key.to_vec(), flags, stored);
                match pos.exact {
                    true => entries[pos.index] = entry,
                    false => entries.insert(pos.index, entry),
                }
                match Page::fits(&entries, pool.page_size()) {
                    true => {
                        leaf.page_mut().set_entries(&entries)?;
                        self.log_page(&mut leaf, ts)?;
                    }
                    false => {
                        self.split(pool, &mut path, leaf, entries, pos.index, ts, policy)?
                    }
                }
                let mut info = self.info.write();
                info.seqno += 1;
                if !pos.exact {
                    info.n_count += 1;
                }
                Ok(old_cell)
            }
            CellOp::Delete => {
                if !pos.exact {
                    return Ok(None);
                }
                if (old_flags & FLAG_LONG) != 0 {
                    self.free_long(pool, old_raw.as_ref().unwrap(), ts)?;
                }
                let mut entries = leaf.page().to_entries();
                entries.remove(pos.index);
                leaf.page_mut().set_entries(&entries)?;
                self.log_page(&mut leaf, ts)?;
                if self.is_underflow(&leaf) {
                    self.rebalance(pool, &mut path, leaf, ts)?;
                }
                let mut info = self.info.write();
                info.seqno += 1;
                info.n_count -= 1;
                Ok(old_cell)
            }
        }
    }

    // split an over-full page. `entries` is the desired content that no
    // longer fits, `insert_at` the slot of the incoming entry.
    fn split<'a>(
        &self,
        pool: &'a Pool,
        path: &mut Vec<(PageExcl<'a>, usize)>,
        mut guard: PageExcl<'a>,
        entries: Vec<Entry>,
        insert_at: usize,
        ts: u64,
        policy: SplitPolicy,
    ) -> Result<()> {
        let page_size = pool.page_size();
        let n = split_point(&entries, insert_at, page_size, policy);
        let typ = guard.page().to_type();
        let address = guard.page().to_address();
        let left_entries = entries[..n].to_vec();
        let right_entries = entries[n..].to_vec();
        let sep_left = left_entries.last().unwrap().key.clone();

        if path.is_empty() {
            // stable-root split, content moves into two fresh children
            // and the root is rewritten in place as an index page.
            let mut left = alloc::allocate_page(
                self.vol.as_ref(),
                pool,
                self.journal.as_ref(),
                typ,
                ts,
            )?;
            let mut right = alloc::allocate_page(
                self.vol.as_ref(),
                pool,
                self.journal.as_ref(),
                typ,
                ts,
            )?;
            let (left_addr, right_addr) =
                (left.page().to_address(), right.page().to_address());

            left.page_mut().set_entries(&left_entries)?;
            left.page_mut().set_left_sibling(NIL_PAGE);
            left.page_mut().set_right_sibling(right_addr);
            right.page_mut().set_entries(&right_entries)?;
            right.page_mut().set_left_sibling(left_addr);
            right.page_mut().set_right_sibling(NIL_PAGE);
            self.log_page(&mut left, ts)?;
            self.log_page(&mut right, ts)?;

            let sep_right = match typ {
                PageType::Data => after_key(),
                _ => right_entries.last().unwrap().key.clone(),
            };
            let root = guard.page_mut();
            root.set_type(PageType::Index);
            root.set_left_sibling(NIL_PAGE);
            root.set_right_sibling(NIL_PAGE);
            root.set_entries(&[
                child_entry(sep_left, left_addr),
                child_entry(sep_right, right_addr),
            ])?;
            self.log_page(&mut guard, ts)?;

            self.info.write().depth += 1;
            return Ok(());
        }

        // ordinary split, the page keeps the left half at its address.
        let mut right = alloc::allocate_page(
            self.vol.as_ref(),
            pool,
            self.journal.as_ref(),
            typ,
            ts,
        )?;
        let right_addr = right.page().to_address();
        let old_right = guard.page().to_right_sibling();

        right.page_mut().set_entries(&right_entries)?;
        right.page_mut().set_left_sibling(address);
        right.page_mut().set_right_sibling(old_right);
        self.log_page(&mut right, ts)?;

        guard.page_mut().set_entries(&left_entries)?;
        guard.page_mut().set_right_sibling(right_addr);
        self.log_page(&mut guard, ts)?;

        if old_right != NIL_PAGE {
            let mut far = pool.pin_exclusive(self.vol.to_id(), old_right)?;
            far.page_mut().set_left_sibling(right_addr);
            self.log_page(&mut far, ts)?;
        }
        drop(right);
        drop(guard);

        // lift the new separator into the parent.
        let (mut parent, slot) = path.pop().unwrap();
        let mut pentries = parent.page().to_entries();
        let old_sep = pentries[slot].key.clone();
        pentries[slot] = child_entry(sep_left, address);
        pentries.insert(slot + 1, child_entry(old_sep, right_addr));

        match Page::fits(&pentries, page_size) {
            true => {
                parent.page_mut().set_entries(&pentries)?;
                self.log_page(&mut parent, ts)
            }
            false => self.split(pool, path, parent, pentries, slot + 1, ts, policy),
        }
    }

    // join or redistribute an under-full page with a sibling under the
    // same parent, propagating underflow upward; collapses the root
    // when it shrinks to a single child.
    fn rebalance<'a>(
        &self,
        pool: &'a Pool,
        path: &mut Vec<(PageExcl<'a>, usize)>,
        guard: PageExcl<'a>,
        ts: u64,
    ) -> Result<()> {
        let (mut parent, slot) = match path.pop() {
            Some(parent) => parent,
            None => return self.collapse_root(pool, guard, ts),
        };

        // pair the page with a sibling, preferring the right one; the
        // left-latch-first protocol re-pins both under the parent.
        let merged_parent_underflow = if slot + 1 < parent.page().len() {
            let right_addr = parent.page().child_at(slot + 1);
            let right = pool.pin_exclusive(self.vol.to_id(), right_addr)?;
            self.join_siblings(pool, &mut parent, slot, guard, right, ts)?
        } else if slot > 0 {
            let left_addr = parent.page().child_at(slot - 1);
            let address = guard.page().to_address();
            drop(guard);
            let left = pool.pin_exclusive(self.vol.to_id(), left_addr)?;
            let right = pool.pin_exclusive(self.vol.to_id(), address)?;
            self.join_siblings(pool, &mut parent, slot - 1, left, right, ts)?
        } else {
            // a lone child, nothing to pair with.
            false
        };

        if merged_parent_underflow {
            self.rebalance(pool, path, parent, ts)?;
        } else if path.is_empty() && parent.page().to_type() == PageType::Index {
            self.collapse_root(pool, parent, ts)?;
        }
        Ok(())
    }

    // merge `right` into `left` when the union fits, redistribute
    // otherwise. Returns whether the parent itself now underflows.
    fn join_siblings(
        &self,
        pool: &Pool,
        parent: &mut PageExcl,
        left_slot: usize,
        mut left: PageExcl,
        mut right: PageExcl,
        ts: u64,
    ) -> Result<bool> {
        let page_size = pool.page_size();
        let left_addr = left.page().to_address();

        let mut merged = left.page().to_entries();
        merged.extend(right.page().to_entries());

        let mut pentries = parent.page().to_entries();

        if Page::fits(&merged, page_size) {
            let far_addr = right.page().to_right_sibling();
            left.page_mut().set_entries(&merged)?;
            left.page_mut().set_right_sibling(far_addr);
            self.log_page(&mut left, ts)?;
            if far_addr != NIL_PAGE {
                let mut far = pool.pin_exclusive(self.vol.to_id(), far_addr)?;
                far.page_mut().set_left_sibling(left_addr);
                self.log_page(&mut far, ts)?;
            }

            // the merged page inherits the right separator.
            pentries[left_slot] =
                child_entry(pentries[left_slot + 1].key.clone(), left_addr);
            pentries.remove(left_slot + 1);
            parent.page_mut().set_entries(&pentries)?;
            self.log_page(parent, ts)?;

            alloc::free_page(
                self.vol.as_ref(),
                pool,
                self.journal.as_ref(),
                &mut right,
                ts,
            )?;
            Ok(self.is_underflow(parent))
        } else {
            // both halves survive, balance the bytes between them.
            let n = split_point(&merged, merged.len() / 2, page_size, SplitPolicy::Nice);
            let sep = merged[n - 1].key.clone();
            left.page_mut().set_entries(&merged[..n])?;
            self.log_page(&mut left, ts)?;
            right.page_mut().set_entries(&merged[n..])?;
            self.log_page(&mut right, ts)?;

            pentries[left_slot] = child_entry(sep, left_addr);
            parent.page_mut().set_entries(&pentries)?;
            self.log_page(parent, ts)?;
            Ok(false)
        }
    }

    // fold a single-child root back into the root page, keeping the
    // root address stable.
    fn collapse_root<'a>(
        &self,
        pool: &'a Pool,
        mut root: PageExcl<'a>,
        ts: u64,
    ) -> Result<()> {
        if root.page().to_type() != PageType::Index || root.page().len() != 1 {
            return Ok(());
        }
        let child_addr = root.page().child_at(0);
        let mut child = pool.pin_exclusive(self.vol.to_id(), child_addr)?;

        let entries = child.page().to_entries();
        let root_page = root.page_mut();
        root_page.set_type(child.page().to_type());
        root_page.set_entries(&entries)?;
        root_page.set_left_sibling(NIL_PAGE);
        root_page.set_right_sibling(NIL_PAGE);
        self.log_page(&mut root, ts)?;

        alloc::free_page(
            self.vol.as_ref(),
            pool,
            self.journal.as_ref(),
            &mut child,
            ts,
        )?;
        {
            let mut info = self.info.write();
            info.depth = info.depth.saturating_sub(1);
        }

        // the collapsed child may itself be a single-child index.
        self.collapse_root(pool, root, ts)
    }
}

// read path.
impl Btree {
    /// Fetch the materialized cell at `key`.
    pub(crate) fn fetch_cell(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let pool = self.pool.as_ref();
        let leaf = self.descend_shared(pool, key)?;
        let pos = leaf.page().find(key);
        match pos.exact {
            true => {
                let flags = leaf.page().flags_at(pos.index);
                let raw = leaf.page().value_at(pos.index);
                Ok(Some(self.materialize(pool, flags, raw)?))
            }
            false => Ok(None),
        }
    }

    /// Step the cursor one physical entry in `forward` direction.
    /// `inclusive` admits an entry equal to `key`. Returns the entry's
    /// encoded key and materialized cell.
    pub(crate) fn seek(
        &self,
        key: &[u8],
        forward: bool,
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let pool = self.pool.as_ref();
        'restart: loop {
            let leaf = self.descend_shared(pool, key)?;
            let pos = leaf.page().find(key);

            if forward {
                let slot = match (pos.exact, inclusive) {
                    (true, true) => pos.index,
                    (true, false) => pos.index + 1,
                    (false, _) => pos.index,
                };
                if slot < leaf.page().len() {
                    return self.entry_at(pool, &leaf, slot).map(Some);
                }
                // walk the right sibling chain, latches held left to
                // right, the same order writers use.
                let mut cursor = leaf;
                loop {
                    let next = cursor.page().to_right_sibling();
                    if next == NIL_PAGE {
                        return Ok(None);
                    }
                    let sibling = pool.pin_shared(self.vol.to_id(), next)?;
                    drop(cursor);
                    if sibling.page().to_type() != PageType::Data {
                        continue 'restart;
                    }
                    if !sibling.page().is_empty() {
                        return self.entry_at(pool, &sibling, 0).map(Some);
                    }
                    cursor = sibling;
                }
            } else {
                let slot = match (pos.exact, inclusive) {
                    (true, true) => Some(pos.index),
                    _ => pos.index.checked_sub(1),
                };
                if let Some(slot) = slot {
                    return self.entry_at(pool, &leaf, slot).map(Some);
                }
                // chase left siblings; the left-to-right latch protocol
                // forbids holding the leaf while pinning its left, so
                // release first and validate the link after.
                let mut expect = leaf.page().to_address();
                let mut address = leaf.page().to_left_sibling();
                drop(leaf);
                loop {
                    if address == NIL_PAGE {
                        return Ok(None);
                    }
                    let sibling = pool.pin_shared(self.vol.to_id(), address)?;
                    let moved = sibling.page().to_type() != PageType::Data
                        || sibling.page().to_right_sibling() != expect;
                    if moved {
                        continue 'restart;
                    }
                    if !sibling.page().is_empty() {
                        let slot = sibling.page().len() - 1;
                        return self.entry_at(pool, &sibling, slot).map(Some);
                    }
                    expect = address;
                    address = sibling.page().to_left_sibling();
                }
            }
        }
    }

    fn entry_at(
        &self,
        pool: &Pool,
        leaf: &PageShared,
        slot: usize,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = leaf.page().key_at(slot);
        let flags = leaf.page().flags_at(slot);
        let cell = self.materialize(pool, flags, leaf.page().value_at(slot))?;
        Ok((key, cell))
    }
}

// range deletion.
impl Btree {
    /// Physically delete every entry in the inclusive range, leaf by
    /// leaf, joining emptied pages as it goes. Returns the number of
    /// entries removed.
    pub(crate) fn remove_range_phys(
        &self,
        low: &[u8],
        high: &[u8],
        ts: u64,
    ) -> Result<usize> {
        if self.vol.is_read_only() {
            return err_at!(ReadOnlyVolume, msg: "{}", self.vol.to_name());
        }
        let pool = self.pool.as_ref();
        let mut removed = 0;
        loop {
            // locate the next key in range through the read path.
            let target = match self.seek(low, true, true)? {
                Some((key, _)) if key[..] <= *high => key,
                _ => break Ok(removed),
            };

            let (mut path, mut leaf) = self.descend_excl(pool, &target)?;
            let entries = leaf.page().to_entries();
            let from = leaf.page().find(&target).index;
            let to = entries
                .iter()
                .position(|entry| entry.key[..] > *high)
                .unwrap_or(entries.len());
            if from >= to {
                // the leaf was restructured underneath the seek, retry.
                continue;
            }

            for entry in entries[from..to].iter() {
                if (entry.flags & FLAG_LONG) != 0 {
                    self.free_long(pool, &entry.cell, ts)?;
                }
            }
            let mut kept = entries[..from].to_vec();
            kept.extend(entries[to..].to_vec());
            let n = to - from;
            leaf.page_mut().set_entries(&kept)?;
            self.log_page(&mut leaf, ts)?;
            if self.is_underflow(&leaf) {
                self.rebalance(pool, &mut path, leaf, ts)?;
            }

            removed += n;
            let mut info = self.info.write();
            info.seqno += 1;
            info.n_count -= i64::try_from(n).unwrap();
        }
    }
}

// whole-tree operations.
impl Btree {
    // gather every page owned by the subtree at `address`, bottom up.
    fn collect_pages(&self, pool: &Pool, address: u64, out: &mut Vec<u64>) -> Result<()> {
        let (children, longs) = {
            let guard = pool.pin_shared(self.vol.to_id(), address)?;
            let page = guard.page();
            match page.to_type() {
                PageType::Index => {
                    let children: Vec<u64> =
                        (0..page.len()).map(|i| page.child_at(i)).collect();
                    (children, vec![])
                }
                PageType::Data => {
                    let mut longs = vec![];
                    for i in 0..page.len() {
                        if (page.flags_at(i) & FLAG_LONG) != 0 {
                            let (_, first) = Self::decode_long_head(page.value_at(i))?;
                            longs.push(first);
                        }
                    }
                    (vec![], longs)
                }
                typ => {
                    return err_at!(CorruptPage, msg: "tree walk hits {} page", typ)
                }
            }
        };
        for child in children.into_iter() {
            self.collect_pages(pool, child, out)?;
        }
        for mut long in longs.into_iter() {
            while long != NIL_PAGE {
                let guard = pool.pin_shared(self.vol.to_id(), long)?;
                out.push(long);
                long = guard.page().to_right_sibling();
            }
        }
        out.push(address);
        Ok(())
    }

    /// Chain every page of this tree into the garbage chain. The
    /// caller owns unlinking the directory record and fencing off
    /// concurrent cursors.
    pub(crate) fn remove_tree(&self, ts: u64) -> Result<usize> {
        let name = self.to_name();
        let root = self.to_root();
        self.journal
            .append_tree_delete(self.vol.to_id(), &name, root, ts)?;

        let pool = self.pool.as_ref();
        let mut pages = vec![];
        self.collect_pages(pool, root, &mut pages)?;
        let count = pages.len();
        for address in pages.into_iter() {
            let mut guard = pool.pin_exclusive(self.vol.to_id(), address)?;
            alloc::free_page(
                self.vol.as_ref(),
                pool,
                self.journal.as_ref(),
                &mut guard,
                ts,
            )?;
        }
        log::info!(target: "btree", "removed tree {}, {} pages", name, count);
        Ok(count)
    }

    /// Verify structural invariants, returning the faults found instead
    /// of failing on the first.
    pub fn integrity_check(&self) -> Result<Vec<String>> {
        let pool = self.pool.as_ref();
        let mut faults = vec![];
        let mut leaves = vec![];
        self.check_subtree(pool, self.to_root(), None, &after_key(), &mut faults, &mut leaves)?;

        // leaf sibling chain must mirror the in-order walk.
        for window in leaves.windows(2) {
            let (a, b) = (window[0], window[1]);
            let guard = pool.pin_shared(self.vol.to_id(), a)?;
            if guard.page().to_right_sibling() != b {
                faults.push(format!("leaf {} right sibling != {}", a, b));
            }
            drop(guard);
            let guard = pool.pin_shared(self.vol.to_id(), b)?;
            if guard.page().to_left_sibling() != a {
                faults.push(format!("leaf {} left sibling != {}", b, a));
            }
        }
        Ok(faults)
    }

    fn check_subtree(
        &self,
        pool: &Pool,
        address: u64,
        low: Option<&[u8]>,
        high: &[u8],
        faults: &mut Vec<String>,
        leaves: &mut Vec<u64>,
    ) -> Result<()> {
        let guard = pool.pin_shared(self.vol.to_id(), address)?;
        let page = guard.page();
        faults.extend(page.verify());

        let entries = page.to_entries();
        for entry in entries.iter() {
            if let Some(low) = low {
                if entry.key[..] <= *low {
                    faults.push(format!("page {} key below bound", address));
                }
            }
            if entry.key[..] > *high {
                faults.push(format!("page {} key above bound", address));
            }
        }

        match page.to_type() {
            PageType::Data => {
                for entry in entries.iter() {
                    if (entry.flags & FLAG_LONG) == 0 && mvv::is_mvv(&entry.cell) {
                        if let Err(err) = mvv::versions(&entry.cell) {
                            faults.push(format!(
                                "page {} malformed mvv {}", address, err
                            ));
                        }
                    }
                }
                leaves.push(address);
                Ok(())
            }
            PageType::Index => {
                drop(guard);
                let mut prev: Option<Vec<u8>> = low.map(|low| low.to_vec());
                for entry in entries.iter() {
                    let child = {
                        let mut scratch = [0_u8; 8];
                        scratch.copy_from_slice(&entry.cell);
                        u64::from_be_bytes(scratch)
                    };
                    self.check_subtree(
                        pool,
                        child,
                        prev.as_deref(),
                        &entry.key,
                        faults,
                        leaves,
                    )?;
                    prev = Some(entry.key.clone());
                }
                Ok(())
            }
            typ => {
                faults.push(format!("page {} unexpected type {}", address, typ));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
