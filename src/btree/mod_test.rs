use std::{env, fs, path::PathBuf, sync::Arc};

use super::*;
use crate::{
    journal::{self, Journal},
    key::Key,
    page::SplitPolicy,
    pool::{self, Pool},
    util::Spinlock,
    vol::{VolumeSet, VolumeSpec},
    Error,
};

const PAGE_SIZE: usize = 1024;

struct Harness {
    volumes: Arc<VolumeSet>,
    journal: Arc<Journal>,
    pool: Arc<Pool>,
    dir: Arc<Btree>,
    ts: std::sync::atomic::AtomicU64,
}

impl Harness {
    fn new(name: &str) -> Harness {
        let mut dir = env::temp_dir();
        dir.push(format!("mvbt-btree-{}-{}", name, rand::random::<u64>()));
        fs::create_dir_all(&dir).unwrap();

        let loc: PathBuf = dir.join("main.mvbt");
        let specs = vec![VolumeSpec::new(loc.as_os_str())
            .set_create(true)
            .set_page_size(PAGE_SIZE)];
        let volumes = Arc::new(VolumeSet::open(specs).unwrap());

        let mut jconfig = journal::Config::new(dir.as_os_str(), "test");
        jconfig.set_segment_size(16 * 1024 * 1024);
        let journal = Arc::new(Journal::start(jconfig, 0, 0).unwrap());

        let pool = Arc::new(Pool::new(
            pool::Config::new(PAGE_SIZE).set_frames(128),
            Arc::clone(&volumes),
            Arc::clone(&journal),
        ));
        let vol = volumes.by_name("main").unwrap();
        let dir_tree = Btree::directory(&vol, &pool, &journal, 1).unwrap();

        Harness {
            volumes,
            journal,
            pool,
            dir: dir_tree,
            ts: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn next_ts(&self) -> u64 {
        self.ts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1
    }

    // open a handle the way a fresh engine would, measuring the depth
    // from the pages rather than trusting a cached counter.
    fn tree(&self, name: &str) -> Btree {
        let record = match Btree::lookup_tree(&self.dir, name).unwrap() {
            Some(record) => record,
            None => Btree::create_tree(&self.dir, name, self.next_ts()).unwrap(),
        };
        let vol = self.volumes.by_name("main").unwrap();
        let info = TreeInfo::from_record(vol.as_ref(), self.pool.as_ref(), &record)
            .unwrap();
        Btree::new(
            vol,
            Arc::clone(&self.pool),
            Arc::clone(&self.journal),
            Arc::new(Spinlock::new(info)),
            name,
        )
    }

    fn store(&self, tree: &Btree, key: &[u8], value: &[u8]) {
        let ts = self.next_ts();
        tree.update_cell(key, ts, SplitPolicy::Nice, |_| {
            Ok(CellOp::Put(value.to_vec()))
        })
        .unwrap();
    }

    fn delete(&self, tree: &Btree, key: &[u8]) -> Option<Vec<u8>> {
        let ts = self.next_ts();
        tree.update_cell(key, ts, SplitPolicy::Nice, |_| Ok(CellOp::Delete))
            .unwrap()
    }

    fn live_pages(&self) -> u64 {
        let stats = self.volumes.by_name("main").unwrap().to_stats();
        stats.pages_allocated - stats.pages_freed
    }
}

fn key_i64(i: i64) -> Vec<u8> {
    let mut key = Key::new();
    key.append_i64(i).unwrap();
    key.as_bytes().to_vec()
}

fn scan_all(tree: &Btree) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = vec![];
    let mut probe = Key::before().as_bytes().to_vec();
    while let Some((key, cell)) = tree.seek(&probe, true, false).unwrap() {
        probe = key.clone();
        out.push((key, cell));
    }
    out
}

#[test]
fn test_insert_fetch_many() {
    let hns = Harness::new("insert");
    let tree = hns.tree("t1");

    let n = 500_i64;
    for i in 0..n {
        hns.store(&tree, &key_i64(i), format!("Record #{}", i).as_bytes());
    }
    assert_eq!(tree.len(), n as i64);

    for i in 0..n {
        let cell = tree.fetch_cell(&key_i64(i)).unwrap().unwrap();
        assert_eq!(cell, format!("Record #{}", i).into_bytes(), "key {}", i);
    }
    assert_eq!(tree.fetch_cell(&key_i64(n + 10)).unwrap(), None);

    // forward scan yields every key in encoded order.
    let got = scan_all(&tree);
    assert_eq!(got.len(), n as usize);
    for (i, (key, _)) in got.iter().enumerate() {
        assert_eq!(key, &key_i64(i as i64), "position {}", i);
    }

    // splits grew the tree beyond a single page.
    assert!(hns.live_pages() > 4, "{} pages", hns.live_pages());
    assert!(tree.to_depth() >= 2, "depth {}", tree.to_depth());
    assert!(tree.integrity_check().unwrap().is_empty());
}

#[test]
fn test_replace_value() {
    let hns = Harness::new("replace");
    let tree = hns.tree("t1");

    hns.store(&tree, &key_i64(1), b"one");
    hns.store(&tree, &key_i64(1), b"uno");
    assert_eq!(tree.fetch_cell(&key_i64(1)).unwrap().unwrap(), b"uno".to_vec());
    assert_eq!(tree.len(), 1);

    // the closure sees the current cell.
    let ts = hns.next_ts();
    tree.update_cell(&key_i64(1), ts, SplitPolicy::Nice, |old| {
        assert_eq!(old.unwrap(), b"uno");
        Ok(CellOp::Keep)
    })
    .unwrap();
}

#[test]
fn test_reverse_seek() {
    let hns = Harness::new("reverse");
    let tree = hns.tree("t1");
    for i in 0..300 {
        hns.store(&tree, &key_i64(i), b"v");
    }

    let mut probe = Key::after().as_bytes().to_vec();
    let mut seen = vec![];
    while let Some((key, _)) = tree.seek(&probe, false, false).unwrap() {
        probe = key.clone();
        seen.push(key);
    }
    assert_eq!(seen.len(), 300);
    for (i, key) in seen.iter().enumerate() {
        assert_eq!(key, &key_i64(299 - i as i64));
    }
}

#[test]
fn test_delete_all_collapses_tree() {
    let hns = Harness::new("collapse");
    let tree = hns.tree("t1");

    let baseline = hns.live_pages();
    let n = 400_i64;
    for i in 0..n {
        hns.store(&tree, &key_i64(i), &vec![0x55; 24]);
    }
    assert!(hns.live_pages() > baseline);

    for i in 0..n {
        let old = hns.delete(&tree, &key_i64(i));
        assert!(old.is_some(), "key {}", i);
    }
    assert_eq!(tree.len(), 0);
    assert!(scan_all(&tree).is_empty());
    assert!(tree.integrity_check().unwrap().is_empty());

    // joins and root collapse return every split page to garbage.
    assert_eq!(hns.live_pages(), baseline);
    assert_eq!(tree.to_depth(), 1);
}

#[test]
fn test_reopened_tree_collapse() {
    let hns = Harness::new("reopen-collapse");
    let n = 2500_i64;
    {
        let tree = hns.tree("t1");
        for i in 0..n {
            hns.store(&tree, &key_i64(i), &vec![0x33; 24]);
        }
        assert!(tree.to_depth() >= 3, "depth {}", tree.to_depth());
    }

    // a fresh handle measures the real depth, and collapsing a deep
    // tree through it stays in balance.
    let reopened = hns.tree("t1");
    assert!(reopened.to_depth() >= 3, "depth {}", reopened.to_depth());
    for i in 0..n {
        assert!(hns.delete(&reopened, &key_i64(i)).is_some(), "key {}", i);
    }
    assert_eq!(reopened.to_depth(), 1);
    assert!(scan_all(&reopened).is_empty());
    assert!(reopened.integrity_check().unwrap().is_empty());
}

#[test]
fn test_remove_range_idempotent() {
    let hns = Harness::new("range");
    let tree = hns.tree("t1");
    for i in 0..200 {
        hns.store(&tree, &key_i64(i), b"v");
    }

    let (low, high) = (key_i64(50), key_i64(149));
    let ts = hns.next_ts();
    let removed = tree.remove_range_phys(&low, &high, ts).unwrap();
    assert_eq!(removed, 100);
    assert_eq!(tree.len(), 100);

    // a second identical range delete is a no-op.
    let ts = hns.next_ts();
    assert_eq!(tree.remove_range_phys(&low, &high, ts).unwrap(), 0);
    assert_eq!(tree.len(), 100);

    let got = scan_all(&tree);
    assert_eq!(got.len(), 100);
    assert!(got.iter().all(|(key, _)| key < &low || key > &high));
    assert!(tree.integrity_check().unwrap().is_empty());
}

#[test]
fn test_long_record_roundtrip() {
    let hns = Harness::new("long");
    let tree = hns.tree("t1");

    let value: Vec<u8> = (0..(3 * PAGE_SIZE + 17)).map(|i| (i % 251) as u8).collect();
    hns.store(&tree, &key_i64(1), &value);
    let got = tree.fetch_cell(&key_i64(1)).unwrap().unwrap();
    assert_eq!(got.len(), value.len());
    assert_eq!(got, value);

    let pages_with_long = hns.live_pages();

    // replacing the long value frees the old chain.
    hns.store(&tree, &key_i64(1), b"short");
    assert_eq!(
        tree.fetch_cell(&key_i64(1)).unwrap().unwrap(),
        b"short".to_vec()
    );
    assert!(hns.live_pages() < pages_with_long);

    // and a long value deletes cleanly.
    hns.store(&tree, &key_i64(2), &value);
    let baseline = hns.live_pages();
    hns.delete(&tree, &key_i64(2));
    assert!(hns.live_pages() < baseline);
    assert!(tree.integrity_check().unwrap().is_empty());
}

#[test]
fn test_tree_directory() {
    let hns = Harness::new("directory");

    assert!(Btree::lookup_tree(&hns.dir, "missing").unwrap().is_none());

    let t1 = hns.tree("alpha");
    hns.store(&t1, &key_i64(1), b"a");
    let record = Btree::lookup_tree(&hns.dir, "alpha").unwrap().unwrap();
    assert_eq!(record.name, "alpha");
    assert_eq!(record.root, t1.to_root());

    // creating again fails, re-opening reuses the root.
    match Btree::create_tree(&hns.dir, "alpha", hns.next_ts()) {
        Err(Error::TreeExists(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    let again = hns.tree("alpha");
    assert_eq!(again.to_root(), t1.to_root());
    assert_eq!(
        again.fetch_cell(&key_i64(1)).unwrap().unwrap(),
        b"a".to_vec()
    );
}

#[test]
fn test_remove_tree_reclaims_pages() {
    let hns = Harness::new("remove-tree");
    let baseline = hns.live_pages();

    let tree = hns.tree("doomed");
    for i in 0..300 {
        hns.store(&tree, &key_i64(i), &vec![0x44; 32]);
    }
    let value: Vec<u8> = vec![0x77; 2 * PAGE_SIZE];
    hns.store(&tree, &key_i64(1000), &value);
    assert!(hns.live_pages() > baseline + 1);

    let ts = hns.next_ts();
    let key = tree_key("doomed");
    hns.dir
        .update_cell(&key, ts, SplitPolicy::Nice, |_| Ok(CellOp::Delete))
        .unwrap();
    tree.remove_tree(hns.next_ts()).unwrap();

    // every page, index, leaf, long chain and the root, is reclaimed.
    assert_eq!(hns.live_pages(), baseline);
    assert!(Btree::lookup_tree(&hns.dir, "doomed").unwrap().is_none());
}

#[test]
fn test_seek_inclusive_exclusive() {
    let hns = Harness::new("seek");
    let tree = hns.tree("t1");
    for i in [10_i64, 20, 30].iter() {
        hns.store(&tree, &key_i64(*i), b"v");
    }

    let (key, _) = tree.seek(&key_i64(20), true, true).unwrap().unwrap();
    assert_eq!(key, key_i64(20));
    let (key, _) = tree.seek(&key_i64(20), true, false).unwrap().unwrap();
    assert_eq!(key, key_i64(30));
    let (key, _) = tree.seek(&key_i64(20), false, true).unwrap().unwrap();
    assert_eq!(key, key_i64(20));
    let (key, _) = tree.seek(&key_i64(20), false, false).unwrap().unwrap();
    assert_eq!(key, key_i64(10));
    assert!(tree.seek(&key_i64(30), true, false).unwrap().is_none());
    assert!(tree.seek(&key_i64(10), false, false).unwrap().is_none());
}
