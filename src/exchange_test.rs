use std::{env, path::PathBuf};

use super::*;
use crate::{vol::VolumeSpec, Config, Direction, Engine, Error};

const PAGE_SIZE: usize = 1024;

fn open_engine(name: &str) -> Engine {
    let mut dir = env::temp_dir();
    dir.push(format!("mvbt-exchange-{}-{}", name, rand::random::<u64>()));
    open_engine_at(&dir)
}

fn open_engine_at(dir: &PathBuf) -> Engine {
    let mut config = Config::new(dir.as_os_str());
    config
        .add_volume(
            VolumeSpec::new("main.mvbt".as_ref())
                .set_create(true)
                .set_page_size(PAGE_SIZE),
        )
        .set_journalsize(1 << 20);
    Engine::open(config).unwrap()
}

#[test]
fn test_store_fetch_plain() {
    let engine = open_engine("plain");
    let session = engine.session();
    let mut ex = session.exchange("main", "t1").unwrap();

    ex.key_mut().append_str("part").unwrap();
    ex.key_mut().append_i64(10).unwrap();
    ex.value_mut().set(b"widget");
    ex.store().unwrap();

    let mut ex = session.exchange("main", "t1").unwrap();
    ex.key_mut().append_str("part").unwrap();
    ex.key_mut().append_i64(10).unwrap();
    assert!(ex.fetch().unwrap());
    assert_eq!(ex.value().as_bytes(), b"widget");
    assert!(ex.value().is_defined());

    // a missing key leaves the value undefined.
    ex.to(crate::key::Segment::Integer(11)).unwrap();
    assert!(!ex.fetch().unwrap());
    assert!(!ex.value().is_defined());
    engine.close().unwrap();
}

#[test]
fn test_txn_snapshot_isolation() {
    let engine = open_engine("snapshot");
    let writer = engine.session();
    let reader = engine.session();

    let mut wx = writer.exchange("main", "t1").unwrap();
    wx.key_mut().append_i64(1).unwrap();
    wx.value_mut().set(b"committed");
    wx.store().unwrap();

    writer.begin().unwrap();
    let mut wx = writer.exchange("main", "t1").unwrap();
    wx.key_mut().append_i64(1).unwrap();
    wx.value_mut().set(b"in-flight");
    wx.store().unwrap();

    // the writer sees its own write.
    assert!(wx.fetch().unwrap());
    assert_eq!(wx.value().as_bytes(), b"in-flight");

    // a concurrent reader still sees the committed value.
    let mut rx = reader.exchange("main", "t1").unwrap();
    rx.key_mut().append_i64(1).unwrap();
    assert!(rx.fetch().unwrap());
    assert_eq!(rx.value().as_bytes(), b"committed");

    writer.commit().unwrap();

    // a fresh snapshot observes the commit.
    let mut rx = reader.exchange("main", "t1").unwrap();
    rx.key_mut().append_i64(1).unwrap();
    assert!(rx.fetch().unwrap());
    assert_eq!(rx.value().as_bytes(), b"in-flight");
    engine.close().unwrap();
}

#[test]
fn test_txn_reader_snapshot_fixed() {
    let engine = open_engine("fixed");
    let writer = engine.session();
    let reader = engine.session();

    let mut wx = writer.exchange("main", "t1").unwrap();
    wx.key_mut().append_i64(5).unwrap();
    wx.value_mut().set(b"v0");
    wx.store().unwrap();

    // the reader's snapshot predates the second write.
    reader.begin().unwrap();
    let mut rx = reader.exchange("main", "t1").unwrap();
    rx.key_mut().append_i64(5).unwrap();
    assert!(rx.fetch().unwrap());
    assert_eq!(rx.value().as_bytes(), b"v0");

    writer.begin().unwrap();
    let mut wx = writer.exchange("main", "t1").unwrap();
    wx.key_mut().append_i64(5).unwrap();
    wx.value_mut().set(b"v1");
    wx.store().unwrap();
    writer.commit().unwrap();

    // still v0 inside the reader's transaction.
    assert!(rx.fetch().unwrap());
    assert_eq!(rx.value().as_bytes(), b"v0");
    reader.commit().unwrap();

    // and v1 outside it.
    assert!(rx.fetch().unwrap());
    assert_eq!(rx.value().as_bytes(), b"v1");
    engine.close().unwrap();
}

#[test]
fn test_write_write_conflict() {
    let engine = open_engine("conflict");
    let t1 = engine.session();
    let t2 = engine.session();

    // t2's snapshot opens before t1 commits.
    t2.begin().unwrap();
    t1.begin().unwrap();

    let mut x1 = t1.exchange("main", "t1").unwrap();
    x1.key_mut().append_i64(5).unwrap();
    x1.value_mut().set(b"a");
    x1.store().unwrap();
    t1.commit().unwrap();

    let mut x2 = t2.exchange("main", "t1").unwrap();
    x2.key_mut().append_i64(5).unwrap();
    x2.value_mut().set(b"b");
    match x2.store() {
        Err(Error::Conflict(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    // the transaction is poisoned, commit rolls back.
    match t2.commit() {
        Err(Error::Rollback(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    // a later snapshot sees t1's value.
    let reader = engine.session();
    let mut rx = reader.exchange("main", "t1").unwrap();
    rx.key_mut().append_i64(5).unwrap();
    assert!(rx.fetch().unwrap());
    assert_eq!(rx.value().as_bytes(), b"a");
    engine.close().unwrap();
}

#[test]
fn test_rollback_discards_writes() {
    let engine = open_engine("rollback");
    let session = engine.session();

    session.begin().unwrap();
    let mut ex = session.exchange("main", "t1").unwrap();
    for i in 0..50 {
        ex.clear();
        ex.key_mut().append_i64(i).unwrap();
        ex.value_mut().set(b"doomed");
        ex.store().unwrap();
    }
    session.rollback().unwrap();

    let mut ex = session.exchange("main", "t1").unwrap();
    for i in 0..50 {
        ex.clear();
        ex.key_mut().append_i64(i).unwrap();
        assert!(!ex.fetch().unwrap(), "key {}", i);
    }
    // traversal skips the aborted versions too.
    ex.to_before();
    assert!(!ex.next().unwrap());
    engine.close().unwrap();
}

#[test]
fn test_remove_tombstone_in_txn() {
    let engine = open_engine("tombstone");
    let session = engine.session();
    let reader = engine.session();

    let mut ex = session.exchange("main", "t1").unwrap();
    ex.key_mut().append_i64(1).unwrap();
    ex.value_mut().set(b"v");
    ex.store().unwrap();

    reader.begin().unwrap();
    let mut rx = reader.exchange("main", "t1").unwrap();
    rx.key_mut().append_i64(1).unwrap();
    assert!(rx.fetch().unwrap());

    session.begin().unwrap();
    let mut ex = session.exchange("main", "t1").unwrap();
    ex.key_mut().append_i64(1).unwrap();
    assert!(ex.remove().unwrap());
    // removed within the transaction.
    assert!(!ex.fetch().unwrap());
    session.commit().unwrap();

    // the old snapshot still reads through the tombstone.
    assert!(rx.fetch().unwrap());
    assert_eq!(rx.value().as_bytes(), b"v");
    reader.commit().unwrap();

    // new snapshots find nothing.
    assert!(!rx.fetch().unwrap());
    engine.close().unwrap();
}

#[test]
fn test_traverse_next_previous() {
    let engine = open_engine("traverse");
    let session = engine.session();
    let mut ex = session.exchange("main", "t1").unwrap();

    for i in [5_i64, 1, 9, 3, 7].iter() {
        ex.clear();
        ex.key_mut().append_i64(*i).unwrap();
        ex.value_mut().set(format!("v{}", i).as_bytes());
        ex.store().unwrap();
    }

    ex.to_before();
    let mut seen = vec![];
    while ex.next().unwrap() {
        match ex.key().to_segment(0).unwrap() {
            crate::key::Segment::Integer(i) => seen.push(i),
            seg => panic!("unexpected {:?}", seg),
        }
    }
    assert_eq!(seen, vec![1, 3, 5, 7, 9]);

    ex.to_after();
    let mut seen = vec![];
    while ex.previous().unwrap() {
        match ex.key().to_segment(0).unwrap() {
            crate::key::Segment::Integer(i) => seen.push(i),
            seg => panic!("unexpected {:?}", seg),
        }
    }
    assert_eq!(seen, vec![9, 7, 5, 3, 1]);
    engine.close().unwrap();
}

#[test]
fn test_traverse_with_filter() {
    let engine = open_engine("filter");
    let session = engine.session();
    let mut ex = session.exchange("main", "t1").unwrap();

    for i in 0..100_i64 {
        ex.clear();
        ex.key_mut().append_i64(i).unwrap();
        ex.value_mut().set(b"v");
        ex.store().unwrap();
    }

    let filter = crate::key::KeyFilter::parse("{[20:29]}").unwrap();
    ex.to_before();
    let mut seen = vec![];
    while ex.traverse(Direction::Forward, Some(&filter)).unwrap() {
        match ex.key().to_segment(0).unwrap() {
            crate::key::Segment::Integer(i) => seen.push(i),
            seg => panic!("unexpected {:?}", seg),
        }
    }
    assert_eq!(seen, (20..=29).collect::<Vec<i64>>());
    engine.close().unwrap();
}

#[test]
fn test_remove_range_txn() {
    let engine = open_engine("range-txn");
    let session = engine.session();
    let mut ex = session.exchange("main", "t1").unwrap();

    for i in 0..40_i64 {
        ex.clear();
        ex.key_mut().append_i64(i).unwrap();
        ex.value_mut().set(b"v");
        ex.store().unwrap();
    }

    session.begin().unwrap();
    let mut ex = session.exchange("main", "t1").unwrap();
    let mut low = crate::key::Key::new();
    low.append_i64(10).unwrap();
    let mut high = crate::key::Key::new();
    high.append_i64(19).unwrap();
    assert_eq!(ex.remove_range(&low, &high).unwrap(), 10);

    // inside the transaction the range is gone.
    ex.clear();
    ex.key_mut().append_i64(15).unwrap();
    assert!(!ex.fetch().unwrap());
    session.commit().unwrap();

    // and stays gone after commit.
    ex.to_before();
    let mut count = 0;
    while ex.next().unwrap() {
        count += 1;
    }
    assert_eq!(count, 30);
    engine.close().unwrap();
}

#[test]
fn test_nested_txn_scopes() {
    let engine = open_engine("nested");
    let session = engine.session();

    session.begin().unwrap();
    session.begin().unwrap(); // nested
    let mut ex = session.exchange("main", "t1").unwrap();
    ex.key_mut().append_i64(1).unwrap();
    ex.value_mut().set(b"v");
    ex.store().unwrap();
    session.commit().unwrap(); // inner, defers
    assert!(session.is_active());
    session.commit().unwrap(); // outer, commits
    assert!(!session.is_active());

    let mut ex = session.exchange("main", "t1").unwrap();
    ex.key_mut().append_i64(1).unwrap();
    assert!(ex.fetch().unwrap());
    engine.close().unwrap();
}

#[test]
fn test_split_policy_plumbing() {
    let engine = open_engine("policy");
    let session = engine.session();
    let mut ex = session.exchange("main", "t1").unwrap();
    ex.set_split_policy(crate::page::SplitPolicy::RightBias);

    // ascending inserts under right-bias still build a valid tree.
    for i in 0..300_i64 {
        ex.clear();
        ex.key_mut().append_i64(i).unwrap();
        ex.value_mut().set(&vec![0x11; 16]);
        ex.store().unwrap();
    }
    assert!(engine.integrity_check("main", "t1").unwrap().is_empty());
    engine.close().unwrap();
}
