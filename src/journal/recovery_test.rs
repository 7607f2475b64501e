use std::{env, fs, path::PathBuf, sync::Arc};

use super::*;
use crate::{
    journal::{self, Config, Journal, TxnEntry, TxnMapRec},
    page::{Page, PageType},
    vol::{VolumeSet, VolumeSpec},
};

const PAGE_SIZE: usize = 1024;

fn scratch(name: &str) -> PathBuf {
    let mut dir = env::temp_dir();
    dir.push(format!("mvbt-recovery-{}-{}", name, rand::random::<u64>()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn open_volumes(dir: &PathBuf) -> Arc<VolumeSet> {
    let loc = dir.join("main.mvbt");
    let specs = vec![VolumeSpec::new(loc.as_os_str())
        .set_create(true)
        .set_page_size(PAGE_SIZE)];
    Arc::new(VolumeSet::open(specs).unwrap())
}

fn config(dir: &PathBuf) -> Config {
    let mut config = journal::Config::new(dir.as_os_str(), "test");
    config.set_segment_size(64 * 1024);
    config
}

#[test]
fn test_recover_empty() {
    let dir = scratch("empty");
    let volumes = open_volumes(&dir);
    let recovered = recover(config(&dir), &volumes).unwrap();
    assert_eq!(recovered.committed.len(), 0);
    assert_eq!(recovered.aborted.len(), 0);
    assert_eq!(recovered.last_ts, 0);
    assert_eq!(recovered.applied_pages, 0);
    recovered.journal.close().unwrap();
    volumes.close().unwrap();
}

#[test]
fn test_recover_txn_state() {
    let dir = scratch("txns");
    let volumes = open_volumes(&dir);
    {
        let journal = Journal::start(config(&dir), 0, 0).unwrap();
        journal.append_txn_start(10).unwrap();
        journal.append_txn_commit(10, 12).unwrap();
        journal.append_txn_start(20).unwrap();
        journal.append_txn_rollback(20).unwrap();
        journal.append_txn_start(30).unwrap(); // in flight at crash
        journal.flush().unwrap();
    }

    let recovered = recover(config(&dir), &volumes).unwrap();
    assert!(recovered.committed.contains(&(10, 12)));
    assert!(recovered.aborted.contains(&20));
    // crashed in flight means aborted.
    assert!(recovered.aborted.contains(&30));
    assert_eq!(recovered.last_ts, 30);
    recovered.journal.close().unwrap();
    volumes.close().unwrap();
}

#[test]
fn test_recover_applies_page_images() {
    let dir = scratch("pages");
    let volumes = open_volumes(&dir);
    {
        // grow the volume to two pages, then journal an image for page 1
        // without ever writing it to the volume file.
        let vol = volumes.by_name("main").unwrap();
        let (_, mut head_page) = vol
            .with_head(|head| {
                head.next_page = 2;
                Ok(())
            })
            .unwrap();

        let journal = Journal::start(config(&dir), 0, 0).unwrap();
        head_page.set_generation(1);
        journal.append_page_image(1, &head_page).unwrap();

        let mut page = Page::new(PAGE_SIZE, PageType::Data, 1, 1);
        page.set_generation(2);
        journal.append_page_image(1, &page).unwrap();

        // a second, newer image of the same page wins.
        let mut page = Page::new(PAGE_SIZE, PageType::Data, 1, 1);
        page.set_generation(3);
        page.set_right_sibling(0xBEEF);
        journal.append_page_image(1, &page).unwrap();
        journal.flush().unwrap();
    }

    let recovered = recover(config(&dir), &volumes).unwrap();
    assert_eq!(recovered.applied_pages, 3);

    let vol = volumes.by_name("main").unwrap();
    assert_eq!(vol.to_page_count(), 2);
    let page = vol.read_page(1).unwrap();
    assert_eq!(page.to_generation(), 3);
    assert_eq!(page.to_right_sibling(), 0xBEEF);
    recovered.journal.close().unwrap();
    volumes.close().unwrap();
}

#[test]
fn test_recover_from_checkpoint() {
    let dir = scratch("checkpoint");
    let volumes = open_volumes(&dir);
    {
        let journal = Journal::start(config(&dir), 0, 0).unwrap();
        journal.append_txn_start(5).unwrap();
        journal.append_txn_commit(5, 6).unwrap();
        let tm = TxnMapRec {
            entries: vec![
                TxnEntry {
                    start_ts: 5,
                    commit_ts: 6,
                    aborted: false,
                },
                TxnEntry {
                    start_ts: 7,
                    commit_ts: 0,
                    aborted: true,
                },
            ],
        };
        journal.append_checkpoint(50, 55, tm).unwrap();
        // post-checkpoint records replay on top of the TM.
        journal.append_txn_start(60).unwrap();
        journal.append_txn_commit(60, 61).unwrap();
        journal.flush().unwrap();
    }

    let recovered = recover(config(&dir), &volumes).unwrap();
    assert!(recovered.committed.contains(&(5, 6)));
    assert!(recovered.committed.contains(&(60, 61)));
    assert!(recovered.aborted.contains(&7));
    // allocator restarts above the checkpoint high-water mark.
    assert!(recovered.last_ts >= 61);
    recovered.journal.close().unwrap();
    volumes.close().unwrap();
}

#[test]
fn test_recover_truncates_torn_tail() {
    let dir = scratch("torn");
    let volumes = open_volumes(&dir);
    {
        let journal = Journal::start(config(&dir), 0, 0).unwrap();
        journal.append_txn_start(5).unwrap();
        journal.append_txn_commit(5, 6).unwrap();
        journal.flush().unwrap();
    }
    // chop bytes off the segment tail, simulating a torn write.
    let segments = journal::list_segments(&config(&dir)).unwrap();
    let loc = segments.last().unwrap().1.clone();
    let data = fs::read(&loc).unwrap();
    fs::write(&loc, &data[..data.len() - 7]).unwrap();

    let recovered = recover(config(&dir), &volumes).unwrap();
    // the commit record was torn, the transaction aborts.
    assert!(recovered.committed.is_empty());
    assert!(recovered.aborted.contains(&5));
    recovered.journal.close().unwrap();
    volumes.close().unwrap();
}

#[test]
fn test_recover_starts_fresh_segment() {
    let dir = scratch("fresh");
    let volumes = open_volumes(&dir);
    {
        let journal = Journal::start(config(&dir), 0, 0).unwrap();
        journal.append_txn_start(1).unwrap();
        journal.flush().unwrap();
    }
    let recovered = recover(config(&dir), &volumes).unwrap();
    recovered.journal.append_txn_start(2).unwrap();
    recovered.journal.flush().unwrap();

    let segments = journal::list_segments(&config(&dir)).unwrap();
    assert_eq!(segments.len(), 2);
    recovered.journal.close().unwrap();
    volumes.close().unwrap();
}
