use super::*;

use crate::mvv::Visibility;

#[test]
fn test_timestamps_monotonic() {
    let txns = Txns::new(100, vec![], vec![]);
    assert_eq!(txns.current_ts(), 100);
    let a = txns.next_ts();
    let b = txns.next_ts();
    assert_eq!((a, b), (101, 102));
    assert_eq!(txns.current_ts(), 102);
}

#[test]
fn test_resolve_states() {
    let txns = Txns::new(1000, vec![(10, 20), (30, 40)], vec![50]);

    assert_eq!(txns.resolve(10), Visibility::Committed(20));
    assert_eq!(txns.resolve(30), Visibility::Committed(40));
    assert_eq!(txns.resolve(50), Visibility::Aborted);
    // pruned history resolves as committed at its start.
    assert_eq!(txns.resolve(7), Visibility::Committed(7));

    let start = txns.begin();
    assert_eq!(txns.resolve(start), Visibility::Active);
    txns.mark_committed(start, start + 5);
    assert_eq!(txns.resolve(start), Visibility::Committed(start + 5));

    let start = txns.begin();
    txns.mark_aborted(start);
    assert_eq!(txns.resolve(start), Visibility::Aborted);
}

#[test]
fn test_horizon_and_checkpoint_ts() {
    let txns = Txns::new(0, vec![], vec![]);

    // no actives, the horizon rides the allocator.
    txns.next_ts();
    txns.next_ts();
    assert_eq!(txns.horizon(), 2);
    assert_eq!(txns.checkpoint_ts(), 3);

    let t1 = txns.begin();
    let t2 = txns.begin();
    assert_eq!(txns.oldest_active(), Some(t1));
    assert_eq!(txns.horizon(), t1 - 1);
    // the checkpoint never advances past the oldest active start.
    assert_eq!(txns.checkpoint_ts(), t1 - 1);

    txns.mark_committed(t1, txns.next_ts());
    assert_eq!(txns.oldest_active(), Some(t2));
    txns.mark_aborted(t2);
    assert_eq!(txns.oldest_active(), None);
}

#[test]
fn test_txn_map_snapshot() {
    let txns = Txns::new(0, vec![(1, 2)], vec![3]);
    let t = txns.begin();

    let tm = txns.to_txn_map();
    assert_eq!(tm.entries.len(), 3);
    assert!(tm
        .entries
        .iter()
        .any(|e| e.start_ts == 1 && e.commit_ts == 2 && !e.aborted));
    assert!(tm.entries.iter().any(|e| e.start_ts == 3 && e.aborted));
    assert!(tm
        .entries
        .iter()
        .any(|e| e.start_ts == t && e.commit_ts == 0 && !e.aborted));
}

#[test]
fn test_prune_history() {
    let txns = Txns::new(0, vec![], vec![]);

    let t1 = txns.begin();
    txns.mark_committed(t1, txns.next_ts());
    let t2 = txns.begin(); // live snapshot pins history
    let t3 = txns.begin();
    txns.mark_committed(t3, txns.next_ts());

    txns.prune_history();
    // t1 committed below t2's snapshot, prunable; t3 is not.
    assert_eq!(txns.resolve(t1), Visibility::Committed(t1));
    assert_eq!(txns.resolve(t3), Visibility::Committed(t3 + 1));

    txns.mark_committed(t2, txns.next_ts());
    txns.prune_history();
    // with no live snapshot everything below the allocator goes.
    assert_eq!(txns.resolve(t3), Visibility::Committed(t3));
}

#[test]
fn test_autocommit() {
    let txns = Txns::new(0, vec![], vec![]);
    let ts = txns.next_ts();
    txns.autocommit(ts);
    assert_eq!(txns.resolve(ts), Visibility::Committed(ts));
}
