//! Journal daemons, the background threads tied to an engine instance.
//!
//! * **flusher**, periodically forces the journal tail to disk and
//!   services synchronous flush requests; hard-durability commits group
//!   behind its channel.
//! * **copier**, drains dirty pages from the buffer pool into their
//!   volume files and advances the journal base address.
//! * **page writer**, the eviction assistant, an extra write-back sweep
//!   so that session threads rarely evict dirty frames themselves.
//! * **checkpointer**, periodically writes the CU/PM/TM record group.
//!
//! Each daemon runs the gen-server main loop from [util::thread] and
//! exits when its engine drops the channel. Transient I/O failures are
//! retried with backoff; a journal write failure fences the instance
//! and the daemon parks until shutdown.

use std::{sync::Arc, thread, time::Duration};

use crate::{
    journal::Journal,
    pool::Pool,
    txn::Txns,
    util::thread::{recv_tick, Rx, Thread},
    Error, Result,
};

// transient-failure backoff, doubles upto this many cycles.
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Handle bundling the four daemons, engine-owned.
pub struct Daemons {
    pub flusher: Thread<(), (), Result<()>>,
    pub copier: Option<Thread<(), (), Result<()>>>,
    pub page_writer: Thread<(), (), Result<()>>,
    pub checkpointer: Thread<(), (), Result<()>>,
}

impl Daemons {
    /// Start the daemons for `journal`/`pool`/`txns`. The copier is not
    /// started in append-only mode.
    pub fn start(journal: Arc<Journal>, pool: Arc<Pool>, txns: Arc<Txns>) -> Daemons {
        let append_only = journal.config().append_only;

        let flusher = {
            let journal = Arc::clone(&journal);
            let interval = journal.config().flush_interval;
            Thread::new("flusher", move |rx| move || flusher_loop(journal, interval, rx))
        };
        let copier = match append_only {
            true => None,
            false => {
                let (journal, pool) = (Arc::clone(&journal), Arc::clone(&pool));
                let interval = journal.config().copy_interval;
                Some(Thread::new("copier", move |rx| {
                    move || copier_loop(journal, pool, interval, rx)
                }))
            }
        };
        let page_writer = {
            let pool = Arc::clone(&pool);
            let interval = journal.config().copy_interval / 2;
            Thread::new("page-writer", move |rx| {
                move || page_writer_loop(pool, interval, rx)
            })
        };
        let checkpointer = {
            let interval = journal.config().checkpoint_interval;
            Thread::new("checkpointer", move |rx| {
                move || checkpointer_loop(journal, pool, txns, interval, rx)
            })
        };

        Daemons {
            flusher,
            copier,
            page_writer,
            checkpointer,
        }
    }

    pub fn close(self) -> Result<()> {
        self.flusher.join()??;
        if let Some(copier) = self.copier {
            copier.join()??;
        }
        self.page_writer.join()??;
        self.checkpointer.join()??;
        Ok(())
    }
}

fn backoff(failures: &mut u32, err: Error) {
    log::error!(target: "journal", "daemon cycle failed {}", err);
    let shift = std::cmp::min(*failures, MAX_BACKOFF_SHIFT);
    thread::sleep(Duration::from_millis(10_u64 << shift));
    *failures += 1;
}

fn flusher_loop(journal: Arc<Journal>, interval: Duration, rx: Rx<(), ()>) -> Result<()> {
    let mut failures = 0;
    loop {
        match recv_tick(&rx, interval) {
            Ok(Some((_, resp))) => {
                // group commit, batch every waiter queued behind this
                // request into a single sync.
                let mut waiters = vec![resp];
                while let Ok((_, resp)) = rx.try_recv() {
                    waiters.push(resp);
                }
                match journal.flush() {
                    Ok(()) => {
                        failures = 0;
                        for resp in waiters.into_iter().flatten() {
                            resp.send(()).ok();
                        }
                    }
                    Err(err) if journal.is_fenced() => break Err(err),
                    Err(err) => backoff(&mut failures, err),
                }
            }
            Ok(None) => match journal.flush() {
                Ok(()) => failures = 0,
                Err(err) if journal.is_fenced() => break Err(err),
                Err(err) => backoff(&mut failures, err),
            },
            Err(_) => break journal.flush(), // disconnected, final sync
        }
    }
}

fn copier_loop(
    journal: Arc<Journal>,
    pool: Arc<Pool>,
    interval: Duration,
    rx: Rx<(), ()>,
) -> Result<()> {
    let mut failures = 0;
    loop {
        let cycle = || -> Result<()> {
            pool.write_back_dirty(None)?;
            journal.advance_base()?;
            Ok(())
        };
        match recv_tick(&rx, interval) {
            Ok(msg) => match cycle() {
                Ok(()) => {
                    failures = 0;
                    if let Some((_, Some(resp))) = msg {
                        resp.send(()).ok();
                    }
                }
                Err(err) if journal.is_fenced() => break Err(err),
                Err(err) => backoff(&mut failures, err),
            },
            Err(_) => {
                // disconnected, drain the pool one last time.
                break cycle();
            }
        }
    }
}

fn page_writer_loop(pool: Arc<Pool>, interval: Duration, rx: Rx<(), ()>) -> Result<()> {
    let mut failures = 0;
    loop {
        match recv_tick(&rx, interval) {
            Ok(_) => match pool.write_back_dirty(None) {
                Ok(_) => failures = 0,
                Err(err) => backoff(&mut failures, err),
            },
            Err(_) => break Ok(()),
        }
    }
}

fn checkpointer_loop(
    journal: Arc<Journal>,
    pool: Arc<Pool>,
    txns: Arc<Txns>,
    interval: Duration,
    rx: Rx<(), ()>,
) -> Result<()> {
    let mut failures = 0;
    loop {
        match recv_tick(&rx, interval) {
            Ok(msg) => match run_checkpoint(&journal, &pool, &txns) {
                Ok(_) => {
                    failures = 0;
                    if let Some((_, Some(resp))) = msg {
                        resp.send(()).ok();
                    }
                }
                Err(err) if journal.is_fenced() => break Err(err),
                Err(err) => backoff(&mut failures, err),
            },
            Err(_) => break Ok(()),
        }
    }
}

/// Write one checkpoint, the CU/PM/TM group, then flush and advance the
/// base. Returns the checkpoint timestamp.
pub fn run_checkpoint(journal: &Journal, pool: &Pool, txns: &Txns) -> Result<u64> {
    let checkpoint_ts = {
        // quiesce commits so that the TM snapshot and the record group
        // are consistent.
        let _quiesce = txns.quiesce_commits()?;
        let checkpoint_ts = txns.checkpoint_ts();
        let tm = txns.to_txn_map();
        journal.append_checkpoint(checkpoint_ts, txns.current_ts(), tm)?;
        checkpoint_ts
    };
    journal.flush()?;

    // push dirty pages below the checkpoint out, then let go of the
    // journal bytes nothing references anymore.
    pool.write_back_dirty(Some(checkpoint_ts))?;
    journal.advance_base()?;
    txns.prune_history();

    log::debug!(
        target: "journal",
        "checkpoint at {} base {}", checkpoint_ts, journal.to_base_address()
    );
    Ok(checkpoint_ts)
}
