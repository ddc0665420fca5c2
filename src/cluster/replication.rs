//! The follower replication pipeline.
//!
//! Each inbound BEGIN_TRANSACTION, COMMIT_TRANSACTION, or
//! ROLLBACK_TRANSACTION spawns a short-lived worker thread. COMMIT and
//! ROLLBACK workers just record the verdict hash and wake everybody up. A
//! BEGIN worker waits until the database is exactly one commit behind its
//! transaction, prepares it, votes APPROVE or DENY back to the leader, and
//! then parks until some other worker delivers its COMMIT or ROLLBACK
//! verdict. Because a parked BEGIN worker can only be released by another
//! worker, the pipeline needs at least two concurrent workers; running it
//! single-threaded deadlocks.
//!
//! Ordering: a BEGIN worker only prepares when `new_count == commit_count
//! + 1`, and the commit count only advances at that transaction's COMMIT,
//! so transactions apply in strict commit-index order despite the
//! parallelism.

use super::message::{Effect, Message, PeerId, Stamp, TransactionId};
use super::node::Clock;
use super::sync::stage_with_checkpoint_retry;
use crate::engine::{CommitOutcome, Engine};
use crate::error::{Error, Result};

use crossbeam::channel::Sender;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Pending verdicts, keyed by the transaction's new hash. Guarded
/// separately from the pipeline mutex so verdict workers never block on a
/// preparing BEGIN worker.
#[derive(Default)]
struct Verdicts {
    to_commit: HashSet<String>,
    to_rollback: HashSet<String>,
}

#[derive(Default)]
struct PipelineState {
    /// Set when the node leaves FOLLOWING; workers roll back and exit.
    exit: bool,
    /// Live worker count; shutdown waits for it to reach zero.
    workers: usize,
}

struct Shared {
    state: Mutex<PipelineState>,
    cv: Condvar,
    verdicts: parking_lot::Mutex<Verdicts>,
}

/// Everything a worker thread needs, cloned per spawn.
#[derive(Clone)]
struct WorkerContext {
    shared: Arc<Shared>,
    engine: Arc<dyn Engine>,
    effect_tx: Sender<Effect>,
    lead_peer: Arc<parking_lot::Mutex<Option<PeerId>>>,
    permafollower: bool,
    clock: Arc<dyn Clock>,
}

impl WorkerContext {
    /// Wakes all parked workers. Takes the pipeline mutex so a worker
    /// between its condition check and its wait can't miss the signal.
    fn notify(&self) {
        let _state = self.shared.state.lock().expect("pipeline mutex poisoned");
        self.shared.cv.notify_all();
    }
}

/// Decrements the worker count and wakes waiters when a worker exits, by
/// any path.
struct WorkerGuard {
    shared: Arc<Shared>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        match self.shared.state.lock() {
            Ok(mut state) => state.workers -= 1,
            Err(poisoned) => poisoned.into_inner().workers -= 1,
        }
        self.shared.cv.notify_all();
    }
}

/// The follower replication pipeline: spawns and coordinates the workers.
pub struct Pipeline {
    shared: Arc<Shared>,
    engine: Arc<dyn Engine>,
    effect_tx: Sender<Effect>,
    lead_peer: Arc<parking_lot::Mutex<Option<PeerId>>>,
    permafollower: bool,
    clock: Arc<dyn Clock>,
    counter: AtomicU64,
}

impl Pipeline {
    pub fn new(
        engine: Arc<dyn Engine>,
        effect_tx: Sender<Effect>,
        lead_peer: Arc<parking_lot::Mutex<Option<PeerId>>>,
        permafollower: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PipelineState::default()),
                cv: Condvar::new(),
                verdicts: parking_lot::Mutex::new(Verdicts::default()),
            }),
            engine,
            effect_tx,
            lead_peer,
            permafollower,
            clock,
            counter: AtomicU64::new(0),
        }
    }

    /// The number of live workers.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().expect("pipeline mutex poisoned").workers
    }

    /// Spawns a worker for an inbound replication message.
    pub fn spawn(&self, message: Message) -> Result<()> {
        let ctx = WorkerContext {
            shared: self.shared.clone(),
            engine: self.engine.clone(),
            effect_tx: self.effect_tx.clone(),
            lead_peer: self.lead_peer.clone(),
            permafollower: self.permafollower,
            clock: self.clock.clone(),
        };
        self.shared.state.lock().expect("pipeline mutex poisoned").workers += 1;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = std::thread::Builder::new()
            .name(format!("replicate-{n}"))
            .spawn(move || run_worker(ctx, message))
        {
            self.shared.state.lock().expect("pipeline mutex poisoned").workers -= 1;
            self.shared.cv.notify_all();
            return Err(Error::Internal(format!("failed to spawn replication worker: {err}")));
        }
        Ok(())
    }

    /// Signals all workers to exit and waits for them to finish, then
    /// resets the pipeline so FOLLOWING can resume later. Called when the
    /// node leaves FOLLOWING.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().expect("pipeline mutex poisoned");
        state.exit = true;
        self.shared.cv.notify_all();
        while state.workers > 0 {
            state = self.shared.cv.wait(state).expect("pipeline mutex poisoned");
        }
        state.exit = false;
        drop(state);
        // Verdicts for transactions that never completed are meaningless to
        // the next FOLLOWING session.
        let mut verdicts = self.shared.verdicts.lock();
        verdicts.to_commit.clear();
        verdicts.to_rollback.clear();
    }
}

fn run_worker(ctx: WorkerContext, message: Message) {
    let _guard = WorkerGuard { shared: ctx.shared.clone() };
    match message {
        Message::BeginTransaction { id, new_count, new_hash, leader_sent_at, query } => {
            run_begin(&ctx, id, new_count, &new_hash, leader_sent_at, &query)
        }
        Message::CommitTransaction { hash, .. } => {
            ctx.shared.verdicts.lock().to_commit.insert(hash);
            ctx.notify();
        }
        Message::RollbackTransaction { new_hash, .. } => {
            ctx.shared.verdicts.lock().to_rollback.insert(new_hash);
            ctx.notify();
        }
        message => warn!("Replication worker got unexpected {}", message.method()),
    }
}

fn run_begin(
    ctx: &WorkerContext,
    id: TransactionId,
    new_count: u64,
    new_hash: &str,
    leader_sent_at: u64,
    query: &str,
) {
    // Wait for the database to come up to date. Once our condition holds we
    // can release the mutex before touching the database: the condition
    // can't regress, and holding it would block new verdicts from landing.
    {
        let mut state = ctx.shared.state.lock().expect("pipeline mutex poisoned");
        loop {
            if state.exit {
                return;
            }
            if new_count == ctx.engine.commit_count() + 1 {
                break;
            }
            state = ctx.shared.cv.wait(state).expect("pipeline mutex poisoned");
        }
    }

    let begun = match handle_begin(ctx, new_hash, query) {
        Ok(begun) => begun,
        Err(err) => {
            warn!("Replication worker failed to begin transaction #{new_count}: {err}");
            ctx.engine.rollback();
            return;
        }
    };

    // Vote, except on asynchronously streamed transactions (the leader
    // ignores those votes anyway) and except as a permafollower.
    if ctx.permafollower {
        info!("Would approve/deny transaction #{new_count} but a permafollower, keeping quiet");
    } else if !id.is_async() {
        let response = match begun {
            true => Message::ApproveTransaction {
                id,
                new_count: ctx.engine.commit_count() + 1,
                new_hash: ctx
                    .engine
                    .uncommitted_hash()
                    .unwrap_or_else(|| new_hash.to_string()),
            },
            false => Message::DenyTransaction {
                id,
                new_count: ctx.engine.commit_count() + 1,
                new_hash: new_hash.to_string(),
            },
        };
        let lead = *ctx.lead_peer.lock();
        let Some(lead) = lead else {
            warn!("No leader to vote for transaction #{new_count}, giving up");
            ctx.engine.rollback();
            return;
        };
        info!("{} #{new_count} ({new_hash})", response.method());
        let stamp = Stamp {
            commit_count: ctx.engine.commit_count(),
            hash: ctx.engine.committed_hash(),
        };
        let _ = ctx.effect_tx.send(Effect::Send { to: lead, frame: response.to_frame(&stamp) });
    } else {
        info!("Skipping vote for async transaction #{new_count}");
    }
    info!(
        "Replicated transaction #{new_count}, transit time {}ms, awaiting verdict",
        ctx.clock.now().saturating_sub(leader_sent_at) / 1000
    );

    // Wait for some worker to deliver our COMMIT or ROLLBACK verdict.
    let commit;
    {
        let mut state = ctx.shared.state.lock().expect("pipeline mutex poisoned");
        loop {
            if state.exit {
                ctx.engine.rollback();
                return;
            }
            let (can_commit, can_rollback) = {
                let verdicts = ctx.shared.verdicts.lock();
                (verdicts.to_commit.contains(new_hash), verdicts.to_rollback.contains(new_hash))
            };
            if can_commit || can_rollback {
                commit = can_commit;
                break;
            }
            state = ctx.shared.cv.wait(state).expect("pipeline mutex poisoned");
        }
    }

    let result = if commit {
        handle_commit(ctx, new_count, new_hash)
    } else {
        handle_rollback(ctx);
        Ok(())
    };
    {
        let mut verdicts = ctx.shared.verdicts.lock();
        if commit {
            verdicts.to_commit.remove(new_hash);
        } else {
            verdicts.to_rollback.remove(new_hash);
        }
    }
    // The database moved (or this transaction died); let waiting workers
    // re-check their conditions.
    ctx.notify();
    if let Err(err) = result {
        warn!("Replication worker failed transaction #{new_count}: {err}");
        ctx.engine.rollback();
    }
}

/// Begins and prepares the replicated transaction, returning whether to
/// approve. Preconditions (like a transaction already open) error out and
/// kill the worker instead.
fn handle_begin(ctx: &WorkerContext, new_hash: &str, query: &str) -> Result<bool> {
    if ctx.engine.uncommitted_hash().is_some() {
        return Err(Error::Internal("already in a transaction".into()));
    }
    if let Err(err) = stage_with_checkpoint_retry(ctx.engine.as_ref(), query) {
        warn!("Failed to write replicated transaction: {err}");
        return Ok(false);
    }
    match ctx.engine.uncommitted_hash() {
        Some(hash) if hash == new_hash => Ok(true),
        hash => {
            warn!(
                "New hash mismatch: leader sent {new_hash}, we computed {}",
                hash.as_deref().unwrap_or("")
            );
            ctx.engine.rollback();
            Ok(false)
        }
    }
}

fn handle_commit(ctx: &WorkerContext, new_count: u64, new_hash: &str) -> Result<()> {
    let uncommitted = ctx
        .engine
        .uncommitted_hash()
        .ok_or_else(|| Error::Protocol("no outstanding transaction".into()))?;
    if new_count != ctx.engine.commit_count() + 1 {
        return Err(Error::Protocol(format!(
            "commit count mismatch: expected {new_count}, would be {}",
            ctx.engine.commit_count() + 1
        )));
    }
    if uncommitted != new_hash {
        return Err(Error::Protocol(format!("hash mismatch: {new_hash} != {uncommitted}")));
    }
    match ctx.engine.commit()? {
        CommitOutcome::Committed => {}
        CommitOutcome::Conflict => {
            return Err(Error::Internal("conflict committing replicated transaction".into()));
        }
    }
    // Following, so these are never ours to broadcast; drop them.
    ctx.engine.committed_transactions();
    let timing = ctx.engine.last_transaction_timing();
    info!(
        "Committed follower transaction #{new_count} ({new_hash}) in {}ms",
        timing.total_us / 1000
    );
    Ok(())
}

fn handle_rollback(ctx: &WorkerContext) {
    if ctx.engine.uncommitted_hash().is_none() {
        info!("Received ROLLBACK_TRANSACTION with no outstanding transaction");
    }
    ctx.engine.rollback();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::WallClock;
    use crate::engine::Memory;
    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, f: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    struct Fixture {
        pipeline: Pipeline,
        engine: Arc<Memory>,
        effects: Receiver<Effect>,
        /// The (index, hash, query) chain the leader would produce.
        chain: Vec<(u64, String, String)>,
    }

    fn fixture(commits: u64) -> Fixture {
        // Precompute the hash chain a leader would generate.
        let scratch = Memory::new();
        let mut chain = Vec::new();
        for i in 1..=commits {
            let query = format!("INSERT INTO t VALUES ({i})");
            scratch.apply(&query).unwrap();
            chain.push((i, scratch.committed_hash(), query));
        }

        let engine = Arc::new(Memory::new());
        let (tx, effects) = crossbeam::channel::unbounded();
        let lead_peer = Arc::new(parking_lot::Mutex::new(Some(0 as PeerId)));
        let pipeline =
            Pipeline::new(engine.clone(), tx, lead_peer, false, Arc::new(WallClock));
        Fixture { pipeline, engine, effects, chain }
    }

    fn begin(chain: &[(u64, String, String)], index: u64) -> Message {
        let (i, hash, query) = &chain[index as usize - 1];
        Message::BeginTransaction {
            id: TransactionId::Quorum(*i),
            new_count: *i,
            new_hash: hash.clone(),
            leader_sent_at: 0,
            query: query.clone(),
        }
    }

    fn commit(chain: &[(u64, String, String)], index: u64) -> Message {
        let (i, hash, _) = &chain[index as usize - 1];
        Message::CommitTransaction {
            id: TransactionId::Quorum(*i),
            commit_count: *i,
            hash: hash.clone(),
        }
    }

    #[test]
    fn applies_in_order_despite_out_of_order_arrival() {
        let f = fixture(2);

        // Transaction 2 arrives first and parks; transaction 1 prepares and
        // votes.
        f.pipeline.spawn(begin(&f.chain, 2)).unwrap();
        f.pipeline.spawn(begin(&f.chain, 1)).unwrap();
        wait_until("approve of #1", || {
            f.effects
                .try_iter()
                .any(|e| matches!(e, Effect::Send { frame, .. }
                    if frame.method == "APPROVE_TRANSACTION" && frame.headers.get("ID") == Some("1")))
        });

        // Committing 1 unblocks 2.
        f.pipeline.spawn(commit(&f.chain, 1)).unwrap();
        wait_until("commit of #1", || f.engine.commit_count() == 1);
        wait_until("approve of #2", || {
            f.effects
                .try_iter()
                .any(|e| matches!(e, Effect::Send { frame, .. }
                    if frame.method == "APPROVE_TRANSACTION" && frame.headers.get("ID") == Some("2")))
        });
        f.pipeline.spawn(commit(&f.chain, 2)).unwrap();
        wait_until("commit of #2", || f.engine.commit_count() == 2);

        assert_eq!(f.engine.committed_hash(), f.chain[1].1);
        wait_until("workers to drain", || f.pipeline.worker_count() == 0);
    }

    #[test]
    fn rollback_discards_prepared_transaction() {
        let f = fixture(1);
        f.pipeline.spawn(begin(&f.chain, 1)).unwrap();
        wait_until("approve of #1", || {
            f.effects
                .try_iter()
                .any(|e| matches!(e, Effect::Send { frame, .. } if frame.method == "APPROVE_TRANSACTION"))
        });
        f.pipeline.spawn(Message::RollbackTransaction {
            id: TransactionId::Quorum(1),
            new_hash: f.chain[0].1.clone(),
        })
        .unwrap();
        wait_until("workers to drain", || f.pipeline.worker_count() == 0);
        assert_eq!(f.engine.commit_count(), 0);
        assert_eq!(f.engine.uncommitted_hash(), None);
    }

    #[test]
    fn hash_mismatch_denies() {
        let f = fixture(1);
        f.pipeline
            .spawn(Message::BeginTransaction {
                id: TransactionId::Quorum(1),
                new_count: 1,
                new_hash: "BOGUS".into(),
                leader_sent_at: 0,
                query: f.chain[0].2.clone(),
            })
            .unwrap();
        wait_until("deny of #1", || {
            f.effects
                .try_iter()
                .any(|e| matches!(e, Effect::Send { frame, .. }
                    if frame.method == "DENY_TRANSACTION" && frame.headers.get("NewHash") == Some("BOGUS")))
        });
        assert_eq!(f.engine.uncommitted_hash(), None);

        // The leader rolls the transaction back; the worker exits.
        f.pipeline
            .spawn(Message::RollbackTransaction {
                id: TransactionId::Quorum(1),
                new_hash: "BOGUS".into(),
            })
            .unwrap();
        wait_until("workers to drain", || f.pipeline.worker_count() == 0);
        assert_eq!(f.engine.commit_count(), 0);
    }

    #[test]
    fn async_transactions_are_not_voted_on() {
        let f = fixture(1);
        f.pipeline
            .spawn(Message::BeginTransaction {
                id: TransactionId::Async(1),
                new_count: 1,
                new_hash: f.chain[0].1.clone(),
                leader_sent_at: 0,
                query: f.chain[0].2.clone(),
            })
            .unwrap();
        f.pipeline.spawn(commit(&f.chain, 1)).unwrap();
        wait_until("commit of #1", || f.engine.commit_count() == 1);
        assert!(!f
            .effects
            .try_iter()
            .any(|e| matches!(e, Effect::Send { frame, .. }
                if frame.method == "APPROVE_TRANSACTION" || frame.method == "DENY_TRANSACTION")));
    }

    #[test]
    fn shutdown_waits_for_workers_and_resets() {
        let f = fixture(2);
        // A transaction far in the future parks its worker indefinitely.
        f.pipeline.spawn(begin(&f.chain, 2)).unwrap();
        wait_until("worker to start", || f.pipeline.worker_count() == 1);

        f.pipeline.shutdown();
        assert_eq!(f.pipeline.worker_count(), 0);
        assert_eq!(f.engine.uncommitted_hash(), None);

        // The pipeline is reusable after shutdown.
        f.pipeline.spawn(begin(&f.chain, 1)).unwrap();
        f.pipeline.spawn(commit(&f.chain, 1)).unwrap();
        wait_until("commit of #1", || f.engine.commit_count() == 1);
        wait_until("workers to drain", || f.pipeline.worker_count() == 0);
    }
}
