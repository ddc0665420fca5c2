//! The embedded SQL engine interface consumed by the cluster core, plus a
//! hash-chained in-memory implementation used by tests and embedders that
//! want a stub.
//!
//! The engine owns the authoritative commit log: for every index up to the
//! local commit count, `get_commit(i)` returns the same `(hash, query)`
//! pair forever. Hashes chain: each commit's hash is deterministic over its
//! query and the previous hash, so agreeing on `(commit_count, hash)` means
//! agreeing on the whole history.

use crate::error::{Error, Result};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// The outcome of committing a prepared transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The transaction committed and the log advanced by one.
    Committed,
    /// The transaction conflicted with a concurrent write and must be
    /// rolled back by the caller.
    Conflict,
}

/// Wall-clock timings of the last completed transaction, in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransactionTiming {
    pub begin_us: u64,
    pub write_us: u64,
    pub prepare_us: u64,
    pub commit_us: u64,
    pub rollback_us: u64,
    pub total_us: u64,
}

/// The engine's global commit lock. The leader holds it for the entire
/// window from broadcasting BEGIN_TRANSACTION to resolving COMMIT or
/// ROLLBACK, which spans multiple update ticks, so the lock is manually
/// locked and unlocked rather than scoped to a guard.
pub struct CommitLock {
    raw: parking_lot::RawMutex,
}

impl CommitLock {
    pub fn new() -> Self {
        Self { raw: parking_lot::RawMutex::INIT }
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) {
        self.raw.lock();
    }

    /// Acquires the lock if it is free, returning whether it was acquired.
    pub fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    /// Releases the lock. The caller must currently hold it.
    pub fn unlock(&self) {
        unsafe { self.raw.unlock() }
    }
}

impl Default for CommitLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommitLock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommitLock").finish_non_exhaustive()
    }
}

/// The embedded SQL engine, as seen by the cluster core. Implementations
/// must be shareable across the sync thread and the replication workers.
pub trait Engine: Send + Sync {
    /// The number of committed transactions (the last commit index).
    fn commit_count(&self) -> u64;
    /// The hash of the last committed transaction, or empty if none.
    fn committed_hash(&self) -> String;
    /// The hash of the prepared-but-uncommitted transaction, if any.
    fn uncommitted_hash(&self) -> Option<String>;
    /// The query text of the uncommitted transaction, or empty.
    fn uncommitted_query(&self) -> String;

    /// Begins a transaction. Fails with Error::Checkpoint if a checkpoint
    /// must complete first; callers wait_for_checkpoint() and retry.
    fn begin(&self) -> Result<()>;
    /// Appends query text to the open transaction without rewriting it.
    fn write_unmodified(&self, query: &str) -> Result<()>;
    /// Prepares the open transaction, computing its uncommitted hash.
    fn prepare(&self) -> Result<()>;
    /// Commits the prepared transaction. A Conflict outcome leaves the
    /// transaction open; the caller must roll it back.
    fn commit(&self) -> Result<CommitOutcome>;
    /// Rolls back any open transaction. A no-op if there is none.
    fn rollback(&self);

    /// Fetches the `(hash, query)` of a historical commit by index.
    fn get_commit(&self, index: u64) -> Result<Option<(String, String)>>;
    /// Fetches the `(hash, query)` pairs for an inclusive index range.
    fn get_commits(&self, from: u64, to: u64) -> Result<Vec<(String, String)>>;
    /// Drains the queue of locally committed transactions that have not yet
    /// been broadcast, as `(index, query, hash)`.
    fn committed_transactions(&self) -> Vec<(u64, String, String)>;

    /// Blocks until any pending checkpoint completes.
    fn wait_for_checkpoint(&self);
    /// Timings of the last completed transaction.
    fn last_transaction_timing(&self) -> TransactionTiming;
    /// The global commit lock serializing commit windows.
    fn commit_lock(&self) -> &CommitLock;
}

/// Computes the hash of a commit: SHA-256 over the previous hash and the
/// query text, rendered as uppercase hex.
pub fn chain_hash(previous: &str, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(query.as_bytes());
    hex::encode_upper(hasher.finalize())
}

/// An open transaction inside the Memory engine.
#[derive(Debug, Default)]
struct Transaction {
    query: String,
    /// Set by prepare(); the transaction's would-be commit hash.
    hash: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    /// The commit log as (hash, query); index i is commit i + 1.
    log: Vec<(String, String)>,
    txn: Option<Transaction>,
    /// Committed transactions not yet drained, as (index, query, hash).
    unsent: Vec<(u64, String, String)>,
    checkpoint_required: bool,
    conflict_next: bool,
    timing: TransactionTiming,
}

/// A hash-chained in-memory engine. Used by the test suites, and suitable
/// as a stand-in wherever a real SQL engine isn't wired up yet.
#[derive(Debug, Default)]
pub struct Memory {
    inner: Mutex<Inner>,
    commit_lock: CommitLock,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: runs a full begin/write/prepare/commit cycle.
    pub fn apply(&self, query: &str) -> Result<()> {
        self.begin()?;
        self.write_unmodified(query)?;
        self.prepare()?;
        match self.commit()? {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Conflict => {
                self.rollback();
                Err(Error::Abort)
            }
        }
    }

    /// Makes the next begin() fail with Error::Checkpoint, once.
    pub fn require_checkpoint(&self) {
        self.inner.lock().checkpoint_required = true;
    }

    /// Makes the next commit() report a conflict, once.
    pub fn conflict_next_commit(&self) {
        self.inner.lock().conflict_next = true;
    }
}

impl Engine for Memory {
    fn commit_count(&self) -> u64 {
        self.inner.lock().log.len() as u64
    }

    fn committed_hash(&self) -> String {
        self.inner.lock().log.last().map(|(hash, _)| hash.clone()).unwrap_or_default()
    }

    fn uncommitted_hash(&self) -> Option<String> {
        self.inner.lock().txn.as_ref().and_then(|txn| txn.hash.clone())
    }

    fn uncommitted_query(&self) -> String {
        self.inner.lock().txn.as_ref().map(|txn| txn.query.clone()).unwrap_or_default()
    }

    fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.checkpoint_required {
            return Err(Error::Checkpoint);
        }
        if inner.txn.is_some() {
            return Err(Error::Internal("already in a transaction".into()));
        }
        inner.txn = Some(Transaction::default());
        Ok(())
    }

    fn write_unmodified(&self, query: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let txn =
            inner.txn.as_mut().ok_or_else(|| Error::Internal("not in a transaction".into()))?;
        if !txn.query.is_empty() {
            txn.query.push('\n');
        }
        txn.query.push_str(query);
        Ok(())
    }

    fn prepare(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let previous = inner.log.last().map(|(hash, _)| hash.clone()).unwrap_or_default();
        let txn =
            inner.txn.as_mut().ok_or_else(|| Error::Internal("not in a transaction".into()))?;
        txn.hash = Some(chain_hash(&previous, &txn.query));
        Ok(())
    }

    fn commit(&self) -> Result<CommitOutcome> {
        let mut inner = self.inner.lock();
        if inner.conflict_next {
            inner.conflict_next = false;
            return Ok(CommitOutcome::Conflict);
        }
        let txn =
            inner.txn.take().ok_or_else(|| Error::Internal("not in a transaction".into()))?;
        let hash = txn.hash.ok_or_else(|| Error::Internal("transaction not prepared".into()))?;
        inner.log.push((hash.clone(), txn.query.clone()));
        let index = inner.log.len() as u64;
        inner.unsent.push((index, txn.query, hash));
        inner.timing = TransactionTiming { total_us: 1, commit_us: 1, ..Default::default() };
        Ok(CommitOutcome::Committed)
    }

    fn rollback(&self) {
        self.inner.lock().txn = None;
    }

    fn get_commit(&self, index: u64) -> Result<Option<(String, String)>> {
        if index == 0 {
            return Ok(None);
        }
        Ok(self.inner.lock().log.get(index as usize - 1).cloned())
    }

    fn get_commits(&self, from: u64, to: u64) -> Result<Vec<(String, String)>> {
        let inner = self.inner.lock();
        if from == 0 || from > to || to > inner.log.len() as u64 {
            return Err(Error::Internal(format!(
                "commit range {from}-{to} outside log of {}",
                inner.log.len()
            )));
        }
        Ok(inner.log[from as usize - 1..to as usize].to_vec())
    }

    fn committed_transactions(&self) -> Vec<(u64, String, String)> {
        std::mem::take(&mut self.inner.lock().unsent)
    }

    fn wait_for_checkpoint(&self) {
        self.inner.lock().checkpoint_required = false;
    }

    fn last_transaction_timing(&self) -> TransactionTiming {
        self.inner.lock().timing
    }

    fn commit_lock(&self) -> &CommitLock {
        &self.commit_lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hash_chain_is_deterministic() {
        let a = Memory::new();
        let b = Memory::new();
        for engine in [&a, &b] {
            engine.apply("CREATE TABLE t (x INT)").unwrap();
            engine.apply("INSERT INTO t VALUES (1)").unwrap();
        }
        assert_eq!(a.commit_count(), 2);
        assert_eq!(a.committed_hash(), b.committed_hash());
        assert_eq!(a.get_commit(1).unwrap(), b.get_commit(1).unwrap());

        // A divergent history yields a different hash at the same index.
        let c = Memory::new();
        c.apply("CREATE TABLE t (x INT)").unwrap();
        c.apply("INSERT INTO t VALUES (2)").unwrap();
        assert_ne!(a.committed_hash(), c.committed_hash());
    }

    #[test]
    fn prepared_hash_matches_committed_hash() {
        let engine = Memory::new();
        engine.begin().unwrap();
        engine.write_unmodified("INSERT INTO t VALUES (1)").unwrap();
        engine.prepare().unwrap();
        let uncommitted = engine.uncommitted_hash().unwrap();
        assert_eq!(engine.commit().unwrap(), CommitOutcome::Committed);
        assert_eq!(engine.committed_hash(), uncommitted);
        assert_eq!(engine.uncommitted_hash(), None);
    }

    #[test]
    fn rollback_discards_transaction() {
        let engine = Memory::new();
        engine.apply("CREATE TABLE t (x INT)").unwrap();
        let before = engine.committed_hash();
        engine.begin().unwrap();
        engine.write_unmodified("INSERT INTO t VALUES (1)").unwrap();
        engine.prepare().unwrap();
        engine.rollback();
        assert_eq!(engine.commit_count(), 1);
        assert_eq!(engine.committed_hash(), before);
        assert_eq!(engine.uncommitted_hash(), None);
    }

    #[test]
    fn checkpoint_retry() {
        let engine = Memory::new();
        engine.require_checkpoint();
        assert_eq!(engine.begin(), Err(Error::Checkpoint));
        engine.wait_for_checkpoint();
        engine.begin().unwrap();
    }

    #[test]
    fn conflict_leaves_transaction_open() {
        let engine = Memory::new();
        engine.conflict_next_commit();
        engine.begin().unwrap();
        engine.write_unmodified("INSERT INTO t VALUES (1)").unwrap();
        engine.prepare().unwrap();
        assert_eq!(engine.commit().unwrap(), CommitOutcome::Conflict);
        assert!(engine.uncommitted_hash().is_some());
        engine.rollback();
        assert_eq!(engine.commit_count(), 0);
    }

    #[test]
    fn committed_transactions_drain() {
        let engine = Memory::new();
        engine.apply("A").unwrap();
        engine.apply("B").unwrap();
        let drained = engine.committed_transactions();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, 1);
        assert_eq!(drained[0].1, "A");
        assert_eq!(drained[1].0, 2);
        assert!(engine.committed_transactions().is_empty());
    }

    #[test]
    fn replaying_history_reproduces_hashes() {
        let source = Memory::new();
        for i in 0..5 {
            source.apply(&format!("INSERT INTO t VALUES ({i})")).unwrap();
        }
        let replica = Memory::new();
        for (hash, query) in source.get_commits(1, 5).unwrap() {
            replica.apply(&query).unwrap();
            assert_eq!(replica.committed_hash(), hash);
        }
        assert_eq!(replica.commit_count(), source.commit_count());
    }

    #[test]
    fn commit_lock_excludes() {
        let engine = Memory::new();
        engine.commit_lock().lock();
        assert!(!engine.commit_lock().try_lock());
        engine.commit_lock().unlock();
        assert!(engine.commit_lock().try_lock());
        engine.commit_lock().unlock();
    }
}
