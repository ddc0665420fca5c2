//! The catch-up synchronization protocol: picking a sync peer, serving
//! SYNCHRONIZE requests, and applying the returned commit batches in strict
//! index order.

use super::message::{LogCommit, PeerId};
use super::peer::PeerRegistry;
use crate::engine::{CommitOutcome, Engine};
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::{info, warn};

/// Commits are served in pages of at most this many, unless send_all.
pub const SYNC_BATCH: u64 = 100;

/// Chooses the best peer to synchronize from: among logged-in peers that
/// are ahead of us, the one with the lowest non-zero latency, breaking
/// latency ties by highest commit count. A zero latency means unmeasured,
/// which any real measurement beats. Logs sync-peer transitions along with
/// why the other peers were passed over.
pub fn select_sync_peer(
    registry: &PeerRegistry,
    local_commit_count: u64,
    current: Option<PeerId>,
) -> Option<PeerId> {
    let mut best: Option<PeerId> = None;
    for (id, peer) in registry.iter() {
        if !peer.logged_in || peer.commit_count <= local_commit_count {
            continue;
        }
        best = match best {
            None => Some(id),
            Some(best_id) => {
                let incumbent = registry.get(best_id);
                if incumbent.latency == peer.latency {
                    // Both unmeasured (or identical): prefer more commits.
                    if peer.commit_count > incumbent.commit_count {
                        Some(id)
                    } else {
                        Some(best_id)
                    }
                } else if incumbent.latency == 0 || (peer.latency != 0 && peer.latency < incumbent.latency)
                {
                    Some(id)
                } else {
                    Some(best_id)
                }
            }
        };
    }

    if best != current {
        let describe = |id: Option<PeerId>| match id {
            Some(id) => {
                let peer = registry.get(id);
                format!(
                    "{} (commit count={}, latency={}ms)",
                    peer.name,
                    peer.commit_count,
                    peer.latency / 1000
                )
            }
            None => "(none)".to_string(),
        };
        let rejected = registry
            .iter()
            .filter(|(id, _)| Some(*id) != best && Some(*id) != current)
            .map(|(_, peer)| {
                if !peer.logged_in {
                    format!("{}: not logged in", peer.name)
                } else if peer.commit_count <= local_commit_count {
                    format!("{}: commit={}", peer.name, peer.commit_count)
                } else {
                    format!("{}: {}ms", peer.name, peer.latency / 1000)
                }
            })
            .join(", ");
        info!(
            "Updating sync peer from {} to {}. Not chosen: {}",
            describe(current),
            describe(best),
            rejected
        );
    }
    best
}

/// Serves a SYNCHRONIZE (or SUBSCRIBE) request: verifies the requester's
/// history is a prefix of ours, then returns the commits it is missing up
/// to target_commit, paged unless send_all.
pub fn respond(
    engine: &dyn Engine,
    peer_commit_count: u64,
    peer_hash: &str,
    target_commit: u64,
    send_all: bool,
) -> Result<Vec<LogCommit>> {
    if peer_commit_count > engine.commit_count() {
        return Err(Error::Divergence("you have more data than me".into()));
    }
    if peer_commit_count > 0 {
        // The requester has some history; make sure we agree on what we
        // share before sending anything on top of it.
        let (our_hash, _) = engine
            .get_commit(peer_commit_count)?
            .ok_or_else(|| Error::Divergence("error getting hash".into()))?;
        if our_hash != peer_hash {
            warn!(
                "Hash mismatch: peer at commit {peer_commit_count} with hash {peer_hash}, \
                 but we have {our_hash} for that commit"
            );
            return Err(Error::Divergence("hash mismatch".into()));
        }
    }

    if peer_commit_count == target_commit {
        return Ok(Vec::new());
    }
    let from = peer_commit_count + 1;
    let mut to = target_commit;
    if !send_all {
        to = to.min(from + SYNC_BATCH);
    }
    let rows = engine.get_commits(from, to)?;
    if rows.len() as u64 != to - from + 1 {
        return Err(Error::Divergence("mismatched commit count".into()));
    }
    info!("Synchronizing commits {from}-{to}");
    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(i, (hash, query))| LogCommit { index: from + i as u64, hash, query })
        .collect())
}

/// Applies a received commit batch in order, asserting contiguous indexes
/// and verifying each resulting committed hash against the declared one.
/// Checkpoint interruptions are rolled back and retried.
pub fn apply(engine: &dyn Engine, commits: &[LogCommit]) -> Result<()> {
    for commit in commits {
        if commit.index != engine.commit_count() + 1 {
            return Err(Error::Divergence(format!(
                "commit index mismatch: expected {}, got {}",
                engine.commit_count() + 1,
                commit.index
            )));
        }
        if commit.query.is_empty() {
            warn!("Synchronized blank query at commit {}", commit.index);
        }
        stage_with_checkpoint_retry(engine, &commit.query)?;
        match engine.commit()? {
            CommitOutcome::Committed => {}
            CommitOutcome::Conflict => {
                engine.rollback();
                return Err(Error::Internal("conflict applying synchronized commit".into()));
            }
        }
        if engine.committed_hash() != commit.hash {
            return Err(Error::Divergence("potential hash mismatch".into()));
        }
    }
    Ok(())
}

/// Begins, writes, and prepares a transaction, retrying when the engine
/// demands a checkpoint first. Any other failure rolls back and propagates.
pub fn stage_with_checkpoint_retry(engine: &dyn Engine, query: &str) -> Result<()> {
    loop {
        engine.wait_for_checkpoint();
        match stage(engine, query) {
            Ok(()) => return Ok(()),
            Err(Error::Checkpoint) => {
                engine.rollback();
                info!("Retrying transaction after checkpoint");
            }
            Err(err) => {
                engine.rollback();
                return Err(err);
            }
        }
    }
}

fn stage(engine: &dyn Engine, query: &str) -> Result<()> {
    engine.begin()?;
    engine.write_unmodified(query)?;
    engine.prepare()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::message::Effect;
    use crate::cluster::peer::PeerConfig;
    use crate::engine::Memory;
    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn seeded(n: u64) -> Memory {
        let engine = Memory::new();
        for i in 1..=n {
            engine.apply(&format!("INSERT INTO t VALUES ({i})")).unwrap();
        }
        engine
    }

    fn registry(names: &[&str]) -> (PeerRegistry, Receiver<Effect>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let configs =
            names.iter().map(|n| PeerConfig::new(*n, format!("{n}:9000"))).collect();
        (PeerRegistry::new(configs, Arc::new(Memory::new()), tx), rx)
    }

    #[test]
    fn selects_lowest_latency_ahead_peer() {
        let (mut registry, _rx) = registry(&["a", "b", "c", "d"]);
        for (id, commit_count, latency, logged_in) in
            [(0, 10, 5000, true), (1, 12, 2000, true), (2, 20, 0, true), (3, 30, 1000, false)]
        {
            let peer = registry.get_mut(id);
            peer.commit_count = commit_count;
            peer.latency = latency;
            peer.logged_in = logged_in;
        }
        // d is fastest but not logged in; b has the lowest real latency.
        assert_eq!(select_sync_peer(&registry, 5, None), Some(1));
        // Nobody is ahead of commit 30.
        assert_eq!(select_sync_peer(&registry, 30, None), None);
    }

    #[test]
    fn zero_latency_loses_to_any_measurement() {
        let (mut registry, _rx) = registry(&["a", "b"]);
        for (id, latency) in [(0, 0), (1, 900_000)] {
            let peer = registry.get_mut(id);
            peer.commit_count = 10;
            peer.latency = latency;
            peer.logged_in = true;
        }
        assert_eq!(select_sync_peer(&registry, 0, None), Some(1));
    }

    #[test]
    fn latency_ties_break_by_commit_count() {
        let (mut registry, _rx) = registry(&["a", "b"]);
        for (id, commit_count) in [(0, 10), (1, 15)] {
            let peer = registry.get_mut(id);
            peer.commit_count = commit_count;
            peer.logged_in = true;
        }
        assert_eq!(select_sync_peer(&registry, 0, None), Some(1));
    }

    #[test]
    fn respond_serves_missing_commits() {
        let engine = seeded(5);
        let commits = respond(&engine, 2, &engine.get_commit(2).unwrap().unwrap().0, 5, false)
            .unwrap();
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[0].index, 3);
        assert_eq!(commits[2].index, 5);

        // Fully caught up.
        assert!(respond(&engine, 5, &engine.committed_hash(), 5, false).unwrap().is_empty());
    }

    #[test]
    fn respond_pages_large_histories() {
        let engine = seeded(150);
        let commits = respond(&engine, 0, "", 150, false).unwrap();
        assert_eq!(commits.len() as u64, SYNC_BATCH + 1);
        let all = respond(&engine, 0, "", 150, true).unwrap();
        assert_eq!(all.len(), 150);
    }

    #[test]
    fn respond_detects_forks() {
        let engine = seeded(5);
        assert_eq!(
            respond(&engine, 3, "BOGUS", 5, false),
            Err(Error::Divergence("hash mismatch".into()))
        );
        assert_eq!(
            respond(&engine, 9, "", 5, false),
            Err(Error::Divergence("you have more data than me".into()))
        );
    }

    #[test]
    fn apply_verifies_order_and_hashes() {
        let source = seeded(4);
        let commits = respond(&source, 0, "", 4, true).unwrap();

        let replica = Memory::new();
        apply(&replica, &commits).unwrap();
        assert_eq!(replica.commit_count(), 4);
        assert_eq!(replica.committed_hash(), source.committed_hash());

        // Replaying the same batch is an index mismatch, not a double apply.
        assert!(matches!(apply(&replica, &commits), Err(Error::Divergence(_))));

        // A tampered hash is caught after the commit applies.
        let source = seeded(2);
        let mut commits = respond(&source, 0, "", 2, true).unwrap();
        commits[1].hash = "EVIL".into();
        let replica = Memory::new();
        assert_eq!(
            apply(&replica, &commits),
            Err(Error::Divergence("potential hash mismatch".into()))
        );
    }

    #[test]
    fn apply_retries_after_checkpoint() {
        let source = seeded(2);
        let commits = respond(&source, 0, "", 2, true).unwrap();
        let replica = Memory::new();
        replica.require_checkpoint();
        apply(&replica, &commits).unwrap();
        assert_eq!(replica.committed_hash(), source.committed_hash());
    }

    #[test]
    fn sync_equals_direct_replay() {
        // Applying a SYNCHRONIZE_RESPONSE of N commits is equivalent to
        // replaying those N queries as plain transactions.
        let source = seeded(6);
        let synced = Memory::new();
        apply(&synced, &respond(&source, 0, "", 6, true).unwrap()).unwrap();

        let replayed = Memory::new();
        for (_, query) in source.get_commits(1, 6).unwrap() {
            replayed.apply(&query).unwrap();
        }
        assert_eq!(synced.committed_hash(), replayed.committed_hash());
        assert_eq!(synced.commit_count(), replayed.commit_count());
    }
}
