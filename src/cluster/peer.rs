use super::message::{Effect, Message, PeerId, Stamp, Vote};
use super::state::State;
use crate::engine::Engine;
use crate::error::Result;

use crossbeam::channel::Sender;
use log::{debug, warn};
use std::sync::Arc;

/// Static configuration for a peer.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub name: String,
    pub host: String,
    /// Permafollowers replicate but never lead and never vote.
    pub permafollower: bool,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self { name: name.into(), host: host.into(), permafollower: false }
    }

    pub fn permafollower(mut self) -> Self {
        self.permafollower = true;
        self
    }
}

/// A configured peer and its observed remote attributes. Lives for the
/// node's lifetime; the observed attributes mutate as messages arrive.
#[derive(Debug)]
pub struct Peer {
    pub name: String,
    pub host: String,
    pub permafollower: bool,
    /// Whether the transport currently has a session to this peer.
    pub connected: bool,
    pub logged_in: bool,
    /// The last observed remote state.
    pub state: State,
    pub priority: i64,
    pub version: String,
    /// The peer's advertised commit count, updated on every message.
    pub commit_count: u64,
    /// The peer's advertised committed hash, updated on every message.
    pub committed_hash: String,
    /// Leader-side: whether this peer receives transaction broadcasts.
    pub subscribed: bool,
    /// This peer's ballot for our current standup attempt.
    pub standup_response: Option<Vote>,
    /// This peer's vote on the outstanding transaction.
    pub transaction_response: Option<Vote>,
    /// Measured link latency in microseconds; 0 means unknown.
    pub latency: u64,
}

impl Peer {
    fn new(config: PeerConfig) -> Self {
        Self {
            name: config.name,
            host: config.host,
            permafollower: config.permafollower,
            connected: false,
            logged_in: false,
            state: State::Unknown,
            priority: 0,
            version: String::new(),
            commit_count: 0,
            committed_hash: String::new(),
            subscribed: false,
            standup_response: None,
            transaction_response: None,
            latency: 0,
        }
    }

    /// Resets the observed attributes when the peer disconnects. Everything
    /// learned over the session is stale; in particular a dead peer must
    /// not be remembered as LEADING, or it would wrongly contest the next
    /// election.
    pub fn reset_session(&mut self) {
        self.connected = false;
        self.logged_in = false;
        self.state = State::Unknown;
        self.priority = 0;
        self.commit_count = 0;
        self.committed_hash.clear();
        self.subscribed = false;
        self.standup_response = None;
        self.transaction_response = None;
    }
}

/// The per-peer attribute registry. Outbound messages go through here so
/// that every frame is stamped with the local database's current
/// `(commit_count, hash)` at send time.
pub struct PeerRegistry {
    peers: Vec<Peer>,
    engine: Arc<dyn Engine>,
    effect_tx: Sender<Effect>,
}

impl PeerRegistry {
    pub fn new(
        configs: Vec<PeerConfig>,
        engine: Arc<dyn Engine>,
        effect_tx: Sender<Effect>,
    ) -> Self {
        let peers = configs.into_iter().map(Peer::new).collect();
        Self { peers, engine, effect_tx }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: PeerId) -> &Peer {
        self.peers.get(id as usize).expect("unknown peer")
    }

    pub fn get_mut(&mut self, id: PeerId) -> &mut Peer {
        self.peers.get_mut(id as usize).expect("unknown peer")
    }

    /// Looks up a peer by name.
    pub fn find(&self, name: &str) -> Option<PeerId> {
        self.peers.iter().position(|p| p.name == name).map(|i| i as PeerId)
    }

    pub fn ids(&self) -> impl Iterator<Item = PeerId> {
        (0..self.peers.len()).map(|i| i as PeerId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &Peer)> {
        self.peers.iter().enumerate().map(|(i, p)| (i as PeerId, p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PeerId, &mut Peer)> {
        self.peers.iter_mut().enumerate().map(|(i, p)| (i as PeerId, p))
    }

    /// Records a latency measurement for sync-peer selection. Called by the
    /// transport layer.
    pub fn set_latency(&mut self, id: PeerId, latency_us: u64) {
        self.get_mut(id).latency = latency_us;
    }

    /// The current local database stamp applied to outbound frames.
    pub fn stamp(&self) -> Stamp {
        Stamp { commit_count: self.engine.commit_count(), hash: self.engine.committed_hash() }
    }

    /// Sends a message to a peer, stamped with the local database state. A
    /// message to a disconnected peer is discarded with a warning.
    pub fn send(&self, to: PeerId, message: &Message) -> Result<()> {
        let peer = self.get(to);
        if !peer.connected {
            warn!(
                "Can't send {} to disconnected peer {}, discarding",
                message.method(),
                peer.name
            );
            return Ok(());
        }
        debug!("Sending {} to {}", message.method(), peer.name);
        let frame = message.to_frame(&self.stamp());
        Ok(self.effect_tx.send(Effect::Send { to, frame })?)
    }

    /// Broadcasts a message to all connected peers, or only to subscribed
    /// ones (used for transaction traffic). The frame is stamped once.
    pub fn broadcast(&self, message: &Message, subscribed_only: bool) -> Result<()> {
        let frame = message.to_frame(&self.stamp());
        for (id, peer) in self.iter() {
            if peer.connected && (!subscribed_only || peer.subscribed) {
                self.effect_tx.send(Effect::Send { to: id, frame: frame.clone() })?;
            }
        }
        Ok(())
    }

    /// Asks the transport to reset the session to a peer. The peer is
    /// logged out immediately; connect/disconnect events follow.
    pub fn reconnect(&mut self, id: PeerId) -> Result<()> {
        let peer = self.get_mut(id);
        if peer.connected {
            debug!("Reconnecting to {}", peer.name);
            peer.logged_in = false;
            self.effect_tx.send(Effect::Reconnect { to: id })?;
        }
        Ok(())
    }

    pub fn reconnect_all(&mut self) -> Result<()> {
        for id in self.ids().collect::<Vec<_>>() {
            self.reconnect(id)?;
        }
        Ok(())
    }

    /// Counts `(full, logged-in full)` peers, where full peers are
    /// non-permafollowers.
    pub fn full_counts(&self) -> (usize, usize) {
        let full = self.peers.iter().filter(|p| !p.permafollower).count();
        let logged_in = self.peers.iter().filter(|p| !p.permafollower && p.logged_in).count();
        (full, logged_in)
    }

    /// Whether a majority of full peers are subscribed to us.
    pub fn majority_subscribed(&self) -> bool {
        let (full, _) = self.full_counts();
        let subscribed = self.peers.iter().filter(|p| !p.permafollower && p.subscribed).count();
        subscribed * 2 >= full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Memory;
    use pretty_assertions::assert_eq;

    fn registry() -> (PeerRegistry, crossbeam::channel::Receiver<Effect>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let configs = vec![
            PeerConfig::new("alpha", "alpha:9000"),
            PeerConfig::new("beta", "beta:9000"),
            PeerConfig::new("perma", "perma:9000").permafollower(),
        ];
        (PeerRegistry::new(configs, Arc::new(Memory::new()), tx), rx)
    }

    #[test]
    fn full_counts_exclude_permafollowers() {
        let (mut registry, _rx) = registry();
        assert_eq!(registry.full_counts(), (2, 0));
        registry.get_mut(0).logged_in = true;
        registry.get_mut(2).logged_in = true;
        assert_eq!(registry.full_counts(), (2, 1));
    }

    #[test]
    fn send_skips_disconnected() {
        let (mut registry, rx) = registry();
        registry.send(0, &Message::Synchronize).unwrap();
        assert!(rx.try_recv().is_err());

        registry.get_mut(0).connected = true;
        registry.send(0, &Message::Synchronize).unwrap();
        match rx.try_recv().unwrap() {
            Effect::Send { to, frame } => {
                assert_eq!(to, 0);
                assert_eq!(frame.method, "SYNCHRONIZE");
                assert_eq!(frame.headers.get("CommitCount"), Some("0"));
                assert!(frame.headers.contains("Hash"));
            }
            effect => panic!("unexpected effect {effect:?}"),
        }
    }

    #[test]
    fn broadcast_subscribed_only() {
        let (mut registry, rx) = registry();
        for id in [0, 1, 2] {
            registry.get_mut(id).connected = true;
        }
        registry.get_mut(1).subscribed = true;

        registry
            .broadcast(
                &Message::RollbackTransaction {
                    id: super::super::message::TransactionId::Quorum(1),
                    new_hash: "H".into(),
                },
                true,
            )
            .unwrap();
        let effects: Vec<_> = rx.try_iter().collect();
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::Send { to: 1, .. }));

        registry.broadcast(&Message::Synchronize, false).unwrap();
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn reconnect_logs_out() {
        let (mut registry, rx) = registry();
        registry.get_mut(0).connected = true;
        registry.get_mut(0).logged_in = true;
        registry.reconnect(0).unwrap();
        assert!(!registry.get(0).logged_in);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Effect::Reconnect { to: 0 }]);
    }
}
