use super::escalation::EscalationTable;
use super::message::{Effect, Message, PeerId, TransactionId, Vote};
use super::peer::{PeerConfig, PeerRegistry};
use super::replication::Pipeline;
use super::state::{CommitState, Consistency, State};
use super::sync;
use crate::codec::Frame;
use crate::engine::{CommitOutcome, Engine};
use crate::error::{Error, Result};
use crate::server::{Command, Server};

use crossbeam::channel::Sender;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Receive timeout for SEARCHING and SUBSCRIBING, in microseconds.
pub const DEFAULT_RECV_TIMEOUT: u64 = 5 * 60 * 1_000_000;
/// Receive timeout while SYNCHRONIZING.
pub const SYNCHRONIZING_RECV_TIMEOUT: u64 = 30 * 1_000_000;
/// Timeout waiting for standup ballots. Short, because two nodes standing
/// up simultaneously deadlock until one gives up.
pub const STANDUP_TIMEOUT: u64 = 5 * 1_000_000;
/// Cap on the STANDINGDOWN quiesce window.
pub const STANDDOWN_TIMEOUT: u64 = 30 * 1_000_000;
/// Maximum random jitter added to state timeouts.
pub const TIMEOUT_JITTER: u64 = 5 * 1_000_000;

/// A wall-clock source, in microseconds since an arbitrary epoch. Injected
/// so tests can drive timeouts deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// The system wall clock.
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

/// Node timeouts and jitter. Defaults match the production constants.
#[derive(Clone, Debug)]
pub struct Options {
    pub recv_timeout: u64,
    pub sync_timeout: u64,
    pub standup_timeout: u64,
    pub standdown_timeout: u64,
    pub jitter: u64,
    /// The initial SEARCHING deadline after construction.
    pub first_timeout: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            sync_timeout: SYNCHRONIZING_RECV_TIMEOUT,
            standup_timeout: STANDUP_TIMEOUT,
            standdown_timeout: STANDDOWN_TIMEOUT,
            jitter: TIMEOUT_JITTER,
            first_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }
}

/// Leader-side tracking of which committed transactions have been
/// broadcast to followers. Shared by handle so the command server can flag
/// transactions it commits directly for asynchronous streaming.
#[derive(Debug, Default)]
pub struct SendTracker {
    unsent: AtomicBool,
    last_sent: AtomicU64,
}

impl SendTracker {
    /// Flags that locally committed transactions await broadcast.
    pub fn mark_unsent(&self) {
        self.unsent.store(true, Ordering::SeqCst);
    }

    pub fn has_unsent(&self) -> bool {
        self.unsent.load(Ordering::SeqCst)
    }

    fn clear_unsent(&self) {
        self.unsent.store(false, Ordering::SeqCst);
    }

    /// The ID of the last transaction broadcast to followers.
    pub fn last_sent(&self) -> u64 {
        self.last_sent.load(Ordering::SeqCst)
    }

    fn set_last_sent(&self, id: u64) {
        self.last_sent.store(id, Ordering::SeqCst);
    }
}

/// A point-in-time snapshot of the node, for observability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub state: State,
    pub priority: i64,
    pub commit_count: u64,
    pub committed_hash: String,
    pub commit_state: CommitState,
    pub leader: Option<String>,
    pub peers: Vec<PeerStatus>,
}

/// A peer's observed attributes inside [`Status`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub name: String,
    pub state: State,
    pub logged_in: bool,
    pub priority: i64,
    pub commit_count: u64,
    pub subscribed: bool,
}

/// A cluster node: the distributed consensus and replication core of one
/// database instance.
///
/// The node is driven synchronously by one thread: inbound peer frames go
/// through [`Node::receive`], connection churn through
/// [`Node::on_connect`]/[`Node::on_disconnect`], and the periodic
/// [`Node::update`] tick moves the state machine forward. Outbound traffic
/// is emitted as [`Effect`]s on the channel given at construction; the
/// transport owns the sockets. Follower replication additionally spawns
/// short-lived worker threads (see the replication pipeline).
pub struct Node {
    name: String,
    version: String,
    original_priority: i64,
    /// Current election priority. -1 until the first WAITING entry assigns
    /// the configured priority; 0 means permafollower.
    priority: i64,
    /// The node state, behind a lock so replication workers and external
    /// observers can read it while the sync thread writes it.
    state: Arc<RwLock<State>>,
    state_change_count: u64,
    /// Deadline for the current state, in clock microseconds.
    state_timeout: u64,
    commit_state: CommitState,
    commit_consistency: Consistency,
    /// Whether we hold the engine's global commit lock. Held from issuing
    /// BEGIN_TRANSACTION until the commit resolves; released on every path
    /// that leaves the commit window.
    commit_lock_held: bool,
    engine: Arc<dyn Engine>,
    server: Arc<dyn Server>,
    clock: Arc<dyn Clock>,
    registry: PeerRegistry,
    pipeline: Pipeline,
    escalations: EscalationTable,
    sync_peer: Option<PeerId>,
    /// The peer we're subscribing to or following. Behind a mutex so
    /// escalation and replication workers see a consistent target.
    lead_peer: Arc<Mutex<Option<PeerId>>>,
    leader_version: String,
    send_tracker: Arc<SendTracker>,
    shutdown_deadline: Option<u64>,
    stand_down_deadline: Option<u64>,
    opts: Options,
}

impl Node {
    /// Creates a new node in SEARCHING. The node starts with priority -1
    /// and only assumes its configured priority once it first reaches
    /// WAITING (i.e. once it has caught up).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        priority: i64,
        peers: Vec<PeerConfig>,
        engine: Arc<dyn Engine>,
        server: Arc<dyn Server>,
        clock: Arc<dyn Clock>,
        effect_tx: Sender<Effect>,
        opts: Options,
    ) -> Result<Node> {
        if priority < 0 {
            return Err(Error::Internal(format!("invalid priority {priority}")));
        }
        let state = Arc::new(RwLock::new(State::Searching));
        let lead_peer = Arc::new(Mutex::new(None));
        let registry = PeerRegistry::new(peers, engine.clone(), effect_tx.clone());
        let pipeline = Pipeline::new(
            engine.clone(),
            effect_tx,
            lead_peer.clone(),
            priority == 0,
            clock.clone(),
        );
        let state_timeout = clock.now() + opts.first_timeout;
        Ok(Node {
            name: name.into(),
            version: version.into(),
            original_priority: priority,
            priority: -1,
            state,
            state_change_count: 0,
            state_timeout,
            commit_state: CommitState::Uninitialized,
            commit_consistency: Consistency::Quorum,
            commit_lock_held: false,
            engine,
            server,
            clock,
            registry,
            pipeline,
            escalations: EscalationTable::new(),
            sync_peer: None,
            lead_peer,
            leader_version: String::new(),
            send_tracker: Arc::new(SendTracker::default()),
            shutdown_deadline: None,
            stand_down_deadline: None,
            opts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        *self.state.read()
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn commit_state(&self) -> CommitState {
        self.commit_state
    }

    pub fn commit_in_progress(&self) -> bool {
        self.commit_state.in_progress()
    }

    /// The observed state of our leader, or Unknown if we have none.
    pub fn leader_state(&self) -> State {
        match *self.lead_peer.lock() {
            Some(id) => self.registry.get(id).state,
            None => State::Unknown,
        }
    }

    pub fn leader_version(&self) -> &str {
        &self.leader_version
    }

    /// The handle the command server uses to flag directly committed
    /// transactions for asynchronous streaming.
    pub fn send_tracker(&self) -> Arc<SendTracker> {
        self.send_tracker.clone()
    }

    /// The request method lines of all in-flight escalations.
    pub fn escalated_methods(&self) -> Vec<String> {
        self.escalations.methods()
    }

    /// Looks up a configured peer by name.
    pub fn peer_id(&self, name: &str) -> Option<PeerId> {
        self.registry.find(name)
    }

    /// Records a transport latency measurement for a peer, used when
    /// choosing a sync peer.
    pub fn set_peer_latency(&mut self, peer: PeerId, latency_us: u64) {
        self.registry.set_latency(peer, latency_us);
    }

    /// A snapshot of the node and its view of the cluster.
    pub fn status(&self) -> Status {
        Status {
            name: self.name.clone(),
            state: self.state(),
            priority: self.priority,
            commit_count: self.engine.commit_count(),
            committed_hash: self.engine.committed_hash(),
            commit_state: self.commit_state,
            leader: (*self.lead_peer.lock()).map(|id| self.registry.get(id).name.clone()),
            peers: self
                .registry
                .iter()
                .map(|(_, p)| PeerStatus {
                    name: p.name.clone(),
                    state: p.state,
                    logged_in: p.logged_in,
                    priority: p.priority,
                    commit_count: p.commit_count,
                    subscribed: p.subscribed,
                })
                .collect(),
        }
    }

    /// Requests a distributed commit of the engine's open transaction at
    /// the given consistency. The next update() tick starts it.
    pub fn start_commit(&mut self, consistency: Consistency) -> Result<()> {
        if self.commit_state.in_progress() {
            return Err(Error::Internal("commit already in progress".into()));
        }
        self.commit_state = CommitState::Waiting;
        self.commit_consistency = consistency;
        Ok(())
    }

    /// Sends a completed escalated command's response back to the follower
    /// that initiated it. Invoked by the command server on the leader.
    pub fn send_response(&self, command: &Command) -> Result<()> {
        let peer = command
            .initiating_peer
            .ok_or_else(|| Error::Internal("command has no initiating peer".into()))?;
        let response = command
            .response
            .as_ref()
            .ok_or_else(|| Error::Internal("command has no response".into()))?;
        info!("Sending ESCALATE_RESPONSE to {} for {}", self.registry.get(peer).name, command.id);
        self.registry.send(
            peer,
            &Message::EscalateResponse { id: command.id.clone(), response: response.encode() },
        )
    }

    /// Escalates a follower-originated command to the leader. If there is
    /// no usable leader the command is handed straight back to the server
    /// for retry. With `forget`, the command is fired and forgotten rather
    /// than tracked for a response.
    pub fn escalate(&mut self, mut command: Command, forget: bool) -> Result<()> {
        let lead = *self.lead_peer.lock();
        let Some(lead) = lead else {
            warn!("Asked to escalate {} with no leader, returning to server", command.id);
            self.server.accept_command(command, false);
            return Ok(());
        };
        let lead_state = self.registry.get(lead).state;
        if lead_state == State::StandingDown {
            info!("Asked to escalate but leader standing down, letting server retry");
            self.server.accept_command(command, false);
            return Ok(());
        }
        if lead_state != State::Leading {
            warn!("Escalating to leader in unexpected state {lead_state}");
        }
        info!(
            "Escalating '{}' ({}) to leader '{}'",
            command.request.method,
            command.id,
            self.registry.get(lead).name
        );
        command.escalated = true;
        let message =
            Message::Escalate { id: command.id.clone(), command: command.request.encode() };
        if forget {
            info!("Firing and forgetting command '{}' to leader", command.request.method);
        } else {
            command.escalated_at = self.clock.now();
            self.escalations.track(command);
        }
        self.registry.send(lead, &message)
    }

    /// Server-initiated broadcast: to one peer, or to everyone connected.
    pub fn broadcast(&self, message: &Message, peer: Option<PeerId>) -> Result<()> {
        match peer {
            Some(id) => self.registry.send(id, message),
            None => self.registry.broadcast(message, false),
        }
    }

    /// Starts a graceful shutdown with the given deadline. Redundant calls
    /// are ignored.
    pub fn begin_shutdown(&mut self, wait_us: u64) {
        if self.shutdown_deadline.is_none() {
            info!("Beginning graceful shutdown");
            self.shutdown_deadline = Some(self.clock.now() + wait_us);
        }
    }

    pub fn graceful_shutdown(&self) -> bool {
        self.shutdown_deadline.is_some()
    }

    /// Whether the graceful shutdown has finished. At the deadline, any
    /// remaining escalations are completed with a synthetic 500 Abandoned
    /// and the node jumps to SEARCHING.
    pub fn shutdown_complete(&mut self) -> Result<bool> {
        let Some(deadline) = self.shutdown_deadline else {
            return Ok(false);
        };
        if self.clock.now() >= deadline {
            warn!("Graceful shutdown timed out, killing non-gracefully");
            if !self.escalations.is_empty() {
                let abandoned = self.escalations.abandon_all(self.server.as_ref());
                warn!("Abandoned {abandoned} escalated commands");
            }
            self.change_state(State::Searching)?;
            return Ok(true);
        }
        if !self.state().can_complete_shutdown() {
            info!(
                "Can't graceful shutdown yet because state={}, commit_in_progress={}, escalated={}",
                self.state(),
                self.commit_in_progress(),
                self.escalations.len()
            );
            for method in self.escalations.methods() {
                info!("Escalated command remaining at shutdown: {method}");
            }
            return Ok(false);
        }
        if self.nothing_blocking_shutdown() {
            info!("Graceful shutdown is complete");
            Ok(true)
        } else {
            info!(
                "Can't graceful shutdown yet because waiting on commands: \
                 commit_in_progress={}, escalated={}",
                self.commit_in_progress(),
                self.escalations.len()
            );
            Ok(false)
        }
    }

    fn nothing_blocking_shutdown(&self) -> bool {
        self.engine.uncommitted_hash().is_none()
            && !self.commit_in_progress()
            && self.escalations.is_empty()
    }

    /// Handles a new transport session to a peer by sending LOGIN.
    pub fn on_connect(&mut self, peer: PeerId) -> Result<()> {
        self.registry.get_mut(peer).connected = true;
        info!("Sending LOGIN to {}", self.registry.get(peer).name);
        self.registry.send(
            peer,
            &Message::Login {
                priority: self.priority,
                state: self.state(),
                version: self.version.clone(),
                permafollower: self.original_priority == 0,
            },
        )
    }

    /// Handles a lost transport session. Checks whether we just lost our
    /// leader or sync peer, and whether we can still claim quorum.
    pub fn on_disconnect(&mut self, peer: PeerId) -> Result<()> {
        self.registry.get_mut(peer).reset_session();

        let lost_leader = *self.lead_peer.lock() == Some(peer);
        if lost_leader {
            warn!("Lost our leader, re-SEARCHING");
            *self.lead_peer.lock() = None;
            if self.engine.uncommitted_hash().is_some() {
                warn!(
                    "Was expecting a response for transaction #{} but disconnected \
                     prematurely, rolling back",
                    self.engine.commit_count() + 1
                );
                self.engine.rollback();
            }
            if !self.escalations.is_empty() {
                // The leader may have committed these without us learning
                // the outcome; deduplication is the command server's call.
                warn!(
                    "Leader died with {} escalations in flight, outcomes unknown; re-queueing",
                    self.escalations.len()
                );
            }
            self.escalations.requeue_all(self.server.as_ref());
            self.change_state(State::Searching)?;
        }

        if self.sync_peer == Some(peer) {
            warn!("Lost our synchronization peer, re-SEARCHING");
            self.sync_peer = None;
            self.change_state(State::Searching)?;
        }

        // If we can no longer claim quorum, we can't commit anything and
        // must stop claiming leadership. Jumping straight to SEARCHING is
        // only safe with no commit in progress; mid-commit we stand down
        // properly so the transaction resolves first.
        if matches!(self.state(), State::Leading | State::StandingUp | State::StandingDown) {
            let (full, logged_in) = self.registry.full_counts();
            if logged_in * 2 < full {
                warn!("We were {} but lost quorum", self.state());
                if self.commit_in_progress() {
                    if self.state() == State::Leading {
                        self.change_state(State::StandingDown)?;
                    }
                } else {
                    self.change_state(State::Searching)?;
                }
            }
        }
        Ok(())
    }

    /// Processes an inbound frame from a peer. Protocol and divergence
    /// faults reset the offending peer session; other errors propagate.
    pub fn receive(&mut self, from: PeerId, frame: &Frame) -> Result<()> {
        match self.on_frame(from, frame) {
            Ok(()) => Ok(()),
            Err(err) if err.is_session_fault() => {
                warn!("Error processing {} from {}: {err}", frame.method, self.registry.get(from).name);
                self.registry.reconnect(from)
            }
            Err(err) => Err(err),
        }
    }

    fn on_frame(&mut self, from: PeerId, frame: &Frame) -> Result<()> {
        let (stamp, message) = Message::from_frame(frame)?;
        debug!("Received {} from {}", message.method(), self.registry.get(from).name);
        {
            let peer = self.registry.get_mut(from);
            peer.commit_count = stamp.commit_count;
            peer.committed_hash = stamp.hash;
        }

        if let Message::Login { priority, state, version, permafollower } = message {
            return self.on_login(from, priority, state, version, permafollower);
        }
        if !self.registry.get(from).logged_in {
            return Err(Error::Protocol("not logged in".into()));
        }

        match message {
            Message::Login { .. } => unreachable!("handled above"),
            Message::NodeState { state, priority, state_change_count } => {
                self.on_peer_state(from, state, priority, state_change_count)
            }
            Message::StandupResponse { response, state_change_count, reason } => {
                self.on_standup_response(from, response, state_change_count, &reason);
                Ok(())
            }
            Message::Synchronize => self.on_synchronize(from),
            Message::SynchronizeResponse { commits } => {
                self.on_synchronize_response(from, &commits)
            }
            Message::Subscribe => self.on_subscribe(from),
            Message::SubscriptionApproved { commits } => {
                self.on_subscription_approved(from, &commits)
            }
            message @ (Message::BeginTransaction { .. }
            | Message::CommitTransaction { .. }
            | Message::RollbackTransaction { .. }) => {
                if self.state() != State::Following {
                    warn!("Received {} while {}, dropping", message.method(), self.state());
                    return Ok(());
                }
                self.pipeline.spawn(message)
            }
            Message::ApproveTransaction { id, new_count, new_hash } => {
                self.on_transaction_response(from, Vote::Approve, id, new_count, &new_hash)
            }
            Message::DenyTransaction { id, new_count, new_hash } => {
                self.on_transaction_response(from, Vote::Deny, id, new_count, &new_hash)
            }
            Message::Escalate { id, command } => self.on_escalate(from, id, &command),
            Message::EscalateCancel { id } => self.on_escalate_cancel(from, &id),
            Message::EscalateResponse { id, response } => {
                if self.state() != State::Following {
                    return Err(Error::Protocol("not following".into()));
                }
                let (response, _) = Frame::decode(&response)
                    .map_err(|_| Error::Protocol("malformed content".into()))?;
                let now = self.clock.now();
                self.escalations.on_response(&id, response, now, self.server.as_ref());
                Ok(())
            }
            Message::EscalateAborted { id, reason } => {
                if self.state() != State::Following {
                    return Err(Error::Protocol("not following".into()));
                }
                info!("Received ESCALATE_ABORTED for '{id}' ({reason})");
                self.escalations.on_aborted(&id, &reason, self.server.as_ref());
                Ok(())
            }
            Message::CrashCommand(frame) | Message::BroadcastCommand(frame) => {
                info!("Received {} command, forwarding to server", frame.method);
                let id = frame.headers.get("ID").unwrap_or_default().to_string();
                self.server.accept_command(Command::new(id, frame), true);
                Ok(())
            }
        }
    }

    fn on_login(
        &mut self,
        from: PeerId,
        priority: i64,
        state: State,
        version: String,
        permafollower: bool,
    ) -> Result<()> {
        let configured_permafollower = self.registry.get(from).permafollower;
        if self.registry.get(from).logged_in {
            return Err(Error::Protocol("already logged in".into()));
        }
        if configured_permafollower && (!permafollower || priority > 0) {
            return Err(Error::Protocol("you're supposed to be a 0-priority permafollower".into()));
        }
        if !configured_permafollower && (permafollower || priority == 0) {
            return Err(Error::Protocol(
                "you're *not* supposed to be a 0-priority permafollower".into(),
            ));
        }
        // Two full peers with the same nonzero priority can't elect.
        if self.priority > 0 && priority == self.priority {
            return Err(Error::Protocol(format!("duplicate priority {priority}")));
        }
        {
            let peer = self.registry.get_mut(from);
            info!(
                "Peer {} logged in at '{state}', priority {priority} commit #{}",
                peer.name, peer.commit_count
            );
            peer.priority = priority;
            peer.version = version;
            peer.state = state;
            peer.logged_in = true;
        }
        self.server.on_peer_login(from);
        Ok(())
    }

    /// Handles a peer's STATE broadcast: tracks its state and priority, and
    /// reacts to standups, stand-downs, and resets.
    fn on_peer_state(
        &mut self,
        from: PeerId,
        to_state: State,
        priority: i64,
        state_change_count: u64,
    ) -> Result<()> {
        let from_state = {
            let peer = self.registry.get_mut(from);
            let from_state = peer.state;
            peer.priority = priority;
            peer.state = to_state;
            from_state
        };
        let peer_name = self.registry.get(from).name.clone();

        if from_state == to_state {
            debug!("Peer {peer_name} sent new commit in state '{from_state}'");
            return Ok(());
        }
        info!("Peer {peer_name} switched from '{from_state}' to '{to_state}'");
        if to_state == State::Unknown {
            warn!("Peer {peer_name} going to unrecognized state");
        }
        if from_state != State::Unknown && !State::valid_transition(from_state, to_state) {
            warn!("Peer {peer_name} making invalid transition from '{from_state}' to '{to_state}'");
        }

        match to_state {
            State::Searching => {
                // A peer in trouble reverts to SEARCHING; reset whatever
                // we've accumulated about it.
                let peer = self.registry.get_mut(from);
                peer.subscribed = false;
                peer.transaction_response = None;
            }
            State::StandingUp => self.on_peer_standup(from, state_change_count)?,
            _ => {}
        }

        if from_state == State::StandingDown && self.engine.uncommitted_hash().is_some() {
            // The leader stood down without resolving our transaction. The
            // response will never come; roll back.
            warn!(
                "Was expecting a response for transaction #{} but leader stood down \
                 prematurely, rolling back",
                self.engine.commit_count() + 1
            );
            self.engine.rollback();
        }
        Ok(())
    }

    /// Votes on a peer's standup announcement, possibly stepping aside for
    /// a higher-priority challenger.
    fn on_peer_standup(&mut self, from: PeerId, ballot: u64) -> Result<()> {
        let peer_name = self.registry.get(from).name.clone();
        let peer_priority = self.registry.get(from).priority;
        let mut response = Vote::Approve;
        let mut reason = String::new();

        if self.registry.get(from).permafollower {
            warn!("Permafollower {peer_name} trying to stand up, denying");
            response = Vote::Deny;
            reason = "You're a permafollower".into();
        } else if matches!(
            self.state(),
            State::StandingUp | State::Leading | State::StandingDown
        ) {
            if peer_priority > self.priority {
                // A higher-priority peer is standing up while we hold (or
                // seek) leadership, e.g. it was restarted after we took
                // over. Step aside gracefully so in-flight work finishes.
                match self.state() {
                    State::StandingUp => {
                        warn!("Higher-priority peer standing up while we are STANDINGUP, SEARCHING");
                        self.change_state(State::Searching)?;
                    }
                    State::Leading => {
                        warn!(
                            "Higher-priority peer standing up while we are LEADING, STANDINGDOWN"
                        );
                        self.change_state(State::StandingDown)?;
                    }
                    _ => warn!(
                        "Higher-priority peer standing up while we are STANDINGDOWN, continuing"
                    ),
                }
                response = Vote::Deny;
                reason = "standing down, try again".into();
            } else {
                response = Vote::Deny;
                reason = "I am leading".into();
                if self.registry.majority_subscribed() {
                    info!(
                        "Lower-priority peer {peer_name} trying to stand up while we are {} \
                         with a majority subscribed; denying and ignoring",
                        self.state()
                    );
                } else {
                    // We don't hold a majority; the rest of the cluster may
                    // have moved on without us. Reset everything. Mid-commit
                    // we must pass through STANDINGDOWN rather than jump
                    // straight to SEARCHING.
                    warn!(
                        "Lower-priority peer {peer_name} trying to stand up while we are {} \
                         without a majority, reconnecting and SEARCHING",
                        self.state()
                    );
                    self.registry.reconnect_all()?;
                    if self.commit_in_progress() && self.state() == State::Leading {
                        self.change_state(State::StandingDown)?;
                    } else {
                        self.change_state(State::Searching)?;
                    }
                }
            }
        } else {
            // Approve unless somebody else is already campaigning or
            // leading.
            for (id, other) in self.registry.iter() {
                if id != from
                    && matches!(
                        other.state,
                        State::StandingUp | State::Leading | State::StandingDown
                    )
                {
                    response = Vote::Deny;
                    reason = format!("peer '{}' is '{}'", other.name, other.state);
                    break;
                }
            }
        }

        match response {
            Vote::Approve => info!("Approving standup request from {peer_name}"),
            Vote::Deny => info!("Denying standup request from {peer_name} because {reason}"),
        }
        self.registry.send(
            from,
            &Message::StandupResponse { response, state_change_count: ballot, reason },
        )
    }

    fn on_standup_response(&mut self, from: PeerId, response: Vote, ballot: u64, reason: &str) {
        if self.state() != State::StandingUp {
            info!("Got STANDUP_RESPONSE but not STANDINGUP, probably late; ignoring");
            return;
        }
        if ballot != self.state_change_count {
            info!("Received STANDUP_RESPONSE for old standup attempt ({ballot}), ignoring");
            return;
        }
        let peer = self.registry.get_mut(from);
        if let Some(previous) = peer.standup_response {
            warn!(
                "Peer {} already responded '{previous}', now '{response}'; \
                 multiple leaders competing?",
                peer.name
            );
        }
        match response {
            Vote::Approve => info!("Received standup approval from {}", peer.name),
            Vote::Deny => info!("Received standup denial from {}: '{reason}'", peer.name),
        }
        peer.standup_response = Some(response);
    }

    /// Serves a SYNCHRONIZE request from the local engine.
    fn on_synchronize(&mut self, from: PeerId) -> Result<()> {
        let (peer_commit_count, peer_hash) = {
            let peer = self.registry.get(from);
            (peer.commit_count, peer.committed_hash.clone())
        };
        let commits = sync::respond(
            self.engine.as_ref(),
            peer_commit_count,
            &peer_hash,
            self.sync_target(),
            false,
        )?;
        self.registry.send(from, &Message::SynchronizeResponse { commits })
    }

    /// The highest commit we serve to synchronizing peers: the last
    /// broadcast transaction while async commits are in flight, else
    /// everything.
    fn sync_target(&self) -> u64 {
        if self.send_tracker.has_unsent() {
            self.send_tracker.last_sent()
        } else {
            self.engine.commit_count()
        }
    }

    fn on_synchronize_response(&mut self, from: PeerId, commits: &[super::message::LogCommit]) -> Result<()> {
        if self.state() != State::Synchronizing {
            return Err(Error::Protocol("not synchronizing".into()));
        }
        let Some(sync_peer) = self.sync_peer else {
            return Err(Error::Protocol("too late, gave up on you".into()));
        };
        if sync_peer != from {
            return Err(Error::Protocol("sync peer mismatch".into()));
        }
        info!("Beginning synchronization");
        if let Err(err) = sync::apply(self.engine.as_ref(), commits) {
            warn!("Synchronization failed '{err}', reconnecting and re-SEARCHING");
            self.registry.reconnect(from)?;
            self.sync_peer = None;
            return self.change_state(State::Searching);
        }

        let peer_commit_count = self.registry.get(from).commit_count;
        let local = self.engine.commit_count();
        if local == peer_commit_count {
            info!(
                "Synchronization complete, at commit #{local} ({}), WAITING",
                self.engine.committed_hash()
            );
            self.sync_peer = None;
            self.change_state(State::Waiting)
        } else if local > peer_commit_count {
            warn!(
                "We have more data ({local}) than our sync peer ({peer_commit_count}), \
                 reconnecting and SEARCHING"
            );
            self.registry.reconnect(from)?;
            self.sync_peer = None;
            self.change_state(State::Searching)
        } else {
            info!(
                "Synchronization underway, at commit #{local}, {} to go",
                peer_commit_count - local
            );
            self.sync_peer = sync::select_sync_peer(&self.registry, local, self.sync_peer);
            match self.sync_peer {
                Some(peer) => {
                    self.registry.send(peer, &Message::Synchronize)?;
                    // Still alive; extend the deadline.
                    self.state_timeout = self.clock.now() + self.opts.sync_timeout + self.jitter();
                    Ok(())
                }
                None => {
                    warn!("No usable sync peer but syncing not finished, SEARCHING");
                    self.change_state(State::Searching)
                }
            }
        }
    }

    /// Accepts a new follower: sends everything it's missing and tags it
    /// subscribed. If a transaction is in flight, invites it in.
    fn on_subscribe(&mut self, from: PeerId) -> Result<()> {
        if self.state() != State::Leading {
            return Err(Error::Protocol("not leading".into()));
        }
        info!("Received SUBSCRIBE from {}, accepting new follower", self.registry.get(from).name);
        let (peer_commit_count, peer_hash) = {
            let peer = self.registry.get(from);
            (peer.commit_count, peer.committed_hash.clone())
        };
        let commits = sync::respond(
            self.engine.as_ref(),
            peer_commit_count,
            &peer_hash,
            self.sync_target(),
            true,
        )?;
        self.registry.send(from, &Message::SubscriptionApproved { commits })?;
        {
            let peer = self.registry.get_mut(from);
            if peer.subscribed {
                warn!("Peer {} was already subscribed", peer.name);
            }
            peer.subscribed = true;
        }

        if self.commit_state == CommitState::Committing {
            if let Some(new_hash) = self.engine.uncommitted_hash() {
                info!("Inviting peer into distributed transaction already underway ({new_hash})");
                let message = Message::BeginTransaction {
                    id: self.transaction_id(),
                    new_count: self.engine.commit_count() + 1,
                    new_hash,
                    leader_sent_at: self.clock.now(),
                    query: self.engine.uncommitted_query(),
                };
                self.registry.send(from, &message)?;
            }
        }
        Ok(())
    }

    fn on_subscription_approved(
        &mut self,
        from: PeerId,
        commits: &[super::message::LogCommit],
    ) -> Result<()> {
        if self.state() != State::Subscribing {
            return Err(Error::Protocol("not subscribing".into()));
        }
        if *self.lead_peer.lock() != Some(from) {
            return Err(Error::Protocol("not subscribing to you".into()));
        }
        info!("Received SUBSCRIPTION_APPROVED, final synchronization");
        if let Err(err) = sync::apply(self.engine.as_ref(), commits) {
            warn!("Subscription failed '{err}', reconnecting to leader and re-SEARCHING");
            self.registry.reconnect(from)?;
            return self.change_state(State::Searching);
        }
        info!(
            "Subscription complete, at commit #{} ({}), FOLLOWING",
            self.engine.commit_count(),
            self.engine.committed_hash()
        );
        self.change_state(State::Following)
    }

    /// Records a follower's transaction vote, if it refers to the
    /// outstanding transaction rather than a finished one.
    fn on_transaction_response(
        &mut self,
        from: PeerId,
        vote: Vote,
        id: TransactionId,
        new_count: u64,
        new_hash: &str,
    ) -> Result<()> {
        if !self.state().is_leadish() {
            return Err(Error::Protocol("not leading".into()));
        }
        // Stale votes for commits that have already resolved either carry
        // the wrong hash (rolled back and retried) or a passed ID
        // (committed). Both are ignored.
        let hash_match = self.engine.uncommitted_hash().as_deref() == Some(new_hash);
        let id_match = id == TransactionId::Quorum(self.send_tracker.last_sent() + 1);
        if !hash_match || !id_match {
            info!(
                "Peer late {vote} for transaction #{new_count} ({new_hash}) after {}, ignoring",
                if hash_match { "commit" } else { "rollback" }
            );
            return Ok(());
        }
        if new_count != self.engine.commit_count() + 1 {
            warn!(
                "Vote commit count mismatch: expected {}, got {new_count}; ignoring",
                self.engine.commit_count() + 1
            );
            return Ok(());
        }
        let peer = self.registry.get_mut(from);
        if peer.permafollower {
            warn!("Permafollower {} shouldn't approve/deny, ignoring", peer.name);
            return Ok(());
        }
        info!("Peer {} {vote} transaction #{new_count} ({new_hash})", peer.name);
        peer.transaction_response = Some(vote);
        Ok(())
    }

    fn on_escalate(&mut self, from: PeerId, id: String, command: &[u8]) -> Result<()> {
        if self.state() != State::Leading {
            if self.state() != State::StandingDown {
                warn!("Received ESCALATE but not LEADING or STANDINGDOWN, aborting command");
            }
            return self.registry.send(
                from,
                &Message::EscalateAborted { id, reason: "not leading".into() },
            );
        }
        if !self.registry.get(from).subscribed {
            return Err(Error::Protocol("not subscribed".into()));
        }
        let (request, _) =
            Frame::decode(command).map_err(|_| Error::Protocol("malformed request".into()))?;
        info!("Received ESCALATE command for '{id}' ({})", request.method);
        let mut command = Command::new(id, request);
        command.initiating_peer = Some(from);
        command.escalated = true;
        self.server.accept_command(command, true);
        Ok(())
    }

    fn on_escalate_cancel(&mut self, from: PeerId, id: &str) -> Result<()> {
        if self.state() != State::Leading {
            warn!("Received ESCALATE_CANCEL but not LEADING, ignoring");
            return Ok(());
        }
        if !self.registry.get(from).subscribed {
            return Err(Error::Protocol("not subscribed".into()));
        }
        let id = id.to_lowercase();
        info!("Received ESCALATE_CANCEL command for '{id}'");
        // The server won't cancel a command that is already committing; a
        // cancellation that close to the finish line isn't deterministic
        // anyway.
        self.server.cancel_command(&id);
        Ok(())
    }

    /// Drives the state machine forward one step. Returns true if it wants
    /// to be invoked again immediately, false to wait for network traffic.
    pub fn update(&mut self) -> Result<bool> {
        let now = self.clock.now();
        match self.state() {
            State::Searching => self.update_searching(now),
            State::Synchronizing => self.update_synchronizing(now),
            State::Waiting => self.update_waiting(now),
            State::StandingUp => self.update_standing_up(now),
            State::Leading | State::StandingDown => self.update_leading(now),
            State::Subscribing => self.update_subscribing(now),
            State::Following => self.update_following(now),
            State::Unknown => Err(Error::Internal("node in UNKNOWN state".into())),
        }
    }

    /// Runs update() until it stops requesting immediate re-runs.
    pub fn tick(&mut self) -> Result<()> {
        while self.update()? {}
        Ok(())
    }

    fn update_searching(&mut self, now: u64) -> Result<bool> {
        if self.shutdown_complete()? {
            return Ok(false);
        }

        if self.registry.is_empty() {
            info!("No peers configured, jumping to LEADING");
            self.change_state(State::Leading)?;
            self.leader_version = self.version.clone();
            return Ok(true);
        }

        let (num_full, num_logged_in_full) = self.registry.full_counts();
        let freshest = self
            .registry
            .iter()
            .filter(|(_, p)| p.logged_in)
            .max_by_key(|(_, p)| p.commit_count)
            .map(|(id, p)| (id, p.commit_count));

        info!(
            "Signed in to {num_logged_in_full} of {num_full} full peers ({} total), \
             timeout in {}ms",
            self.registry.len(),
            self.state_timeout.saturating_sub(now) / 1000
        );
        // Keep searching until at least half the full peers are in, or the
        // timeout passes and we go with whoever we have.
        if (num_logged_in_full as f64) < (num_full as f64) / 2.0 && now < self.state_timeout {
            return Ok(false);
        }
        if now >= self.state_timeout {
            info!("Timeout SEARCHING for peers, continuing");
        }

        let Some((_, freshest_count)) = freshest else {
            info!("Unable to connect to any peer, WAITING");
            self.change_state(State::Waiting)?;
            return Ok(true);
        };
        let local = self.engine.commit_count();
        if freshest_count == local {
            info!("Synchronized with the freshest peer, WAITING");
            self.change_state(State::Waiting)?;
            return Ok(true);
        }
        if freshest_count < local {
            info!("We're the freshest peer, WAITING");
            self.change_state(State::Waiting)?;
            return Ok(true);
        }

        self.sync_peer = sync::select_sync_peer(&self.registry, local, self.sync_peer);
        match self.sync_peer {
            Some(peer) => {
                self.registry.send(peer, &Message::Synchronize)?;
                self.change_state(State::Synchronizing)?;
            }
            None => {
                warn!("No usable sync peer when about to SYNCHRONIZE, going to WAITING");
                self.change_state(State::Waiting)?;
            }
        }
        Ok(true)
    }

    fn update_synchronizing(&mut self, now: u64) -> Result<bool> {
        if now > self.state_timeout {
            info!("Timed out while waiting for SYNCHRONIZE_RESPONSE, searching");
            if let Some(peer) = self.sync_peer.take() {
                self.registry.reconnect(peer)?;
            }
            self.change_state(State::Searching)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn update_waiting(&mut self, _now: u64) -> Result<bool> {
        if self.graceful_shutdown() {
            if !self.commit_in_progress() {
                // Halt the FSM here until shutdown; continuing would only
                // muddy the logs.
                info!("Graceful shutdown underway and no commit in progress, doing nothing");
                return Ok(false);
            }
            info!("Graceful shutdown underway but commit in progress, continuing");
        }

        // Survey the full logged-in peers for the freshest node, the
        // highest priority, and any current leader (or one in transition).
        let mut num_full = 0;
        let mut num_logged_in_full = 0;
        let mut freshest: Option<(PeerId, u64)> = None;
        let mut highest_priority: Option<(PeerId, i64)> = None;
        let mut current_leader: Option<PeerId> = None;
        for (id, peer) in self.registry.iter() {
            if peer.permafollower {
                continue;
            }
            num_full += 1;
            if !peer.logged_in {
                continue;
            }
            num_logged_in_full += 1;
            if freshest.map(|(_, c)| peer.commit_count > c).unwrap_or(true) {
                freshest = Some((id, peer.commit_count));
            }
            if highest_priority.map(|(_, p)| peer.priority > p).unwrap_or(true) {
                highest_priority = Some((id, peer.priority));
            }
            if matches!(peer.state, State::StandingUp | State::Leading | State::StandingDown) {
                if let Some(other) = current_leader {
                    info!(
                        "Multiple peers trying to stand up (also '{}'), let's hope they sort it out",
                        self.registry.get(other).name
                    );
                }
                current_leader = Some(id);
            }
        }

        let Some((_, highest_priority_value)) = highest_priority else {
            info!("Configured to have peers but can't connect to any, re-SEARCHING");
            self.change_state(State::Searching)?;
            return Ok(true);
        };

        // A higher-priority leader is already up; subscribe even if we're
        // not in sync with it, it will catch us up while subscribing.
        if let Some(leader) = current_leader {
            if self.priority < highest_priority_value
                && self.registry.get(leader).state == State::Leading
            {
                info!("Subscribing to leader '{}'", self.registry.get(leader).name);
                *self.lead_peer.lock() = Some(leader);
                self.leader_version = self.registry.get(leader).version.clone();
                self.registry.send(leader, &Message::Subscribe)?;
                self.change_state(State::Subscribing)?;
                return Ok(true);
            }
        }

        // Somebody has commits we don't; go resynchronize.
        if freshest.map(|(_, c)| c > self.engine.commit_count()).unwrap_or(false) {
            info!("Lost synchronization while waiting, re-SEARCHING");
            self.change_state(State::Searching)?;
            return Ok(true);
        }

        // No leader and we're in sync; if we're the highest real priority
        // and can see a quorum, it's our turn to stand up.
        if current_leader.is_none()
            && num_logged_in_full * 2 >= num_full
            && self.priority > 0
            && self.priority > highest_priority_value
        {
            info!("No leader and we're highest priority, STANDINGUP");
            for (_, peer) in self.registry.iter_mut() {
                peer.standup_response = None;
            }
            self.change_state(State::StandingUp)?;
            return Ok(true);
        }

        debug!(
            "Connected to {num_logged_in_full} of {num_full} full peers, priority={}",
            self.priority
        );
        Ok(false)
    }

    fn update_standing_up(&mut self, now: u64) -> Result<bool> {
        if self.graceful_shutdown() {
            info!("Shutting down while standing up, setting state to SEARCHING");
            self.change_state(State::Searching)?;
            return Ok(true);
        }

        let mut num_full = 0;
        let mut num_logged_in_full = 0;
        let mut all_responded = true;
        let mut denied: Option<PeerId> = None;
        for (id, peer) in self.registry.iter() {
            if peer.permafollower {
                continue;
            }
            num_full += 1;
            if !peer.logged_in {
                // Not logged in is tacit approval.
                continue;
            }
            num_logged_in_full += 1;
            match peer.standup_response {
                None => all_responded = false,
                Some(Vote::Approve) => {}
                Some(Vote::Deny) => denied = Some(id),
            }
        }
        if let Some(peer) = denied {
            info!("Peer {} refused our standup, cancel and re-SEARCH", self.registry.get(peer).name);
            self.change_state(State::Searching)?;
            return Ok(true);
        }
        if all_responded && num_logged_in_full * 2 >= num_full {
            info!("All peers approved standup, going LEADING");
            self.change_state(State::Leading)?;
            self.leader_version = self.version.clone();
            return Ok(true);
        }
        if now > self.state_timeout {
            info!("Timed out waiting for STANDUP approval, reconnect all and re-SEARCHING");
            self.registry.reconnect_all()?;
            self.change_state(State::Searching)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// The LEADING / STANDINGDOWN write path. New transactions only start
    /// while LEADING; existing ones conclude in either state.
    fn update_leading(&mut self, now: u64) -> Result<bool> {
        // Stream any outstanding async commits, unless a distributed commit
        // is underway (they'd interleave as nested transactions).
        if !self.commit_in_progress() {
            self.send_outstanding_transactions()?;
        }

        // A distributed transaction is out; tally the votes.
        if self.commit_state == CommitState::Committing {
            let mut num_full_peers = 0;
            let mut num_full_followers = 0;
            let mut num_responded = 0;
            let mut num_approved = 0;
            let mut num_denied = 0;
            for (_, peer) in self.registry.iter() {
                if peer.permafollower {
                    continue;
                }
                num_full_peers += 1;
                if !peer.subscribed {
                    continue;
                }
                num_full_followers += 1;
                match peer.transaction_response {
                    None => {}
                    Some(Vote::Approve) => {
                        num_responded += 1;
                        num_approved += 1;
                    }
                    Some(Vote::Deny) => {
                        warn!("Peer '{}' denied transaction", peer.name);
                        num_responded += 1;
                        num_denied += 1;
                    }
                }
            }

            let majority_approved = num_approved * 2 >= num_full_peers;
            let consistent_enough = match self.commit_consistency {
                Consistency::Async => true,
                Consistency::One => num_full_peers == 0 || num_approved > 0,
                Consistency::Quorum => majority_approved,
            };
            // True with no responses if there are no subscribed followers.
            let everybody_responded = num_responded >= num_full_followers;
            debug!(
                "num_full_peers={num_full_peers}, num_full_followers={num_full_followers}, \
                 num_responded={num_responded}, num_approved={num_approved}, \
                 consistency={}, consistent_enough={consistent_enough}, \
                 everybody_responded={everybody_responded}",
                self.commit_consistency
            );

            if num_denied > 0 || (everybody_responded && !consistent_enough) {
                info!(
                    "Rolling back transaction: denied={num_denied}, \
                     everybody_responded={everybody_responded} but not consistent enough"
                );
                self.rollback_distributed()?;
            } else if consistent_enough {
                match self.engine.commit()? {
                    CommitOutcome::Conflict => {
                        info!(
                            "Conflict committing {} transaction, rolling back",
                            self.commit_consistency
                        );
                        self.rollback_distributed()?;
                    }
                    CommitOutcome::Committed => {
                        let timing = self.engine.last_transaction_timing();
                        info!(
                            "Committed leader transaction #{} ({}) at {}: {} of {} approved, \
                             {}ms total",
                            self.engine.commit_count(),
                            self.engine.committed_hash(),
                            self.commit_consistency,
                            num_approved,
                            num_full_peers,
                            timing.total_us / 1000
                        );
                        let message = Message::CommitTransaction {
                            id: self.transaction_id(),
                            commit_count: self.engine.commit_count(),
                            hash: self.engine.committed_hash(),
                        };
                        self.registry.broadcast(&message, true)?;
                        // This one's sent; clear the drained queue.
                        self.engine.committed_transactions();
                        self.send_tracker.set_last_sent(self.engine.commit_count());
                        self.commit_state = CommitState::Success;
                    }
                }
            } else {
                // Wait for more votes from the network.
                info!("Waiting to commit, consistency={}", self.commit_consistency);
                return Ok(false);
            }

            // Every path but the wait above resolves the transaction, so
            // the commit window is over.
            self.release_commit_lock();
        }

        // A commit has been requested; open the commit window and put the
        // transaction to the followers. Starting it here (and returning
        // true) means we never stand down while the server keeps feeding us
        // transactions.
        if self.commit_state == CommitState::Waiting {
            self.acquire_commit_lock();
            self.commit_state = CommitState::Committing;
            info!("Beginning {} commit", self.commit_consistency);

            // Anything already committed must be streamed before this
            // transaction; nothing new can arrive while we hold the lock.
            self.send_outstanding_transactions()?;

            let commit_count = self.engine.commit_count();
            if let Err(err) = self.engine.prepare() {
                // Prepare only fails if the database is corrupt.
                self.release_commit_lock();
                return Err(Error::Internal(format!("failed to prepare transaction: {err}")));
            }
            let Some(new_hash) = self.engine.uncommitted_hash() else {
                self.release_commit_lock();
                return Err(Error::Internal("prepared transaction has no hash".into()));
            };
            for (_, peer) in self.registry.iter_mut() {
                peer.transaction_response = None;
            }
            info!("Beginning distributed transaction for commit #{} ({new_hash})", commit_count + 1);
            let message = Message::BeginTransaction {
                id: self.transaction_id(),
                new_count: commit_count + 1,
                new_hash,
                leader_sent_at: now,
                query: self.engine.uncommitted_query(),
            };
            self.registry.broadcast(&message, true)?;
            // Re-update immediately, so an async commit resolves right away.
            return Ok(true);
        }

        // Should we stand down? In-flight commits finish first, above.
        if self.state() == State::Leading {
            let mut stand_down_reason: Option<String> = None;
            if self.graceful_shutdown() {
                stand_down_reason = Some("shutting down, setting priority 1".into());
                self.priority = 1;
            } else {
                for (_, peer) in self.registry.iter() {
                    if peer.state == State::Leading {
                        stand_down_reason =
                            Some(format!("found another LEADER ({})", peer.name));
                    } else if peer.state == State::Waiting {
                        if peer.priority > self.priority {
                            stand_down_reason = Some(format!(
                                "found higher priority WAITING peer ({})",
                                peer.name
                            ));
                        } else if peer.commit_count > self.engine.commit_count() {
                            stand_down_reason = Some(format!(
                                "found WAITING peer ({}) with more data than us",
                                peer.name
                            ));
                        }
                    }
                }
            }
            if let Some(reason) = stand_down_reason {
                info!("Standing down: {reason}");
                self.change_state(State::StandingDown)?;
            }
        }

        // Nothing is committing at this point; finish standing down once
        // the server quiesces (or the timer expires).
        if self.state() == State::StandingDown {
            if self.stand_down_deadline.map(|d| now >= d).unwrap_or(false) {
                warn!("Timeout STANDINGDOWN, giving up on server and continuing");
            } else if !self.server.can_stand_down() {
                info!("Can't switch from STANDINGDOWN to SEARCHING yet, server prevented it");
                return Ok(false);
            }
            info!("STANDDOWN complete, SEARCHING");
            self.change_state(State::Searching)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Broadcasts ROLLBACK_TRANSACTION, rolls back locally, and marks the
    /// commit failed.
    fn rollback_distributed(&mut self) -> Result<()> {
        let message = Message::RollbackTransaction {
            id: self.transaction_id(),
            new_hash: self.engine.uncommitted_hash().unwrap_or_default(),
        };
        self.registry.broadcast(&message, true)?;
        self.engine.rollback();
        self.commit_state = CommitState::Failed;
        Ok(())
    }

    fn update_subscribing(&mut self, now: u64) -> Result<bool> {
        if now > self.state_timeout {
            info!("Timed out waiting for SUBSCRIPTION_APPROVED, reconnecting leader, re-SEARCHING");
            let lead = self.lead_peer.lock().take();
            if let Some(peer) = lead {
                self.registry.reconnect(peer)?;
            }
            self.change_state(State::Searching)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn update_following(&mut self, _now: u64) -> Result<bool> {
        if self.graceful_shutdown() && self.nothing_blocking_shutdown() {
            info!("Stopping FOLLOWING in order to gracefully shut down, SEARCHING");
            self.change_state(State::Searching)?;
            return Ok(false);
        }

        let lead = *self.lead_peer.lock();
        let Some(lead) = lead else {
            return Err(Error::Internal("following without a leader".into()));
        };
        let lead_state = self.registry.get(lead).state;
        if !lead_state.is_leadish() {
            // Wait for the leader's final transactions before searching:
            // only its departure from LEADING/STANDINGDOWN releases us.
            info!("Leader stepping down, re-queueing commands");
            self.escalations.requeue_all(self.server.as_ref());
            if self.engine.uncommitted_hash().is_some() {
                warn!("Leader stepped down with transaction in progress, rolling back");
                self.engine.rollback();
            }
            self.change_state(State::Searching)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Streams locally committed transactions that haven't been broadcast
    /// yet as ASYNC BEGIN/COMMIT pairs. Takes the commit lock unless the
    /// caller already holds it.
    fn send_outstanding_transactions(&mut self) -> Result<()> {
        let lock_here = !self.commit_lock_held;
        if lock_here {
            self.engine.commit_lock().lock();
        }
        let result = self.send_outstanding_locked();
        if lock_here {
            self.engine.commit_lock().unlock();
        }
        result
    }

    fn send_outstanding_locked(&mut self) -> Result<()> {
        if !self.send_tracker.has_unsent() {
            return Ok(());
        }
        let sent_at = self.clock.now();
        for (id, query, hash) in self.engine.committed_transactions() {
            if id <= self.send_tracker.last_sent() {
                continue;
            }
            let begin = Message::BeginTransaction {
                id: TransactionId::Async(id),
                new_count: id,
                new_hash: hash.clone(),
                leader_sent_at: sent_at,
                query,
            };
            self.registry.broadcast(&begin, true)?;
            for (_, peer) in self.registry.iter_mut() {
                peer.transaction_response = None;
            }
            let commit = Message::CommitTransaction {
                id: TransactionId::Async(id),
                commit_count: id,
                hash,
            };
            self.registry.broadcast(&commit, true)?;
            self.send_tracker.set_last_sent(id);
        }
        self.send_tracker.clear_unsent();
        Ok(())
    }

    /// The ID of the outstanding (or next) distributed transaction.
    fn transaction_id(&self) -> TransactionId {
        let next = self.send_tracker.last_sent() + 1;
        match self.commit_consistency {
            Consistency::Async => TransactionId::Async(next),
            _ => TransactionId::Quorum(next),
        }
    }

    fn acquire_commit_lock(&mut self) {
        if !self.commit_lock_held {
            self.engine.commit_lock().lock();
            self.commit_lock_held = true;
        }
    }

    fn release_commit_lock(&mut self) {
        if self.commit_lock_held {
            self.engine.commit_lock().unlock();
            self.commit_lock_held = false;
        }
    }

    fn jitter(&self) -> u64 {
        if self.opts.jitter == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=self.opts.jitter)
    }

    /// Transitions to a new state, running entry and exit side effects and
    /// broadcasting the change. Never called while holding the commit lock
    /// mid-window except to leave the leadish states, which releases it.
    fn change_state(&mut self, new: State) -> Result<()> {
        let old = self.state();
        if new == old {
            return Ok(());
        }

        // Leaving FOLLOWING: stop the replication workers and wait for
        // them; any in-flight transaction rolls back.
        if old == State::Following {
            self.pipeline.shutdown();
        }

        info!("Switching from '{old}' to '{new}'");
        let timeout = match new {
            State::StandingUp => self.opts.standup_timeout + self.jitter(),
            State::Searching | State::Subscribing => self.opts.recv_timeout + self.jitter(),
            State::Synchronizing => self.opts.sync_timeout + self.jitter(),
            _ => 0,
        };
        self.state_timeout = self.clock.now() + timeout;

        if old.is_leadish() && !new.is_leadish() {
            self.leader_version.clear();
            if self.commit_in_progress() {
                warn!("Stopping {old} with commit in progress, canceling");
                self.commit_state = CommitState::Failed;
                self.engine.rollback();
            }
            self.release_commit_lock();
            // Stream whatever is pending before the switch completes, so it
            // reaches the followers before they unsubscribe.
            self.send_outstanding_transactions()?;
        }

        if !new.has_leader() {
            *self.lead_peer.lock() = None;
        }

        match new {
            State::Leading => {
                // Seed the send tracking from the current database state.
                self.engine.commit_lock().lock();
                self.send_tracker.clear_unsent();
                self.send_tracker.set_last_sent(self.engine.commit_count());
                self.engine.committed_transactions();
                self.engine.commit_lock().unlock();
            }
            State::StandingDown => {
                self.stand_down_deadline = Some(self.clock.now() + self.opts.standdown_timeout);
            }
            State::Searching => {
                if !self.escalations.is_empty() {
                    warn!(
                        "Entering SEARCHING with {} escalations outstanding, clearing",
                        self.escalations.len()
                    );
                    self.escalations.clear();
                }
            }
            State::Waiting => {
                // First WAITING entry: caught up and ready to join the
                // cluster, so assume our real priority from now on.
                self.priority = self.original_priority;
            }
            _ => {}
        }

        *self.state.write() = new;
        self.state_change_count += 1;
        // Broadcast to everyone connected, logged in or not, so nobody
        // misses a transition that races their LOGIN.
        self.registry.broadcast(
            &Message::NodeState {
                state: new,
                priority: self.priority,
                state_change_count: self.state_change_count,
            },
            false,
        )
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.release_commit_lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Memory;
    use crate::server::Channel;
    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;

    /// A manually advanced clock.
    pub struct TestClock(AtomicU64);

    impl TestClock {
        pub fn new() -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(1_000_000)))
        }

        pub fn advance(&self, us: u64) {
            self.0.fetch_add(us, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        node: Node,
        engine: Arc<Memory>,
        server: Arc<Channel>,
        clock: Arc<TestClock>,
        effects: Receiver<Effect>,
    }

    fn fixture(priority: i64, peers: Vec<PeerConfig>) -> Fixture {
        let engine = Arc::new(Memory::new());
        let server = Arc::new(Channel::new());
        let clock = TestClock::new();
        let (tx, effects) = crossbeam::channel::unbounded();
        let node = Node::new(
            "node0",
            "1.0.0",
            priority,
            peers,
            engine.clone(),
            server.clone(),
            clock.clone(),
            tx,
            Options { jitter: 0, ..Options::default() },
        )
        .unwrap();
        Fixture { node, engine, server, clock, effects }
    }

    fn login_frame(priority: i64, state: State, permafollower: bool) -> Frame {
        Message::Login { priority, state, version: "1.0.0".into(), permafollower }
            .to_frame(&super::super::message::Stamp { commit_count: 0, hash: String::new() })
    }

    #[test]
    fn empty_cluster_bootstraps_to_leading() {
        let mut f = fixture(100, vec![]);
        assert_eq!(f.node.state(), State::Searching);
        assert!(f.node.update().unwrap());
        assert_eq!(f.node.state(), State::Leading);
        assert_eq!(f.engine.commit_count(), 0);
        assert_eq!(f.node.leader_version(), "1.0.0");
    }

    #[test]
    fn priority_is_transient_until_waiting() {
        let mut f = fixture(100, vec![PeerConfig::new("peer1", "peer1:9000")]);
        assert_eq!(f.node.priority(), -1);
        // Timeout with no peers reachable passes through WAITING (which
        // assigns the configured priority) and back to SEARCHING.
        f.clock.advance(DEFAULT_RECV_TIMEOUT + 1);
        f.node.tick().unwrap();
        assert_eq!(f.node.state(), State::Searching);
        assert_eq!(f.node.priority(), 100);
    }

    #[test]
    fn login_validates_permafollower_agreement() {
        let mut f = fixture(
            100,
            vec![
                PeerConfig::new("full", "full:9000"),
                PeerConfig::new("perma", "perma:9000").permafollower(),
            ],
        );
        f.node.on_connect(0).unwrap();
        f.node.on_connect(1).unwrap();

        // A full peer claiming to be a permafollower is a protocol error,
        // which resets the session.
        f.node.receive(0, &login_frame(0, State::Searching, true)).unwrap();
        assert!(f.effects.try_iter().any(|e| e == Effect::Reconnect { to: 0 }));

        // A permafollower with a nonzero priority is a protocol error.
        f.node.receive(1, &login_frame(50, State::Searching, true)).unwrap();
        assert!(f.effects.try_iter().any(|e| e == Effect::Reconnect { to: 1 }));

        // Valid logins are recorded and reported to the server.
        f.node.on_connect(0).unwrap();
        f.node.on_connect(1).unwrap();
        f.node.receive(0, &login_frame(50, State::Waiting, false)).unwrap();
        f.node.receive(1, &login_frame(0, State::Searching, true)).unwrap();
        assert_eq!(f.server.logins(), vec![0, 1]);
    }

    #[test]
    fn messages_require_login() {
        let mut f = fixture(100, vec![PeerConfig::new("peer1", "peer1:9000")]);
        f.node.on_connect(0).unwrap();
        let frame = Message::Synchronize
            .to_frame(&super::super::message::Stamp { commit_count: 0, hash: String::new() });
        f.node.receive(0, &frame).unwrap();
        // Session reset, no response.
        let effects: Vec<_> = f.effects.try_iter().collect();
        assert!(effects.iter().any(|e| matches!(e, Effect::Reconnect { to: 0 })));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::Send { frame, .. } if frame.method == "SYNCHRONIZE_RESPONSE")));
    }

    #[test]
    fn start_commit_rejects_reentry() {
        let mut f = fixture(100, vec![]);
        f.node.tick().unwrap();
        f.engine.begin().unwrap();
        f.engine.write_unmodified("INSERT INTO t VALUES (1)").unwrap();
        f.node.start_commit(Consistency::Async).unwrap();
        assert!(f.node.start_commit(Consistency::Async).is_err());
        f.node.tick().unwrap();
        assert_eq!(f.node.commit_state(), CommitState::Success);
        assert_eq!(f.engine.commit_count(), 1);
        // A new commit is allowed once the previous one resolved.
        f.engine.begin().unwrap();
        f.engine.write_unmodified("INSERT INTO t VALUES (2)").unwrap();
        f.node.start_commit(Consistency::Async).unwrap();
        f.node.tick().unwrap();
        assert_eq!(f.engine.commit_count(), 2);
    }

    #[test]
    fn solo_leader_commit_conflict_fails() {
        let mut f = fixture(100, vec![]);
        f.node.tick().unwrap();
        f.engine.begin().unwrap();
        f.engine.write_unmodified("INSERT INTO t VALUES (1)").unwrap();
        f.engine.conflict_next_commit();
        f.node.start_commit(Consistency::Quorum).unwrap();
        f.node.tick().unwrap();
        assert_eq!(f.node.commit_state(), CommitState::Failed);
        assert_eq!(f.engine.commit_count(), 0);
        assert_eq!(f.engine.uncommitted_hash(), None);
        // The commit lock was released.
        assert!(f.engine.commit_lock().try_lock());
        f.engine.commit_lock().unlock();
    }

    #[test]
    fn searching_counts_peers_before_waiting() {
        let mut f = fixture(
            100,
            vec![PeerConfig::new("a", "a:9000"), PeerConfig::new("b", "b:9000")],
        );
        // With nobody logged in and no timeout, stay SEARCHING.
        assert!(!f.node.update().unwrap());
        assert_eq!(f.node.state(), State::Searching);

        // One peer (half of two) logs in at our commit count; we pass
        // through WAITING and, as highest priority with quorum, stand up.
        f.node.on_connect(0).unwrap();
        f.node.receive(0, &login_frame(50, State::Waiting, false)).unwrap();
        f.node.tick().unwrap();
        assert_eq!(f.node.state(), State::StandingUp);
        assert!(f
            .effects
            .try_iter()
            .any(|e| matches!(e, Effect::Send { frame, .. } if frame.method == "STATE")));
    }

    #[test]
    fn status_snapshot() {
        let f = fixture(100, vec![PeerConfig::new("a", "a:9000")]);
        let status = f.node.status();
        assert_eq!(status.name, "node0");
        assert_eq!(status.state, State::Searching);
        assert_eq!(status.commit_count, 0);
        assert_eq!(status.leader, None);
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].name, "a");
    }
}
