//! The cluster consensus and replication core: a priority-elected state
//! machine that maintains a single totally-ordered commit log replicated
//! across peers, synchronizes lagging nodes, and drives distributed write
//! transactions with configurable consistency.

mod escalation;
mod message;
mod node;
mod peer;
mod replication;
mod state;
mod sync;

pub use message::{Effect, LogCommit, Message, PeerId, Stamp, TransactionId, Vote};
pub use node::{
    Clock, Node, Options, PeerStatus, SendTracker, Status, WallClock, DEFAULT_RECV_TIMEOUT,
    STANDDOWN_TIMEOUT, STANDUP_TIMEOUT, SYNCHRONIZING_RECV_TIMEOUT, TIMEOUT_JITTER,
};
pub use peer::{Peer, PeerConfig, PeerRegistry};
pub use state::{CommitState, Consistency, State};
pub use sync::SYNC_BATCH;
