use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// A node (or observed peer) state in the cluster state machine.
///
/// Every node starts out SEARCHING, where it tries to establish its peer
/// connections. It then SYNCHRONIZES with the freshest peer, downloading
/// whatever commits it is missing, and WAITS until the highest-priority
/// node stands up as leader. All other nodes SUBSCRIBE to the leader and
/// become followers. When the leader stands down, everybody returns to
/// SEARCHING and starts over.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The remote state couldn't be parsed, or there is no known leader.
    Unknown,
    /// Establishing peer connections, looking for the freshest peer.
    Searching,
    /// Waiting for a SYNCHRONIZE_RESPONSE from the chosen sync peer.
    Synchronizing,
    /// Caught up; waiting for a leader to emerge or stand up ourselves.
    Waiting,
    /// Soliciting standup approval from all logged-in full peers.
    StandingUp,
    /// Leading: serializing and distributing write transactions.
    Leading,
    /// Concluding in-flight transactions before returning to SEARCHING.
    StandingDown,
    /// Waiting for SUBSCRIPTION_APPROVED from the chosen leader.
    Subscribing,
    /// Steady-state follower, replicating the leader's transactions.
    Following,
}

impl State {
    /// Returns true if the state distributes transactions (leader side).
    pub fn is_leadish(self) -> bool {
        matches!(self, State::Leading | State::StandingDown)
    }

    /// Returns true if a graceful shutdown can complete from this state.
    pub fn can_complete_shutdown(self) -> bool {
        matches!(self, State::Searching | State::Synchronizing | State::Waiting)
    }

    /// Returns true if the state holds a leader pointer.
    pub fn has_leader(self) -> bool {
        matches!(self, State::Subscribing | State::Following)
    }

    /// Returns true if `from` → `to` is a legal transition. Anything else
    /// observed on a peer is anomalous (but tolerated).
    pub fn valid_transition(from: State, to: State) -> bool {
        use State::*;
        match from {
            Unknown => false,
            Searching => matches!(to, Synchronizing | Waiting | Leading),
            Synchronizing => matches!(to, Searching | Waiting),
            Waiting => matches!(to, Searching | StandingUp | Subscribing),
            StandingUp => matches!(to, Searching | Leading),
            Leading => matches!(to, Searching | StandingDown),
            StandingDown => matches!(to, Searching),
            Subscribing => matches!(to, Searching | Following),
            Following => matches!(to, Searching),
        }
    }

    /// Parses a state from its wire name. Unrecognized names map to Unknown
    /// rather than erroring, since peers may run newer versions.
    pub fn parse(name: &str) -> State {
        match name {
            "SEARCHING" => State::Searching,
            "SYNCHRONIZING" => State::Synchronizing,
            "WAITING" => State::Waiting,
            "STANDINGUP" => State::StandingUp,
            "LEADING" => State::Leading,
            "STANDINGDOWN" => State::StandingDown,
            "SUBSCRIBING" => State::Subscribing,
            "FOLLOWING" => State::Following,
            _ => State::Unknown,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            State::Unknown => "UNKNOWN",
            State::Searching => "SEARCHING",
            State::Synchronizing => "SYNCHRONIZING",
            State::Waiting => "WAITING",
            State::StandingUp => "STANDINGUP",
            State::Leading => "LEADING",
            State::StandingDown => "STANDINGDOWN",
            State::Subscribing => "SUBSCRIBING",
            State::Following => "FOLLOWING",
        })
    }
}

/// The leader-side distributed commit lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitState {
    /// No commit has been requested yet.
    Uninitialized,
    /// A commit has been requested; the next update() starts it.
    Waiting,
    /// BEGIN_TRANSACTION is out; counting follower responses.
    Committing,
    /// The last commit succeeded.
    Success,
    /// The last commit was rolled back.
    Failed,
}

impl CommitState {
    /// Returns true if a distributed commit is underway.
    pub fn in_progress(self) -> bool {
        matches!(self, CommitState::Waiting | CommitState::Committing)
    }
}

/// The write consistency level of a distributed commit: how many follower
/// approvals the leader waits for before committing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Don't wait for anybody.
    Async,
    /// Wait for at least one full peer (if there are any).
    One,
    /// Wait for a strict majority of full peers.
    Quorum,
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Consistency::Async => "ASYNC",
            Consistency::One => "ONE",
            Consistency::Quorum => "QUORUM",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(State::Searching, State::Synchronizing => true)]
    #[test_case(State::Searching, State::Waiting => true)]
    #[test_case(State::Searching, State::Leading => true)]
    #[test_case(State::Searching, State::Following => false)]
    #[test_case(State::Synchronizing, State::Waiting => true)]
    #[test_case(State::Synchronizing, State::Leading => false)]
    #[test_case(State::Waiting, State::StandingUp => true)]
    #[test_case(State::Waiting, State::Subscribing => true)]
    #[test_case(State::Waiting, State::Leading => false)]
    #[test_case(State::StandingUp, State::Leading => true)]
    #[test_case(State::StandingUp, State::StandingDown => false)]
    #[test_case(State::Leading, State::StandingDown => true)]
    #[test_case(State::Leading, State::Searching => true)]
    #[test_case(State::StandingDown, State::Searching => true)]
    #[test_case(State::StandingDown, State::Leading => false)]
    #[test_case(State::Subscribing, State::Following => true)]
    #[test_case(State::Following, State::Searching => true)]
    #[test_case(State::Following, State::Subscribing => false)]
    fn valid_transition(from: State, to: State) -> bool {
        State::valid_transition(from, to)
    }

    #[test]
    fn parse_roundtrip() {
        for state in [
            State::Searching,
            State::Synchronizing,
            State::Waiting,
            State::StandingUp,
            State::Leading,
            State::StandingDown,
            State::Subscribing,
            State::Following,
        ] {
            assert_eq!(State::parse(&state.to_string()), state);
        }
        assert_eq!(State::parse("SOMETHING_NEW"), State::Unknown);
    }

    #[test]
    fn commit_state_progress() {
        assert!(!CommitState::Uninitialized.in_progress());
        assert!(CommitState::Waiting.in_progress());
        assert!(CommitState::Committing.in_progress());
        assert!(!CommitState::Success.in_progress());
        assert!(!CommitState::Failed.in_progress());
    }
}
