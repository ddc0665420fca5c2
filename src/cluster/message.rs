use super::state::State;
use crate::codec::Frame;
use crate::error::{Error, Result};

use std::fmt;

/// A peer ID, indexing into the node's peer registry.
pub type PeerId = u8;

/// The `(CommitCount, Hash)` pair stamped onto every outbound frame,
/// advertising the sender's committed database state at send time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stamp {
    pub commit_count: u64,
    pub hash: String,
}

/// An approve/deny response, used both for standup ballots and transaction
/// votes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    Approve,
    Deny,
}

impl Vote {
    fn parse(s: &str) -> Result<Vote> {
        match s {
            "approve" => Ok(Vote::Approve),
            "deny" => Ok(Vote::Deny),
            other => Err(Error::Protocol(format!("invalid response {other}"))),
        }
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Vote::Approve => "approve",
            Vote::Deny => "deny",
        })
    }
}

/// A distributed transaction ID. Asynchronously streamed transactions are
/// textually prefixed with `ASYNC_`; followers don't vote on those.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionId {
    Quorum(u64),
    Async(u64),
}

impl TransactionId {
    pub fn number(self) -> u64 {
        match self {
            TransactionId::Quorum(n) | TransactionId::Async(n) => n,
        }
    }

    pub fn is_async(self) -> bool {
        matches!(self, TransactionId::Async(_))
    }

    fn parse(s: &str) -> Result<TransactionId> {
        let (variant, number): (fn(u64) -> TransactionId, &str) = match s.strip_prefix("ASYNC_") {
            Some(rest) => (TransactionId::Async, rest),
            None => (TransactionId::Quorum, s),
        };
        number
            .parse()
            .map(variant)
            .map_err(|_| Error::Protocol(format!("malformed transaction ID {s}")))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransactionId::Quorum(n) => write!(f, "{n}"),
            TransactionId::Async(n) => write!(f, "ASYNC_{n}"),
        }
    }
}

/// A historical commit served during synchronization, embedded as a COMMIT
/// sub-frame inside SYNCHRONIZE_RESPONSE and SUBSCRIPTION_APPROVED.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogCommit {
    /// 1-based commit index, contiguous.
    pub index: u64,
    /// The commit hash after applying the query.
    pub hash: String,
    /// The SQL text.
    pub query: String,
}

impl LogCommit {
    fn to_frame(&self) -> Frame {
        let mut frame = Frame::new("COMMIT");
        frame.headers.set("CommitIndex", self.index.to_string());
        frame.headers.set("Hash", self.hash.clone());
        frame.payload = self.query.clone().into_bytes();
        frame
    }

    fn from_frame(frame: &Frame) -> Result<LogCommit> {
        if !frame.method.eq_ignore_ascii_case("COMMIT") {
            return Err(Error::Protocol(format!("expecting COMMIT, got {}", frame.method)));
        }
        Ok(LogCommit {
            index: frame.require_u64("CommitIndex")?,
            hash: frame.require("Hash")?.to_string(),
            query: frame.text()?,
        })
    }
}

/// A message passed between cluster nodes, keyed by its wire method line.
/// Conversions to and from [`Frame`] validate the method-specific required
/// headers; the `CommitCount`/`Hash` stamp required on every frame is
/// carried separately as [`Stamp`].
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// The first message exchanged on a new peer connection.
    Login { priority: i64, state: State, version: String, permafollower: bool },
    /// Broadcast on every state change (and implicitly on every send via
    /// the stamp).
    NodeState { state: State, priority: i64, state_change_count: u64 },
    /// A ballot responding to an observed transition to STANDINGUP.
    StandupResponse { response: Vote, state_change_count: u64, reason: String },
    /// Request missing commits from the sync peer.
    Synchronize,
    /// A batch of commits answering SYNCHRONIZE.
    SynchronizeResponse { commits: Vec<LogCommit> },
    /// Ask the leader to accept us as a follower.
    Subscribe,
    /// The leader's acceptance, carrying all commits the follower lacks.
    SubscriptionApproved { commits: Vec<LogCommit> },
    /// Leader → followers: start a distributed transaction.
    BeginTransaction {
        id: TransactionId,
        new_count: u64,
        new_hash: String,
        leader_sent_at: u64,
        query: String,
    },
    /// Follower → leader: the transaction prepared cleanly.
    ApproveTransaction { id: TransactionId, new_count: u64, new_hash: String },
    /// Follower → leader: the transaction could not be prepared.
    DenyTransaction { id: TransactionId, new_count: u64, new_hash: String },
    /// Leader → followers: commit the outstanding transaction.
    CommitTransaction { id: TransactionId, commit_count: u64, hash: String },
    /// Leader → followers: roll back the outstanding transaction.
    RollbackTransaction { id: TransactionId, new_hash: String },
    /// Follower → leader: process this client command for us.
    Escalate { id: String, command: Vec<u8> },
    /// Follower → leader: never mind, the client went away.
    EscalateCancel { id: String },
    /// Leader → follower: the escalated command's response.
    EscalateResponse { id: String, response: Vec<u8> },
    /// Leader → follower: the escalated command won't be processed.
    EscalateAborted { id: String, reason: String },
    /// Operational commands forwarded verbatim to the command server.
    CrashCommand(Frame),
    BroadcastCommand(Frame),
}

impl Message {
    /// Returns the wire method line for this message.
    pub fn method(&self) -> &str {
        match self {
            Message::Login { .. } => "LOGIN",
            Message::NodeState { .. } => "STATE",
            Message::StandupResponse { .. } => "STANDUP_RESPONSE",
            Message::Synchronize => "SYNCHRONIZE",
            Message::SynchronizeResponse { .. } => "SYNCHRONIZE_RESPONSE",
            Message::Subscribe => "SUBSCRIBE",
            Message::SubscriptionApproved { .. } => "SUBSCRIPTION_APPROVED",
            Message::BeginTransaction { .. } => "BEGIN_TRANSACTION",
            Message::ApproveTransaction { .. } => "APPROVE_TRANSACTION",
            Message::DenyTransaction { .. } => "DENY_TRANSACTION",
            Message::CommitTransaction { .. } => "COMMIT_TRANSACTION",
            Message::RollbackTransaction { .. } => "ROLLBACK_TRANSACTION",
            Message::Escalate { .. } => "ESCALATE",
            Message::EscalateCancel { .. } => "ESCALATE_CANCEL",
            Message::EscalateResponse { .. } => "ESCALATE_RESPONSE",
            Message::EscalateAborted { .. } => "ESCALATE_ABORTED",
            Message::CrashCommand(frame) | Message::BroadcastCommand(frame) => &frame.method,
        }
    }

    /// Parses a wire frame into the sender's stamp and the typed message.
    /// Every frame must carry `CommitCount` and `Hash`; missing either is
    /// fatal to the message.
    pub fn from_frame(frame: &Frame) -> Result<(Stamp, Message)> {
        let stamp = Stamp {
            commit_count: frame.require_u64("CommitCount")?,
            hash: frame.require("Hash")?.to_string(),
        };
        let message = match frame.method.to_ascii_uppercase().as_str() {
            "LOGIN" => Message::Login {
                priority: frame.require_i64("Priority")?,
                state: State::parse(frame.require("State")?),
                version: frame.require("Version")?.to_string(),
                permafollower: frame.require("Permafollower")? == "true",
            },
            "STATE" => Message::NodeState {
                state: State::parse(frame.require("State")?),
                priority: frame.require_i64("Priority")?,
                state_change_count: frame.require_u64("StateChangeCount")?,
            },
            "STANDUP_RESPONSE" => Message::StandupResponse {
                response: Vote::parse(frame.require("Response")?)?,
                state_change_count: frame.require_u64("StateChangeCount")?,
                reason: frame.headers.get("Reason").unwrap_or_default().to_string(),
            },
            "SYNCHRONIZE" => Message::Synchronize,
            "SYNCHRONIZE_RESPONSE" => {
                Message::SynchronizeResponse { commits: decode_commits(frame)? }
            }
            "SUBSCRIBE" => Message::Subscribe,
            "SUBSCRIPTION_APPROVED" => {
                Message::SubscriptionApproved { commits: decode_commits(frame)? }
            }
            "BEGIN_TRANSACTION" => Message::BeginTransaction {
                id: TransactionId::parse(frame.require("ID")?)?,
                new_count: frame.require_u64("NewCount")?,
                new_hash: frame.require("NewHash")?.to_string(),
                leader_sent_at: frame.require_u64("leaderSendTime")?,
                query: frame.text()?,
            },
            "APPROVE_TRANSACTION" => Message::ApproveTransaction {
                id: TransactionId::parse(frame.require("ID")?)?,
                new_count: frame.require_u64("NewCount")?,
                new_hash: frame.require("NewHash")?.to_string(),
            },
            "DENY_TRANSACTION" => Message::DenyTransaction {
                id: TransactionId::parse(frame.require("ID")?)?,
                new_count: frame.require_u64("NewCount")?,
                new_hash: frame.require("NewHash")?.to_string(),
            },
            "COMMIT_TRANSACTION" => Message::CommitTransaction {
                id: TransactionId::parse(frame.require("ID")?)?,
                commit_count: frame.require_u64("CommitCount")?,
                hash: frame.require("Hash")?.to_string(),
            },
            "ROLLBACK_TRANSACTION" => Message::RollbackTransaction {
                id: TransactionId::parse(frame.require("ID")?)?,
                new_hash: frame.require("NewHash")?.to_string(),
            },
            "ESCALATE" => Message::Escalate {
                id: frame.require("ID")?.to_string(),
                command: frame.payload.clone(),
            },
            "ESCALATE_CANCEL" => Message::EscalateCancel { id: frame.require("ID")?.to_string() },
            "ESCALATE_RESPONSE" => Message::EscalateResponse {
                id: frame.require("ID")?.to_string(),
                response: frame.payload.clone(),
            },
            "ESCALATE_ABORTED" => Message::EscalateAborted {
                id: frame.require("ID")?.to_string(),
                reason: frame.headers.get("Reason").unwrap_or_default().to_string(),
            },
            "CRASH_COMMAND" => Message::CrashCommand(frame.clone()),
            "BROADCAST_COMMAND" => Message::BroadcastCommand(frame.clone()),
            other => return Err(Error::Protocol(format!("unrecognized message {other}"))),
        };
        Ok((stamp, message))
    }

    /// Encodes the typed message as a wire frame, applying the sender's
    /// stamp.
    pub fn to_frame(&self, stamp: &Stamp) -> Frame {
        let mut frame = match self {
            Message::CrashCommand(original) | Message::BroadcastCommand(original) => {
                original.clone()
            }
            _ => Frame::new(self.method()),
        };
        match self {
            Message::Login { priority, state, version, permafollower } => {
                frame.headers.set("Priority", priority.to_string());
                frame.headers.set("State", state.to_string());
                frame.headers.set("Version", version.clone());
                frame.headers.set("Permafollower", if *permafollower { "true" } else { "false" });
            }
            Message::NodeState { state, priority, state_change_count } => {
                frame.headers.set("State", state.to_string());
                frame.headers.set("Priority", priority.to_string());
                frame.headers.set("StateChangeCount", state_change_count.to_string());
            }
            Message::StandupResponse { response, state_change_count, reason } => {
                frame.headers.set("Response", response.to_string());
                frame.headers.set("StateChangeCount", state_change_count.to_string());
                if !reason.is_empty() {
                    frame.headers.set("Reason", reason.clone());
                }
            }
            Message::Synchronize | Message::Subscribe => {}
            Message::SynchronizeResponse { commits }
            | Message::SubscriptionApproved { commits } => {
                frame.headers.set("NumCommits", commits.len().to_string());
                for commit in commits {
                    frame.payload.extend_from_slice(&commit.to_frame().encode());
                }
            }
            Message::BeginTransaction { id, new_count, new_hash, leader_sent_at, query } => {
                frame.headers.set("NewCount", new_count.to_string());
                frame.headers.set("NewHash", new_hash.clone());
                frame.headers.set("ID", id.to_string());
                frame.headers.set("leaderSendTime", leader_sent_at.to_string());
                frame.payload = query.clone().into_bytes();
            }
            Message::ApproveTransaction { id, new_count, new_hash }
            | Message::DenyTransaction { id, new_count, new_hash } => {
                frame.headers.set("NewCount", new_count.to_string());
                frame.headers.set("NewHash", new_hash.clone());
                frame.headers.set("ID", id.to_string());
            }
            Message::CommitTransaction { id, commit_count, hash } => {
                frame.headers.set("ID", id.to_string());
                frame.headers.set("CommitCount", commit_count.to_string());
                frame.headers.set("Hash", hash.clone());
            }
            Message::RollbackTransaction { id, new_hash } => {
                frame.headers.set("ID", id.to_string());
                frame.headers.set("NewHash", new_hash.clone());
            }
            Message::Escalate { id, command } => {
                frame.headers.set("ID", id.clone());
                frame.payload = command.clone();
            }
            Message::EscalateCancel { id } => {
                frame.headers.set("ID", id.clone());
            }
            Message::EscalateResponse { id, response } => {
                frame.headers.set("ID", id.clone());
                frame.payload = response.clone();
            }
            Message::EscalateAborted { id, reason } => {
                frame.headers.set("ID", id.clone());
                frame.headers.set("Reason", reason.clone());
            }
            Message::CrashCommand(_) | Message::BroadcastCommand(_) => {}
        }
        // The stamp goes on last, but never overrides headers that carry
        // protocol meaning of their own (COMMIT_TRANSACTION's CommitCount and
        // Hash are the transaction being committed).
        if !frame.headers.contains("CommitCount") {
            frame.headers.set("CommitCount", stamp.commit_count.to_string());
        }
        if !frame.headers.contains("Hash") {
            frame.headers.set("Hash", stamp.hash.clone());
        }
        frame
    }
}

/// Decodes the embedded COMMIT sequence of a SYNCHRONIZE_RESPONSE or
/// SUBSCRIPTION_APPROVED frame, validating the NumCommits header.
fn decode_commits(frame: &Frame) -> Result<Vec<LogCommit>> {
    let expected = frame.require_u64("NumCommits")?;
    let commits = Frame::decode_all(&frame.payload)?
        .iter()
        .map(LogCommit::from_frame)
        .collect::<Result<Vec<_>>>()?;
    if commits.len() as u64 != expected {
        return Err(Error::Protocol(format!(
            "commits remaining at end: expected {expected}, got {}",
            commits.len()
        )));
    }
    Ok(commits)
}

/// An outbound instruction for the peer transport, emitted by the node on
/// its effect channel.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Send an encoded frame to a peer.
    Send { to: PeerId, frame: Frame },
    /// Drop and re-establish the session to a peer. The transport will emit
    /// disconnect and connect events in response.
    Reconnect { to: PeerId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stamp() -> Stamp {
        Stamp { commit_count: 42, hash: "ABCD".into() }
    }

    fn roundtrip(message: Message) {
        let frame = message.to_frame(&stamp());
        let (decoded_stamp, decoded) = Message::from_frame(&frame).unwrap();
        assert_eq!(decoded, message);
        if !matches!(message, Message::CommitTransaction { .. }) {
            assert_eq!(decoded_stamp, stamp());
        }
    }

    #[test]
    fn roundtrips() {
        roundtrip(Message::Login {
            priority: 100,
            state: State::Searching,
            version: "1.2.3".into(),
            permafollower: false,
        });
        roundtrip(Message::NodeState {
            state: State::Leading,
            priority: 100,
            state_change_count: 7,
        });
        roundtrip(Message::StandupResponse {
            response: Vote::Deny,
            state_change_count: 3,
            reason: "I am leading".into(),
        });
        roundtrip(Message::Synchronize);
        roundtrip(Message::SynchronizeResponse {
            commits: vec![
                LogCommit { index: 1, hash: "H1".into(), query: "CREATE TABLE t (x INT)".into() },
                LogCommit { index: 2, hash: "H2".into(), query: "INSERT INTO t VALUES (1)".into() },
            ],
        });
        roundtrip(Message::Subscribe);
        roundtrip(Message::SubscriptionApproved { commits: vec![] });
        roundtrip(Message::BeginTransaction {
            id: TransactionId::Quorum(43),
            new_count: 43,
            new_hash: "H43".into(),
            leader_sent_at: 1234567,
            query: "UPDATE t SET x = 2".into(),
        });
        roundtrip(Message::ApproveTransaction {
            id: TransactionId::Quorum(43),
            new_count: 43,
            new_hash: "H43".into(),
        });
        roundtrip(Message::DenyTransaction {
            id: TransactionId::Async(43),
            new_count: 43,
            new_hash: "H43".into(),
        });
        roundtrip(Message::CommitTransaction {
            id: TransactionId::Quorum(43),
            commit_count: 43,
            hash: "H43".into(),
        });
        roundtrip(Message::RollbackTransaction {
            id: TransactionId::Quorum(43),
            new_hash: "H43".into(),
        });
        roundtrip(Message::Escalate { id: "cmd1".into(), command: b"Query: SELECT 1".to_vec() });
        roundtrip(Message::EscalateCancel { id: "cmd1".into() });
        roundtrip(Message::EscalateResponse { id: "cmd1".into(), response: b"200 OK".to_vec() });
        roundtrip(Message::EscalateAborted { id: "cmd1".into(), reason: "not leading".into() });
    }

    #[test]
    fn missing_stamp_is_fatal() {
        let mut frame = Frame::new("SYNCHRONIZE");
        assert_eq!(
            Message::from_frame(&frame),
            Err(Error::Protocol("missing CommitCount".into()))
        );
        frame.headers.set("CommitCount", "1");
        assert_eq!(Message::from_frame(&frame), Err(Error::Protocol("missing Hash".into())));
    }

    #[test]
    fn missing_required_header() {
        let mut frame = Frame::new("BEGIN_TRANSACTION");
        frame.headers.set("CommitCount", "1");
        frame.headers.set("Hash", "H");
        frame.headers.set("NewCount", "2");
        frame.headers.set("NewHash", "H2");
        frame.headers.set("leaderSendTime", "0");
        assert_eq!(Message::from_frame(&frame), Err(Error::Protocol("missing ID".into())));
    }

    #[test]
    fn transaction_ids() {
        assert_eq!(TransactionId::parse("17").unwrap(), TransactionId::Quorum(17));
        assert_eq!(TransactionId::parse("ASYNC_17").unwrap(), TransactionId::Async(17));
        assert_eq!(TransactionId::Async(17).to_string(), "ASYNC_17");
        assert!(TransactionId::Async(17).is_async());
        assert_eq!(TransactionId::Async(17).number(), 17);
        assert!(TransactionId::parse("ASYNC_x").is_err());
    }

    #[test]
    fn commit_count_mismatch_in_embedded_commits() {
        let message = Message::SynchronizeResponse {
            commits: vec![LogCommit { index: 1, hash: "H1".into(), query: "Q".into() }],
        };
        let mut frame = message.to_frame(&stamp());
        frame.headers.set("NumCommits", "2");
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn unrecognized_method() {
        let mut frame = Frame::new("SOMETHING_ELSE");
        frame.headers.set("CommitCount", "1");
        frame.headers.set("Hash", "H");
        assert_eq!(
            Message::from_frame(&frame),
            Err(Error::Protocol("unrecognized message SOMETHING_ELSE".into()))
        );
    }
}
