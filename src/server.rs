//! The command server interface consumed by the cluster core. The server
//! owns client connections and command execution; the core hands it
//! completed or re-routed commands, asks it to cancel escalations, tells it
//! about peer logins, and checks whether it can quiesce for stand-down.

use crate::cluster::PeerId;
use crate::codec::Frame;

use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A client command as it crosses the core/server boundary. The request and
/// response are opaque frames; the core only reads the ID and completion
/// marker, and stamps the originating peer on escalated commands.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    /// Globally unique command ID, minted by the command server.
    pub id: String,
    /// The serialized client request.
    pub request: Frame,
    /// The response, once there is one.
    pub response: Option<Frame>,
    /// The peer that escalated this command to us, when on the leader.
    pub initiating_peer: Option<PeerId>,
    /// Whether this command has been escalated to a leader.
    pub escalated: bool,
    /// When the command was escalated, in microseconds.
    pub escalated_at: u64,
    /// Whether the command has finished (successfully or not).
    pub complete: bool,
}

impl Command {
    pub fn new(id: impl Into<String>, request: Frame) -> Self {
        Self {
            id: id.into(),
            request,
            response: None,
            initiating_peer: None,
            escalated: false,
            escalated_at: 0,
            complete: false,
        }
    }
}

/// The command server, as seen by the cluster core.
pub trait Server: Send + Sync {
    /// Hands a command to the server: a new one arriving from a peer
    /// (`is_new`), or one being returned for completion or retry.
    fn accept_command(&self, command: Command, is_new: bool);
    /// Asks the server to cancel an escalated command, unless it is already
    /// committing.
    fn cancel_command(&self, id: &str);
    /// Notifies the server that a peer has logged in.
    fn on_peer_login(&self, peer: PeerId);
    /// Whether the server has quiesced enough for the node to stand down.
    fn can_stand_down(&self) -> bool;
}

/// A channel-backed Server that queues everything it is handed. Used by the
/// test suites and by embedders that drive the server loop elsewhere.
pub struct Channel {
    commands_tx: Sender<(Command, bool)>,
    commands_rx: Receiver<(Command, bool)>,
    cancelled: Mutex<Vec<String>>,
    logins: Mutex<Vec<PeerId>>,
    stand_down: AtomicBool,
}

impl Channel {
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = crossbeam::channel::unbounded();
        Self {
            commands_tx,
            commands_rx,
            cancelled: Mutex::new(Vec::new()),
            logins: Mutex::new(Vec::new()),
            stand_down: AtomicBool::new(true),
        }
    }

    /// Drains all queued commands with their is_new markers.
    pub fn drain(&self) -> Vec<(Command, bool)> {
        self.commands_rx.try_iter().collect()
    }

    /// The IDs the core has asked to cancel, in order.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// The peers that have logged in, in order.
    pub fn logins(&self) -> Vec<PeerId> {
        self.logins.lock().clone()
    }

    /// Controls the can_stand_down() answer.
    pub fn set_can_stand_down(&self, value: bool) {
        self.stand_down.store(value, Ordering::SeqCst);
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Server for Channel {
    fn accept_command(&self, command: Command, is_new: bool) {
        // The receiver half lives in this struct, so the send can't fail.
        let _ = self.commands_tx.send((command, is_new));
    }

    fn cancel_command(&self, id: &str) {
        self.cancelled.lock().push(id.to_string());
    }

    fn on_peer_login(&self, peer: PeerId) {
        self.logins.lock().push(peer);
    }

    fn can_stand_down(&self) -> bool {
        self.stand_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_queues_commands() {
        let server = Channel::new();
        server.accept_command(Command::new("a", Frame::new("Query")), true);
        server.accept_command(Command::new("b", Frame::new("Query")), false);
        let drained = server.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0.id, "a");
        assert!(drained[0].1);
        assert_eq!(drained[1].0.id, "b");
        assert!(!drained[1].1);
        assert!(server.drain().is_empty());

        server.cancel_command("a");
        assert_eq!(server.cancelled(), vec!["a".to_string()]);

        server.set_can_stand_down(false);
        assert!(!server.can_stand_down());
    }
}
