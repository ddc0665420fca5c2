//! The escalation table: commands a follower has sent to the leader and is
//! awaiting responses for. Entries are created on ESCALATE and destroyed on
//! ESCALATE_RESPONSE, ESCALATE_ABORTED, leader loss, or shutdown.

use crate::codec::Frame;
use crate::server::{Command, Server};

use itertools::Itertools as _;
use log::{info, warn};
use std::collections::HashMap;

#[derive(Default)]
pub struct EscalationTable {
    commands: HashMap<String, Command>,
}

impl EscalationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Records an escalated command awaiting a leader response.
    pub fn track(&mut self, command: Command) {
        self.commands.insert(command.id.clone(), command);
    }

    /// The request method lines of all in-flight escalations.
    pub fn methods(&self) -> Vec<String> {
        self.commands.values().map(|c| c.request.method.clone()).sorted().collect()
    }

    /// Routes an ESCALATE_RESPONSE: attaches the response, marks the
    /// command complete, and hands it back to the server.
    pub fn on_response(&mut self, id: &str, response: Frame, now: u64, server: &dyn Server) {
        let Some(mut command) = self.commands.remove(id) else {
            info!("Received ESCALATE_RESPONSE for unknown command {id}, ignoring");
            return;
        };
        if command.escalated_at > 0 {
            info!(
                "Escalation of {} took {}ms",
                command.request.method,
                now.saturating_sub(command.escalated_at) / 1000
            );
        }
        command.response = Some(response);
        command.complete = true;
        server.accept_command(command, false);
    }

    /// Routes an ESCALATE_ABORTED: re-queues the command with the server so
    /// it can be retried against the next leader.
    pub fn on_aborted(&mut self, id: &str, reason: &str, server: &dyn Server) {
        let Some(command) = self.commands.remove(id) else {
            warn!("Received ESCALATE_ABORTED for unescalated command {id}, ignoring");
            return;
        };
        info!("Re-queueing command {id} ({}) after abort: {reason}", command.request.method);
        server.accept_command(command, false);
    }

    /// Hands every in-flight escalation back to the server for retry, e.g.
    /// after losing the leader.
    pub fn requeue_all(&mut self, server: &dyn Server) {
        for (_, command) in self.commands.drain().sorted_by(|a, b| a.0.cmp(&b.0)) {
            server.accept_command(command, false);
        }
    }

    /// Completes every in-flight escalation with a synthetic failure. Used
    /// when a graceful shutdown deadline expires.
    pub fn abandon_all(&mut self, server: &dyn Server) -> usize {
        let abandoned = self.commands.len();
        for (_, mut command) in self.commands.drain().sorted_by(|a, b| a.0.cmp(&b.0)) {
            command.response = Some(Frame::new("500 Abandoned"));
            command.complete = true;
            server.accept_command(command, false);
        }
        abandoned
    }

    /// Drops all entries without notifying anybody. Used when entries
    /// unexpectedly survive into SEARCHING.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}
