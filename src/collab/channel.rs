//! Per-round message channel between collaborating agents.
//!
//! Every message is published on one `tokio::sync::broadcast` channel and
//! tagged with its sender and, for directed messages, its target. Each agent
//! reads through an [`AgentInbox`] that filters out what is not meant for it.
//! Agents address each other by writing `@<agent-id>: <message>` lines.

use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, warn};

use crate::agent::AgentId;

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*@([A-Za-z0-9_\-][A-Za-z0-9_.\-]*):\s*(.+?)\s*$").expect("mention pattern")
});

/// Who sent a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSender {
    Coordinator,
    Agent(AgentId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub from: MessageSender,
    /// None for messages addressed to everyone.
    pub to: Option<AgentId>,
    pub content: String,
}

impl ChannelMessage {
    fn is_for(&self, agent: &AgentId) -> bool {
        if self.from == MessageSender::Agent(agent.clone()) {
            return false;
        }
        match &self.to {
            Some(target) => target == agent,
            None => true,
        }
    }
}

impl std::fmt::Display for ChannelMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.from {
            MessageSender::Coordinator => write!(f, "coordinator: {}", self.content),
            MessageSender::Agent(agent) => write!(f, "{}: {}", agent, self.content),
        }
    }
}

/// Broadcast channel for one collaborative round.
#[derive(Debug, Clone)]
pub struct RoundChannel {
    tx: broadcast::Sender<ChannelMessage>,
}

impl RoundChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Inbox for `agent`. Only messages published after this call are seen.
    pub fn subscribe(&self, agent: &AgentId) -> AgentInbox {
        AgentInbox {
            agent: agent.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Send a message from the coordinator to every agent.
    pub fn broadcast(&self, content: &str) {
        self.publish(ChannelMessage {
            from: MessageSender::Coordinator,
            to: None,
            content: content.to_string(),
        });
    }

    /// Publish every `@<agent-id>: <message>` line in `output` as a directed
    /// message from `from`. Returns how many were published.
    pub fn publish_mentions(&self, from: &AgentId, output: &str) -> usize {
        let mut published = 0;
        for (to, content) in parse_mentions(output) {
            if &to == from {
                continue;
            }
            debug!(from = %from, to = %to, "Agent mention");
            self.publish(ChannelMessage {
                from: MessageSender::Agent(from.clone()),
                to: Some(to),
                content,
            });
            published += 1;
        }
        published
    }

    fn publish(&self, message: ChannelMessage) {
        // No subscribers is not an error: nobody is listening yet.
        let _ = self.tx.send(message);
    }
}

/// One agent's view of the round channel.
#[derive(Debug)]
pub struct AgentInbox {
    agent: AgentId,
    rx: broadcast::Receiver<ChannelMessage>,
}

impl AgentInbox {
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Everything addressed to this agent since the last drain.
    pub fn drain(&mut self) -> Vec<ChannelMessage> {
        let mut messages = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(message) if message.is_for(&self.agent) => messages.push(message),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(agent = %self.agent, skipped, "Inbox lagged, messages dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        messages
    }
}

/// `@<agent-id>: <message>` lines, in order. Lines naming an invalid agent
/// id are ignored.
pub fn parse_mentions(output: &str) -> Vec<(AgentId, String)> {
    output
        .lines()
        .filter_map(|line| {
            let captures = MENTION_RE.captures(line)?;
            let agent = AgentId::new(&captures[1]).ok()?;
            Some((agent, captures[2].to_string()))
        })
        .collect()
}
