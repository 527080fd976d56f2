//! Events fanned out to observers over the in-process bus.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::mail::Mail;

/// Per-node queue depth snapshot. `processing` means the agent is running
/// and its inbox is non-empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub inbox: usize,
    pub outbox: usize,
    pub processing: bool,
}

/// Observed runtime state of an agent. Derived from the container backend,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeeStatus {
    pub id: NodeId,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Everything the orchestrator broadcasts. Topic tags match the wire names
/// observers subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HiveEvent {
    /// A mail left a sender's outbox and entered the router.
    #[serde(rename = "mail:sent")]
    MailSent { mail: Box<Mail> },
    /// A mail was appended to the human inbox.
    #[serde(rename = "mail:received")]
    MailReceived { mail: Box<Mail> },
    /// A mail was delivered to an agent or mailbox inbox.
    #[serde(rename = "mail:routed")]
    MailRouted { mail: Box<Mail> },
    /// A mail could not be processed (corrupt file or exhausted retries).
    #[serde(rename = "mail:failed")]
    MailFailed { mail_id: Option<uuid::Uuid>, reason: String },
    /// A mail was rejected by the topology and a bounce was produced.
    #[serde(rename = "mail:bounced")]
    MailBounced { mail: Box<Mail>, bounce_reason: String },
    /// Coalesced queue-depth update for all nodes.
    #[serde(rename = "mail:counts")]
    MailCounts { counts: BTreeMap<NodeId, QueueSnapshot> },
    /// Agent runtime state changed.
    #[serde(rename = "bee:status")]
    BeeStatus { status: BeeStatus },
    /// The swarm registry was mutated and persisted.
    #[serde(rename = "swarm:updated")]
    SwarmUpdated,
}

impl HiveEvent {
    /// The wire topic tag for this event.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::MailSent { .. } => "mail:sent",
            Self::MailReceived { .. } => "mail:received",
            Self::MailRouted { .. } => "mail:routed",
            Self::MailFailed { .. } => "mail:failed",
            Self::MailBounced { .. } => "mail:bounced",
            Self::MailCounts { .. } => "mail:counts",
            Self::BeeStatus { .. } => "bee:status",
            Self::SwarmUpdated => "swarm:updated",
        }
    }
}
