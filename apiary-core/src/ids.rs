use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reserved identifier for the human operator endpoint.
pub const HUMAN_NODE: &str = "human";

/// Sender identifier used for orchestrator-originated mail (bounces).
pub const SYSTEM_SENDER: &str = "system";

/// Prefix marking a named external mailbox endpoint.
pub const MAILBOX_PREFIX: &str = "mailbox:";

/// Identifier of a node in the swarm graph: an agent, a mailbox, or `human`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The distinguished human endpoint.
    pub fn human() -> Self {
        Self(HUMAN_NODE.to_string())
    }

    /// The orchestrator itself, as a mail sender.
    pub fn system() -> Self {
        Self(SYSTEM_SENDER.to_string())
    }

    /// A named mailbox endpoint (`mailbox:<name>`).
    pub fn mailbox(name: &str) -> Self {
        Self(format!("{MAILBOX_PREFIX}{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_human(&self) -> bool {
        self.0 == HUMAN_NODE
    }

    pub fn is_mailbox(&self) -> bool {
        self.0.starts_with(MAILBOX_PREFIX)
    }

    /// The name part of a mailbox id, or `None` for non-mailbox nodes.
    pub fn mailbox_name(&self) -> Option<&str> {
        self.0.strip_prefix(MAILBOX_PREFIX)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl FromStr for NodeId {
    type Err = String;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(value))
    }
}
