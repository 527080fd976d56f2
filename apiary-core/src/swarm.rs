//! Persistent swarm configuration: the bees, mailboxes, and connection graph.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, HiveResult};
use crate::ids::NodeId;

/// A containerized agent definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bee {
    pub id: NodeId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Persona text written to the agent's read-only soul file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soul: Option<String>,
}

/// A named non-agent endpoint with its own inbox/outbox queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxDef {
    /// Full node id, `mailbox:<name>`.
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A permitted sender→recipient pair. `bidirectional` is materialized as two
/// directed edges when the topology snapshot is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default)]
    pub bidirectional: bool,
}

/// The full persisted graph configuration. The `human` node is implicit and
/// always present; it never appears in `bees` or `mailboxes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bees: Vec<Bee>,
    #[serde(default)]
    pub mailboxes: Vec<MailboxDef>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl SwarmConfig {
    /// All node ids addressable in this swarm, including the implicit human.
    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        let mut ids: BTreeSet<NodeId> = self.bees.iter().map(|b| b.id.clone()).collect();
        ids.extend(self.mailboxes.iter().map(|m| m.id.clone()));
        ids.insert(NodeId::human());
        ids
    }

    pub fn bee(&self, id: &NodeId) -> Option<&Bee> {
        self.bees.iter().find(|b| &b.id == id)
    }

    /// Display name for a node, used in hierarchy files.
    pub fn node_name(&self, id: &NodeId) -> String {
        if let Some(bee) = self.bee(id) {
            return bee.name.clone();
        }
        if let Some(mb) = self.mailboxes.iter().find(|m| &m.id == id) {
            if let Some(name) = &mb.name {
                return name.clone();
            }
        }
        id.to_string()
    }

    /// Validate before persistence: unique ids, connections reference known
    /// nodes, and no self-edges.
    pub fn validate(&self) -> HiveResult<()> {
        let mut seen = BTreeSet::new();
        for bee in &self.bees {
            if bee.id.is_human() || bee.id.is_mailbox() {
                return Err(HiveError::validation(
                    "bees",
                    &format!("reserved id '{}'", bee.id),
                ));
            }
            if !seen.insert(bee.id.clone()) {
                return Err(HiveError::validation(
                    "bees",
                    &format!("duplicate id '{}'", bee.id),
                ));
            }
        }
        for mb in &self.mailboxes {
            if !mb.id.is_mailbox() {
                return Err(HiveError::validation(
                    "mailboxes",
                    &format!("id '{}' must use the 'mailbox:' prefix", mb.id),
                ));
            }
            if !seen.insert(mb.id.clone()) {
                return Err(HiveError::validation(
                    "mailboxes",
                    &format!("duplicate id '{}'", mb.id),
                ));
            }
        }

        let known = self.node_ids();
        for conn in &self.connections {
            if conn.from == conn.to {
                return Err(HiveError::validation(
                    "connections",
                    &format!("self-edge on '{}'", conn.from),
                ));
            }
            for end in [&conn.from, &conn.to] {
                if !known.contains(end) {
                    return Err(HiveError::UnknownNode(end.clone()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bee(id: &str) -> Bee {
        Bee {
            id: NodeId::from(id),
            name: id.to_string(),
            model: None,
            soul: None,
        }
    }

    fn config_with(bees: Vec<Bee>, connections: Vec<Connection>) -> SwarmConfig {
        SwarmConfig {
            id: "swarm-1".to_string(),
            name: "test".to_string(),
            bees,
            mailboxes: vec![],
            connections,
        }
    }

    #[test]
    fn test_human_is_implicit() {
        let cfg = config_with(vec![bee("b")], vec![]);
        assert!(cfg.node_ids().contains("human"));
    }

    #[test]
    fn test_duplicate_bee_id_rejected() {
        let cfg = config_with(vec![bee("b"), bee("b")], vec![]);
        match cfg.validate() {
            Err(HiveError::Validation(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_reserved_bee_id_rejected() {
        let cfg = config_with(vec![bee("human")], vec![]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_connection_to_unknown_node_rejected() {
        let cfg = config_with(
            vec![bee("b")],
            vec![Connection {
                from: NodeId::from("b"),
                to: NodeId::from("ghost"),
                bidirectional: false,
            }],
        );
        match cfg.validate() {
            Err(HiveError::UnknownNode(id)) => assert_eq!(id.as_str(), "ghost"),
            other => panic!("expected UnknownNode, got {other:?}"),
        }
    }

    #[test]
    fn test_self_edge_rejected() {
        let cfg = config_with(
            vec![bee("b")],
            vec![Connection {
                from: NodeId::from("b"),
                to: NodeId::from("b"),
                bidirectional: false,
            }],
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_human_edges_validate() {
        let cfg = config_with(
            vec![bee("b")],
            vec![Connection {
                from: NodeId::human(),
                to: NodeId::from("b"),
                bidirectional: true,
            }],
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn test_mailbox_prefix_enforced() {
        let cfg = SwarmConfig {
            mailboxes: vec![MailboxDef {
                id: NodeId::from("reports"),
                name: None,
            }],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let cfg = config_with(
            vec![bee("b")],
            vec![Connection {
                from: NodeId::human(),
                to: NodeId::from("b"),
                bidirectional: true,
            }],
        );
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: SwarmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cfg);
    }
}
