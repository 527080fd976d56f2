//! Connection-graph snapshot used to validate every mail hop.
//!
//! A [`Topology`] is a pure adjacency set with no I/O; the orchestrator
//! rebuilds one from the registry on every mutation and swaps the pointer,
//! so in-flight routing always observes a consistent view. The `human` node
//! gets no special treatment here: an edge either exists or it does not.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ids::NodeId;
use crate::swarm::Connection;

/// Immutable directed-edge snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    edges: BTreeSet<(NodeId, NodeId)>,
}

/// One entry of the display-merged connection view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedConnection {
    pub source: NodeId,
    pub target: NodeId,
    pub bidirectional: bool,
}

impl Topology {
    /// Build a snapshot from persisted connections; a bidirectional
    /// connection contributes both directed edges.
    pub fn from_connections(connections: &[Connection]) -> Self {
        let mut topology = Self::default();
        for conn in connections {
            topology.add_edge(conn.from.clone(), conn.to.clone(), conn.bidirectional);
        }
        topology
    }

    /// Whether mail from `from` may be delivered to `to`.
    pub fn can_send(&self, from: &NodeId, to: &NodeId) -> bool {
        self.edges.contains(&(from.clone(), to.clone()))
    }

    /// Whether both directions exist between `a` and `b`. Display only.
    pub fn is_bidirectional(&self, a: &NodeId, b: &NodeId) -> bool {
        self.can_send(a, b) && self.can_send(b, a)
    }

    /// Insert an edge; idempotent. With `bidir`, both directions.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, bidir: bool) {
        if bidir {
            self.edges.insert((to.clone(), from.clone()));
        }
        self.edges.insert((from, to));
    }

    /// Remove one or both directions; idempotent.
    pub fn remove_edge(&mut self, from: &NodeId, to: &NodeId, bidir: bool) {
        self.edges.remove(&(from.clone(), to.clone()));
        if bidir {
            self.edges.remove(&(to.clone(), from.clone()));
        }
    }

    /// Insert or remove the reverse edge of an existing forward edge.
    pub fn set_bidirectional(&mut self, from: &NodeId, to: &NodeId, bidir: bool) {
        if bidir {
            self.edges.insert((to.clone(), from.clone()));
        } else {
            self.edges.remove(&(to.clone(), from.clone()));
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Nodes permitted to send to `node`.
    pub fn upstream_of<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a NodeId> {
        self.edges
            .iter()
            .filter(move |(_, to)| to == node)
            .map(|(from, _)| from)
    }

    /// Nodes `node` is permitted to send to.
    pub fn downstream_of<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a NodeId> {
        self.edges
            .iter()
            .filter(move |(from, _)| from == node)
            .map(|(_, to)| to)
    }

    /// Display-merged view: matched forward/reverse pairs collapse to one
    /// bidirectional entry whose `source` is the lexicographic minimum.
    pub fn merge(&self) -> Vec<MergedConnection> {
        let mut merged = Vec::new();
        let mut consumed: BTreeSet<(NodeId, NodeId)> = BTreeSet::new();
        for (from, to) in &self.edges {
            if consumed.contains(&(from.clone(), to.clone())) {
                continue;
            }
            let reverse = (to.clone(), from.clone());
            if self.edges.contains(&reverse) {
                consumed.insert(reverse);
                let (source, target) = if from <= to {
                    (from.clone(), to.clone())
                } else {
                    (to.clone(), from.clone())
                };
                merged.push(MergedConnection {
                    source,
                    target,
                    bidirectional: true,
                });
            } else {
                merged.push(MergedConnection {
                    source: from.clone(),
                    target: to.clone(),
                    bidirectional: false,
                });
            }
        }
        merged
    }

    /// Read-only cycle scan. Cycles are permitted; this is a diagnostic.
    pub fn detect_cycles(&self) -> Vec<Vec<NodeId>> {
        let mut adjacency: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
        for (from, to) in &self.edges {
            adjacency.entry(from).or_default().push(to);
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: BTreeMap<&NodeId, Mark> = BTreeMap::new();
        let mut cycles = Vec::new();

        fn visit<'a>(
            node: &'a NodeId,
            adjacency: &BTreeMap<&'a NodeId, Vec<&'a NodeId>>,
            marks: &mut BTreeMap<&'a NodeId, Mark>,
            stack: &mut Vec<&'a NodeId>,
            cycles: &mut Vec<Vec<NodeId>>,
        ) {
            marks.insert(node, Mark::Visiting);
            stack.push(node);
            for next in adjacency.get(node).into_iter().flatten() {
                match marks.get(next) {
                    Some(Mark::Visiting) => {
                        let start = stack.iter().position(|n| n == next).unwrap_or(0);
                        cycles.push(stack[start..].iter().map(|n| (*n).clone()).collect());
                    }
                    Some(Mark::Done) => {}
                    None => visit(next, adjacency, marks, stack, cycles),
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
        }

        let nodes: Vec<&NodeId> = adjacency.keys().copied().collect();
        for node in nodes {
            if !marks.contains_key(node) {
                let mut stack = Vec::new();
                visit(node, &adjacency, &mut marks, &mut stack, &mut cycles);
            }
        }
        cycles
    }
}
