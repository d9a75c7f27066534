//! Node arena with explicit owning and weak edges
//!
//! Nodes are addressed by [`NodeId`]. Edges are recorded explicitly as
//! either [`EdgeKind::Owning`], which counts toward the target's strong
//! count, or [`EdgeKind::Weak`], which only allows lookup. External holders
//! (process-wide state) add strong references through [`NodeArena::hold`].
//!
//! [`NodeArena::reclaim`] behaves like naive reference counting: it frees
//! nodes whose strong count has dropped to zero and nothing else, so a set of
//! nodes that own each other in a cycle survives it even after every external
//! holder is gone. Such nodes show up in [`NodeArena::orphaned`].

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Index of a node in the arena
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Kind of reference one node holds to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Keeps the target alive
    Owning,
    /// Lookup only
    Weak,
}

#[derive(Debug)]
struct Node {
    value: i64,
    edges: Vec<(EdgeKind, NodeId)>,
    holds: u32,
    reclaimed: bool,
}

/// Arena of nodes linked by owning and weak edges
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with no edges and no holders
    pub fn insert(&mut self, value: i64) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            value,
            edges: Vec::new(),
            holds: 0,
            reclaimed: false,
        });
        id
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).filter(|n| !n.reclaimed)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).filter(|n| !n.reclaimed)
    }

    /// Record an edge from `from` to `to`. Returns false if either node is gone.
    pub fn link(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) -> bool {
        if self.node(to).is_none() {
            return false;
        }
        match self.node_mut(from) {
            Some(node) => {
                node.edges.push((kind, to));
                true
            }
            None => false,
        }
    }

    /// Add an external strong reference to `id`
    pub fn hold(&mut self, id: NodeId) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.holds += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one external strong reference to `id`
    pub fn unhold(&mut self, id: NodeId) -> bool {
        match self.node_mut(id) {
            Some(node) if node.holds > 0 => {
                node.holds -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn value(&self, id: NodeId) -> Option<i64> {
        self.node(id).map(|n| n.value)
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// First live target of an edge of `kind` leaving `from`
    pub fn follow(&self, from: NodeId, kind: EdgeKind) -> Option<NodeId> {
        self.node(from)?
            .edges
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, to)| *to)
            .find(|to| self.is_alive(*to))
    }

    /// External holds plus owning edges from live nodes
    pub fn strong_count(&self, id: NodeId) -> usize {
        let Some(node) = self.node(id) else {
            return 0;
        };
        node.holds as usize + self.incoming(id, EdgeKind::Owning)
    }

    /// Weak edges from live nodes
    pub fn weak_count(&self, id: NodeId) -> usize {
        if self.node(id).is_none() {
            return 0;
        }
        self.incoming(id, EdgeKind::Weak)
    }

    fn incoming(&self, id: NodeId, kind: EdgeKind) -> usize {
        self.nodes
            .iter()
            .filter(|n| !n.reclaimed)
            .flat_map(|n| n.edges.iter())
            .filter(|(k, to)| *k == kind && *to == id)
            .count()
    }

    /// Free every node whose strong count is zero, cascading through owning
    /// edges. Returns the number of nodes freed.
    pub fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        loop {
            let dead: Vec<NodeId> = (0..self.nodes.len() as u32)
                .map(NodeId)
                .filter(|id| self.is_alive(*id) && self.strong_count(*id) == 0)
                .collect();
            if dead.is_empty() {
                return freed;
            }
            for id in dead {
                let node = &mut self.nodes[id.0 as usize];
                node.reclaimed = true;
                node.edges.clear();
                freed += 1;
            }
        }
    }

    /// Live nodes reachable from an external holder through owning edges
    pub fn reachable(&self) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = (0..self.nodes.len() as u32)
            .map(NodeId)
            .filter(|id| self.node(*id).is_some_and(|n| n.holds > 0))
            .collect();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.node(id) {
                for (kind, to) in &node.edges {
                    if *kind == EdgeKind::Owning && self.is_alive(*to) {
                        queue.push_back(*to);
                    }
                }
            }
        }
        seen
    }

    /// Live nodes that no external holder can reach
    pub fn orphaned(&self) -> Vec<NodeId> {
        let reachable = self.reachable();
        (0..self.nodes.len() as u32)
            .map(NodeId)
            .filter(|id| self.is_alive(*id) && !reachable.contains(id))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.reclaimed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owning_pair(arena: &mut NodeArena) -> (NodeId, NodeId) {
        let a = arena.insert(1);
        let b = arena.insert(2);
        arena.link(a, b, EdgeKind::Owning);
        arena.link(b, a, EdgeKind::Owning);
        (a, b)
    }

    #[test]
    fn test_owning_cycle_survives_reclaim() {
        let mut arena = NodeArena::new();
        let (a, b) = owning_pair(&mut arena);
        arena.hold(a);
        arena.hold(b);

        assert_eq!(arena.strong_count(a), 2);
        assert_eq!(arena.strong_count(b), 2);
        assert_eq!(arena.follow(a, EdgeKind::Owning), Some(b));

        arena.unhold(a);
        arena.unhold(b);
        assert_eq!(arena.reclaim(), 0);

        // Still alive, but nothing outside the cycle reaches it
        assert_eq!(arena.strong_count(a), 1);
        assert_eq!(arena.strong_count(b), 1);
        assert_eq!(arena.orphaned(), vec![a, b]);
    }

    #[test]
    fn test_weak_back_edge_is_reclaimed() {
        let mut arena = NodeArena::new();
        let parent = arena.insert(1);
        let child = arena.insert(2);
        arena.link(parent, child, EdgeKind::Owning);
        arena.link(child, parent, EdgeKind::Weak);
        arena.hold(parent);

        assert_eq!(arena.strong_count(parent), 1);
        assert_eq!(arena.weak_count(parent), 1);
        assert_eq!(arena.follow(child, EdgeKind::Weak), Some(parent));

        arena.unhold(parent);
        assert_eq!(arena.reclaim(), 2);
        assert_eq!(arena.live_count(), 0);
        assert!(arena.orphaned().is_empty());
    }

    #[test]
    fn test_weak_lookup_fails_after_target_freed() {
        let mut arena = NodeArena::new();
        let target = arena.insert(7);
        let observer = arena.insert(8);
        arena.link(observer, target, EdgeKind::Weak);
        arena.hold(observer);

        assert_eq!(arena.reclaim(), 1);
        assert!(!arena.is_alive(target));
        assert_eq!(arena.follow(observer, EdgeKind::Weak), None);
        assert_eq!(arena.value(observer), Some(8));
    }

    #[test]
    fn test_reachable_through_holder() {
        let mut arena = NodeArena::new();
        let (a, b) = owning_pair(&mut arena);
        arena.hold(a);

        let reachable = arena.reachable();
        assert!(reachable.contains(&a));
        assert!(reachable.contains(&b));
        assert!(arena.orphaned().is_empty());
    }

    #[test]
    fn test_link_to_missing_node_rejected() {
        let mut arena = NodeArena::new();
        let a = arena.insert(1);
        assert!(!arena.link(a, NodeId(99), EdgeKind::Owning));
        assert!(!arena.unhold(a));
    }
}
