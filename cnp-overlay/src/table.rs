//! Per-cluster membership table.
//!
//! Members are kept in join order. The head of that order is the cluster's
//! main member; removing the head promotes the next-oldest member, so every
//! node holding the same table resolves the same leader without a vote.

use cnp_core::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTable {
    chronology: Vec<NodeId>,
}

impl ClusterTable {
    /// Single-member table led by `main`.
    #[must_use]
    pub fn new(main: NodeId) -> Self {
        Self {
            chronology: vec![main],
        }
    }

    /// Build from members in join order, discarding repeats.
    #[must_use]
    pub fn from_chronology(members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut table = Self::default();
        for member in members {
            table.insert(member);
        }
        table
    }

    #[inline]
    #[must_use]
    pub fn main(&self) -> Option<NodeId> {
        self.chronology.first().copied()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.chronology.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chronology.is_empty()
    }

    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.chronology.contains(node)
    }

    #[inline]
    #[must_use]
    pub fn is_main(&self, node: &NodeId) -> bool {
        self.chronology.first() == Some(node)
    }

    /// Members in join order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.chronology.iter()
    }

    /// Every member except `node`, in join order.
    pub fn others<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = NodeId> + 'a {
        self.chronology.iter().filter(move |m| *m != node).copied()
    }

    /// Append a newly joined member. Returns false if already present.
    pub fn insert(&mut self, node: NodeId) -> bool {
        if self.contains(&node) {
            return false;
        }
        self.chronology.push(node);
        true
    }

    pub fn remove(&mut self, node: &NodeId) -> bool {
        match self.chronology.iter().position(|m| m == node) {
            Some(idx) => {
                self.chronology.remove(idx);
                true
            },
            None => false,
        }
    }

    /// Detach the `count` most recently joined members, oldest of them first.
    /// The main member is never detached.
    pub fn split_off_newest(&mut self, count: usize) -> Vec<NodeId> {
        let keep = self.chronology.len().saturating_sub(count).max(1);
        if keep >= self.chronology.len() {
            return Vec::new();
        }
        self.chronology.split_off(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn node(port: u16) -> NodeId {
        NodeId::new(SocketAddr::from(([127, 0, 0, 1], port)), u64::from(port))
    }

    #[test]
    fn test_main_is_oldest_member() {
        let mut table = ClusterTable::new(node(3));
        table.insert(node(1));
        table.insert(node(2));

        // Join order wins over identity order.
        assert_eq!(table.main(), Some(node(3)));
        assert!(!table.insert(node(1)));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_remove_main_promotes_next_oldest() {
        let mut table = ClusterTable::from_chronology([node(5), node(9), node(7)]);
        assert!(table.remove(&node(5)));
        assert_eq!(table.main(), Some(node(9)));
        assert!(!table.remove(&node(5)));

        table.remove(&node(9));
        table.remove(&node(7));
        assert!(table.is_empty());
        assert_eq!(table.main(), None);
    }

    #[test]
    fn test_split_off_newest_keeps_main() {
        let mut table = ClusterTable::from_chronology([node(1), node(2), node(3), node(4), node(5)]);
        let moved = table.split_off_newest(2);
        assert_eq!(moved, vec![node(4), node(5)]);
        assert_eq!(table.iter().copied().collect::<Vec<_>>(), vec![node(1), node(2), node(3)]);

        let mut single = ClusterTable::new(node(1));
        assert!(single.split_off_newest(3).is_empty());
        assert_eq!(single.main(), Some(node(1)));
    }

    #[test]
    fn test_others_excludes_self() {
        let table = ClusterTable::from_chronology([node(1), node(2), node(3)]);
        let others: Vec<_> = table.others(&node(2)).collect();
        assert_eq!(others, vec![node(1), node(3)]);
    }
}
