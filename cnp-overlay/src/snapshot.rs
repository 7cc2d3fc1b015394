//! A node's local picture of the tree around it: its own cluster, the parent
//! cluster and up to `fanout` child clusters.

use crate::table::ClusterTable;
use cnp_core::{ClusterId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub id: ClusterId,
    pub table: ClusterTable,
}

impl ClusterView {
    #[must_use]
    pub fn new(id: ClusterId, table: ClusterTable) -> Self {
        Self { id, table }
    }

    #[inline]
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.table.main()
    }
}

/// A neighboring cluster as seen from the own cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Parent,
    Child(u16),
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parent => write!(f, "parent"),
            Self::Child(slot) => write!(f, "child[{slot}]"),
        }
    }
}

/// Placement handed to a node that joins or is relocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub reliability: u16,
    pub fanout: u16,
    pub own: ClusterView,
    pub parent: Option<ClusterView>,
    pub children: Vec<Option<ClusterView>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    me: NodeId,
    own: ClusterView,
    parent: Option<ClusterView>,
    children: Vec<Option<ClusterView>>,
    reliability: usize,
    fanout: usize,
    disconnected: bool,
}

impl TopologySnapshot {
    /// Snapshot for a bootstrap node: a single-member root cluster.
    #[must_use]
    pub fn root(me: NodeId, reliability: usize, fanout: usize) -> Self {
        Self {
            me,
            own: ClusterView::new(ClusterId::root(), ClusterTable::new(me)),
            parent: None,
            children: vec![None; fanout],
            reliability,
            fanout,
            disconnected: false,
        }
    }

    #[must_use]
    pub fn from_placement(me: NodeId, placement: Placement) -> Self {
        let fanout = usize::from(placement.fanout);
        let mut children = placement.children;
        children.resize(fanout, None);
        Self {
            me,
            own: placement.own,
            parent: placement.parent,
            children,
            reliability: usize::from(placement.reliability),
            fanout,
            disconnected: false,
        }
    }

    /// Placement describing `own` as seen from inside it, for a node that
    /// is being told where it lives.
    #[must_use]
    pub fn placement_for(&self, own: ClusterView, parent: Option<ClusterView>, children: Vec<Option<ClusterView>>) -> Placement {
        Placement {
            reliability: u16::try_from(self.reliability).unwrap_or(u16::MAX),
            fanout: u16::try_from(self.fanout).unwrap_or(u16::MAX),
            own,
            parent,
            children,
        }
    }

    /// Placement of a new member of the own cluster.
    #[must_use]
    pub fn own_placement(&self) -> Placement {
        self.placement_for(self.own.clone(), self.parent.clone(), self.children.clone())
    }

    #[inline]
    #[must_use]
    pub const fn me(&self) -> NodeId {
        self.me
    }

    #[inline]
    #[must_use]
    pub fn own(&self) -> &ClusterView {
        &self.own
    }

    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<&ClusterView> {
        self.parent.as_ref()
    }

    #[must_use]
    pub fn child(&self, slot: u16) -> Option<&ClusterView> {
        self.children.get(usize::from(slot)).and_then(Option::as_ref)
    }

    #[inline]
    #[must_use]
    pub fn children(&self) -> &[Option<ClusterView>] {
        &self.children
    }

    #[inline]
    #[must_use]
    pub const fn reliability(&self) -> usize {
        self.reliability
    }

    #[inline]
    #[must_use]
    pub const fn fanout(&self) -> usize {
        self.fanout
    }

    #[inline]
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.own.id.is_root()
    }

    #[inline]
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.own.table.is_main(&self.me)
    }

    #[inline]
    #[must_use]
    pub fn own_leader(&self) -> Option<NodeId> {
        self.own.leader()
    }

    /// Own-cluster members other than this node.
    pub fn siblings(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.own.table.others(&self.me)
    }

    pub fn neighbor(&self, dir: Direction) -> Option<&ClusterView> {
        match dir {
            Direction::Parent => self.parent.as_ref(),
            Direction::Child(slot) => self.child(slot),
        }
    }

    #[must_use]
    pub fn neighbor_leader(&self, dir: Direction) -> Option<NodeId> {
        self.neighbor(dir).and_then(ClusterView::leader)
    }

    /// Parent first, then populated child slots in slot order.
    #[must_use]
    pub fn neighbor_directions(&self) -> Vec<Direction> {
        let mut dirs = Vec::with_capacity(self.fanout + 1);
        if self.parent.is_some() {
            dirs.push(Direction::Parent);
        }
        dirs.extend(self.populated_slots().map(Direction::Child));
        dirs
    }

    pub fn populated_slots(&self) -> impl Iterator<Item = u16> + '_ {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .filter_map(|(i, _)| u16::try_from(i).ok())
    }

    #[must_use]
    pub fn first_free_slot(&self) -> Option<u16> {
        self.children
            .iter()
            .position(Option::is_none)
            .and_then(|i| u16::try_from(i).ok())
    }

    /// Every child slot is occupied. Trivially true when `fanout` is zero.
    #[must_use]
    pub fn children_full(&self) -> bool {
        self.children.iter().all(Option::is_some)
    }

    /// Map a neighboring cluster id to its direction.
    #[must_use]
    pub fn direction_of(&self, id: &ClusterId) -> Option<Direction> {
        if self.parent.as_ref().is_some_and(|p| &p.id == id) {
            return Some(Direction::Parent);
        }
        if self.own.id.is_parent_of(id) {
            let slot = id.slot()?;
            if usize::from(slot) < self.fanout {
                return Some(Direction::Child(slot));
            }
        }
        None
    }

    /// Direction of the neighboring cluster `node` belongs to.
    #[must_use]
    pub fn direction_of_member(&self, node: &NodeId) -> Option<Direction> {
        self.neighbor_directions()
            .into_iter()
            .find(|dir| self.neighbor(*dir).is_some_and(|v| v.table.contains(node)))
    }

    /// Members of the parent and all child clusters.
    #[must_use]
    pub fn neighbor_members(&self) -> Vec<(ClusterId, NodeId)> {
        let mut out = Vec::new();
        for dir in self.neighbor_directions() {
            if let Some(view) = self.neighbor(dir) {
                out.extend(view.table.iter().map(|n| (view.id.clone(), *n)));
            }
        }
        out
    }

    /// Nodes this one probes: own siblings plus neighbor leaders.
    #[must_use]
    pub fn probe_targets(&self) -> BTreeSet<NodeId> {
        let mut targets: BTreeSet<NodeId> = self.siblings().collect();
        for dir in self.neighbor_directions() {
            if let Some(leader) = self.neighbor_leader(dir) {
                targets.insert(leader);
            }
        }
        targets.remove(&self.me);
        targets
    }

    /// Every node this one knows about, for fault notices.
    #[must_use]
    pub fn known_nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes: BTreeSet<NodeId> = self.siblings().collect();
        nodes.extend(self.neighbor_members().into_iter().map(|(_, n)| n));
        nodes.remove(&self.me);
        nodes
    }

    pub(crate) fn own_mut(&mut self) -> &mut ClusterView {
        &mut self.own
    }

    pub(crate) fn neighbor_mut(&mut self, dir: Direction) -> Option<&mut ClusterView> {
        match dir {
            Direction::Parent => self.parent.as_mut(),
            Direction::Child(slot) => self.children.get_mut(usize::from(slot)).and_then(Option::as_mut),
        }
    }

    pub(crate) fn set_child(&mut self, slot: u16, view: ClusterView) {
        if let Some(entry) = self.children.get_mut(usize::from(slot)) {
            *entry = Some(view);
        }
    }

    pub(crate) fn replace(&mut self, placement: Placement) {
        let me = self.me;
        *self = Self::from_placement(me, placement);
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.disconnected = true;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn node(port: u16) -> NodeId {
        NodeId::new(SocketAddr::from(([127, 0, 0, 1], port)), 1)
    }

    fn mid_tree() -> TopologySnapshot {
        let me = node(2);
        let id = ClusterId::root().child(1);
        TopologySnapshot::from_placement(
            me,
            Placement {
                reliability: 2,
                fanout: 2,
                own: ClusterView::new(id.clone(), ClusterTable::from_chronology([node(1), me])),
                parent: Some(ClusterView::new(
                    ClusterId::root(),
                    ClusterTable::from_chronology([node(10), node(11)]),
                )),
                children: vec![
                    None,
                    Some(ClusterView::new(
                        id.child(1),
                        ClusterTable::from_chronology([node(20), node(21)]),
                    )),
                ],
            },
        )
    }

    #[test]
    fn test_root_snapshot() {
        let snap = TopologySnapshot::root(node(1), 2, 3);
        assert!(snap.is_root());
        assert!(snap.is_leader());
        assert_eq!(snap.children().len(), 3);
        assert_eq!(snap.first_free_slot(), Some(0));
        assert!(!snap.children_full());
        assert!(snap.neighbor_directions().is_empty());
    }

    #[test]
    fn test_zero_fanout_children_full() {
        let snap = TopologySnapshot::root(node(1), 2, 0);
        assert!(snap.children_full());
        assert_eq!(snap.first_free_slot(), None);
    }

    #[test]
    fn test_directions() {
        let snap = mid_tree();
        assert!(!snap.is_leader());
        assert_eq!(snap.own_leader(), Some(node(1)));
        assert_eq!(snap.neighbor_directions(), vec![Direction::Parent, Direction::Child(1)]);
        assert_eq!(snap.direction_of(&ClusterId::root()), Some(Direction::Parent));
        assert_eq!(
            snap.direction_of(&ClusterId::root().child(1).child(1)),
            Some(Direction::Child(1))
        );
        assert_eq!(snap.direction_of(&ClusterId::root().child(0)), None);
        assert_eq!(snap.direction_of_member(&node(21)), Some(Direction::Child(1)));
        assert_eq!(snap.neighbor_leader(Direction::Parent), Some(node(10)));
    }

    #[test]
    fn test_probe_targets() {
        let snap = mid_tree();
        let targets: Vec<_> = snap.probe_targets().into_iter().collect();
        assert_eq!(targets, vec![node(1), node(10), node(20)]);
        assert_eq!(snap.known_nodes().len(), 5);
    }
}
