//! Membership and placement.
//!
//! Joins are absorbed by the first leader whose cluster is either not yet
//! reliable or still has a free child slot; otherwise they are pushed one
//! level down, round-robin over the child clusters. A full cluster
//! (2R-1 members) with a free slot splits: its R-1 newest members and the
//! joiner become a new child cluster.
//!
//! Leadership follows join order. When a leader goes away every member that
//! notices removes it and the next-oldest member takes over, so no election
//! round is needed.

use crate::events::{Action, Cause, OverlayEvent, Target, TopologyChange};
use crate::message::{Envelope, Message, Route};
use crate::node::Outbox;
use crate::snapshot::{ClusterView, Direction, Placement, TopologySnapshot};
use crate::table::ClusterTable;
use cnp_core::{ClusterId, NodeId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Topology consequences forwarding (or the node) must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Signal {
    SiblingGone(NodeId),
    /// Members split off into the new child cluster at this slot.
    SiblingsMoved(u16, Vec<NodeId>),
    OwnLeaderUnresolved,
    OwnLeaderChanged(NodeId),
    NeighborLeaderChanged(Direction, NodeId),
    BecameLeader,
    Relocated,
    Disconnect,
}

pub(crate) struct Membership {
    snapshot: TopologySnapshot,
    next_child: usize,
}

impl Membership {
    /// Bootstrap a new tree with this node as its only member.
    pub(crate) fn bootstrap(me: NodeId, reliability: usize, fanout: usize, out: &mut Outbox) -> Self {
        let membership = Self {
            snapshot: TopologySnapshot::root(me, reliability, fanout),
            next_child: 0,
        };
        info!(
            target: "canopy::membership",
            node = %me,
            reliability,
            fanout,
            "Initialized root cluster"
        );
        membership.emit(out, Cause::Init, Target::Own, Action::Add, Some(me));
        membership
    }

    /// Adopt the placement carried by a join acknowledgment.
    pub(crate) fn joined(me: NodeId, placement: Placement, out: &mut Outbox) -> Self {
        let membership = Self {
            snapshot: TopologySnapshot::from_placement(me, placement),
            next_child: 0,
        };
        info!(
            target: "canopy::membership",
            node = %me,
            cluster = %membership.snapshot.own().id,
            leader = ?membership.snapshot.own_leader(),
            "Joined overlay"
        );
        membership.emit(out, Cause::Join, Target::Own, Action::Add, Some(me));
        membership
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> &TopologySnapshot {
        &self.snapshot
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.snapshot.mark_disconnected();
    }

    fn me(&self) -> NodeId {
        self.snapshot.me()
    }

    fn route_to(&self, to: &ClusterId) -> Route {
        Route {
            from: self.snapshot.own().id.clone(),
            to: to.clone(),
        }
    }

    fn emit(
        &self,
        out: &mut Outbox,
        cause: Cause,
        target: Target,
        action: Action,
        affected: Option<NodeId>,
    ) {
        out.emit(OverlayEvent::Topology(TopologyChange {
            affected,
            cause,
            target,
            action,
            snapshot: Arc::new(self.snapshot.clone()),
        }));
    }

    /// Place `joiner`, either here or one level further down.
    pub(crate) fn on_join_request(
        &mut self,
        joiner: NodeId,
        out: &mut Outbox,
        signals: &mut Vec<Signal>,
    ) {
        let me = self.me();
        if joiner == me {
            return;
        }

        if !self.snapshot.is_leader() {
            if let Some(leader) = self.snapshot.own_leader() {
                let route = self.route_to(&self.snapshot.own().id);
                out.send(Envelope::routed(me, leader, route, Message::JoinRequest { joiner }));
                cnp_metrics::increment_joins_forwarded();
                debug!(target: "canopy::membership", joiner = %joiner, leader = %leader, "Forwarded join to leader");
            }
            return;
        }

        if self.snapshot.own().table.contains(&joiner) {
            debug!(target: "canopy::membership", joiner = %joiner, "Repeated join, re-acknowledging");
            out.send(Envelope::direct(
                me,
                joiner,
                Message::JoinAck {
                    placement: self.snapshot.own_placement(),
                },
            ));
            return;
        }

        if let Some(Direction::Child(slot)) = self.snapshot.direction_of_member(&joiner) {
            self.forward_join(joiner, slot, out);
            return;
        }

        let size = self.snapshot.own().table.len();
        let reliability = self.snapshot.reliability();
        let fanout = self.snapshot.fanout();
        let accept = size < reliability || fanout == 0 || !self.snapshot.children_full();

        if !accept {
            let slots: Vec<u16> = self.snapshot.populated_slots().collect();
            if slots.is_empty() {
                return;
            }
            let slot = slots[self.next_child % slots.len()];
            self.next_child = self.next_child.wrapping_add(1);
            self.forward_join(joiner, slot, out);
            return;
        }

        let split_size = (2 * reliability).saturating_sub(1);
        if fanout > 0 && size >= split_size {
            if let Some(slot) = self.snapshot.first_free_slot() {
                self.split(joiner, slot, out, signals);
                return;
            }
        }
        self.add(joiner, out);
    }

    fn forward_join(&self, joiner: NodeId, slot: u16, out: &mut Outbox) {
        let Some(child) = self.snapshot.child(slot) else {
            return;
        };
        let Some(leader) = child.leader() else {
            return;
        };
        out.send(Envelope::routed(
            self.me(),
            leader,
            self.route_to(&child.id),
            Message::JoinRequest { joiner },
        ));
        cnp_metrics::increment_joins_forwarded();
        debug!(
            target: "canopy::membership",
            joiner = %joiner,
            child = %child.id,
            "Pushed join to child cluster"
        );
    }

    fn add(&mut self, joiner: NodeId, out: &mut Outbox) {
        self.snapshot.own_mut().table.insert(joiner);
        self.push_own_table(Cause::Join, Some(joiner), &[joiner], out);
        out.send(Envelope::direct(
            self.me(),
            joiner,
            Message::JoinAck {
                placement: self.snapshot.own_placement(),
            },
        ));
        cnp_metrics::increment_joins_accepted();
        info!(
            target: "canopy::membership",
            joiner = %joiner,
            cluster = %self.snapshot.own().id,
            size = self.snapshot.own().table.len(),
            "Accepted join"
        );
        self.emit(out, Cause::Join, Target::Own, Action::Add, Some(joiner));
    }

    fn split(&mut self, joiner: NodeId, slot: u16, out: &mut Outbox, signals: &mut Vec<Signal>) {
        let me = self.me();
        let count = self.snapshot.reliability().saturating_sub(1);
        let moved = self.snapshot.own_mut().table.split_off_newest(count);

        let child_id = self.snapshot.own().id.child(slot);
        let child_view = ClusterView::new(
            child_id,
            ClusterTable::from_chronology(moved.iter().copied().chain([joiner])),
        );
        self.snapshot.set_child(slot, child_view.clone());

        let placement = self.snapshot.placement_for(
            child_view.clone(),
            Some(self.snapshot.own().clone()),
            vec![None; self.snapshot.fanout()],
        );
        for member in &moved {
            out.send(Envelope::direct(
                me,
                *member,
                Message::Relocate {
                    placement: placement.clone(),
                },
            ));
        }
        out.send(Envelope::direct(me, joiner, Message::JoinAck { placement }));

        // Everyone that stays learns the shrunken table; the new cluster
        // already got it inside its placement.
        let mut skip = moved.clone();
        skip.push(joiner);
        self.push_own_table(Cause::Move, None, &skip, out);

        let own_route = self.route_to(&self.snapshot.own().id);
        for member in self.snapshot.siblings() {
            out.send(Envelope::routed(
                me,
                member,
                own_route.clone(),
                Message::TableUpdate {
                    view: child_view.clone(),
                    cause: Cause::Join,
                    affected: Some(joiner),
                },
            ));
        }

        cnp_metrics::increment_cluster_splits();
        cnp_metrics::increment_joins_accepted();
        info!(
            target: "canopy::membership",
            joiner = %joiner,
            child = %child_view.id,
            moved = moved.len(),
            size = self.snapshot.own().table.len(),
            "Split cluster"
        );

        for member in &moved {
            self.emit(out, Cause::Move, Target::Own, Action::Remove, Some(*member));
        }
        self.emit(out, Cause::Join, Target::Child(slot), Action::Add, Some(joiner));
        signals.push(Signal::SiblingsMoved(slot, moved));
    }

    /// Send the own table to every sibling and every neighbor-cluster member,
    /// except those in `skip`.
    fn push_own_table(
        &self,
        cause: Cause,
        affected: Option<NodeId>,
        skip: &[NodeId],
        out: &mut Outbox,
    ) {
        let me = self.me();
        let view = self.snapshot.own().clone();
        let own_route = self.route_to(&view.id);

        for member in self.snapshot.siblings().filter(|m| !skip.contains(m)) {
            out.send(Envelope::routed(
                me,
                member,
                own_route.clone(),
                Message::TableUpdate {
                    view: view.clone(),
                    cause,
                    affected,
                },
            ));
        }
        for (cluster, member) in self.snapshot.neighbor_members() {
            if skip.contains(&member) {
                continue;
            }
            out.send(Envelope::routed(
                me,
                member,
                self.route_to(&cluster),
                Message::TableUpdate {
                    view: view.clone(),
                    cause,
                    affected,
                },
            ));
        }
    }

    pub(crate) fn on_table_update(
        &mut self,
        view: ClusterView,
        cause: Cause,
        affected: Option<NodeId>,
        out: &mut Outbox,
        signals: &mut Vec<Signal>,
    ) {
        let me = self.me();

        if view.id == self.snapshot.own().id {
            if !view.table.contains(&me) {
                warn!(
                    target: "canopy::membership",
                    cluster = %view.id,
                    "Ignoring own-cluster table that omits this node"
                );
                return;
            }
            let old = self.snapshot.own().table.clone();
            if old == view.table {
                return;
            }
            let was_leader = self.snapshot.is_leader();
            self.snapshot.own_mut().table = view.table;
            self.emit_diff(out, cause, Target::Own, &old, affected);

            let new_leader = self.snapshot.own_leader();
            if new_leader != old.main() {
                match new_leader {
                    Some(leader) if leader == me => {
                        if !was_leader {
                            self.convert(None, out, signals);
                        }
                    },
                    Some(leader) => signals.push(Signal::OwnLeaderChanged(leader)),
                    None => {},
                }
            }
            return;
        }

        let dir = match self.snapshot.direction_of(&view.id) {
            Some(dir) => dir,
            None => return,
        };

        match self.snapshot.neighbor(dir).cloned() {
            Some(existing) => {
                if existing.table == view.table {
                    return;
                }
                let old_leader = existing.leader();
                if let Some(slot) = self.snapshot.neighbor_mut(dir) {
                    slot.table = view.table;
                }
                self.emit_diff(out, cause, dir.into(), &existing.table, affected);

                let new_leader = self.snapshot.neighbor_leader(dir);
                match new_leader {
                    None => signals.push(Signal::Disconnect),
                    Some(leader) if Some(leader) != old_leader => {
                        signals.push(Signal::NeighborLeaderChanged(dir, leader));
                    },
                    Some(_) => {},
                }
            },
            None => {
                // A child cluster created by a split this node did not lead.
                if let Direction::Child(slot) = dir {
                    if view.table.is_empty() {
                        return;
                    }
                    self.snapshot.set_child(slot, view);
                    self.emit_diff(out, cause, Target::Child(slot), &ClusterTable::default(), affected);
                }
            },
        }
    }

    fn emit_diff(
        &self,
        out: &mut Outbox,
        cause: Cause,
        target: Target,
        old: &ClusterTable,
        affected: Option<NodeId>,
    ) {
        let Some(current) = self.table_for(target) else {
            return;
        };
        let added: Vec<NodeId> = current.iter().filter(|n| !old.contains(n)).copied().collect();
        let removed: Vec<NodeId> = old.iter().filter(|n| !current.contains(n)).copied().collect();

        if added.is_empty() && removed.is_empty() {
            self.emit(out, cause, target, Action::None, affected);
            return;
        }
        for node in added {
            self.emit(out, cause, target, Action::Add, Some(node));
        }
        for node in removed {
            self.emit(out, cause, target, Action::Remove, Some(node));
        }
    }

    fn table_for(&self, target: Target) -> Option<&ClusterTable> {
        match target {
            Target::Own => Some(&self.snapshot.own().table),
            Target::Parent => self.snapshot.parent().map(|v| &v.table),
            Target::Child(slot) => self.snapshot.child(slot).map(|v| &v.table),
        }
    }

    /// Move into the cluster described by `placement`, as told by the
    /// leader that split this node's previous cluster.
    pub(crate) fn on_relocate(
        &mut self,
        from: NodeId,
        placement: Placement,
        out: &mut Outbox,
        signals: &mut Vec<Signal>,
    ) {
        let me = self.me();
        if self.snapshot.own_leader() != Some(from) || !placement.own.table.contains(&me) {
            debug!(target: "canopy::membership", from = %from, "Ignoring stale relocation");
            return;
        }

        self.snapshot.replace(placement);
        info!(
            target: "canopy::membership",
            cluster = %self.snapshot.own().id,
            leader = ?self.snapshot.own_leader(),
            "Relocated to new cluster"
        );
        self.emit(out, Cause::Move, Target::Own, Action::Add, Some(me));

        signals.push(Signal::Relocated);
        match self.snapshot.own_leader() {
            Some(leader) if leader == me => signals.push(Signal::BecameLeader),
            Some(leader) => signals.push(Signal::OwnLeaderChanged(leader)),
            None => {},
        }
    }

    /// React to `node` being presumed dead.
    pub(crate) fn on_unreachable(&mut self, node: NodeId, out: &mut Outbox, signals: &mut Vec<Signal>) {
        let me = self.me();
        if node == me {
            return;
        }

        if self.snapshot.own().table.contains(&node) {
            let i_lead = self.snapshot.is_leader();
            let node_led = self.snapshot.own().table.is_main(&node);
            self.snapshot.own_mut().table.remove(&node);
            cnp_metrics::increment_members_removed();
            info!(
                target: "canopy::membership",
                node = %node,
                was_leader = node_led,
                cluster = %self.snapshot.own().id,
                "Removed unreachable member"
            );
            self.emit(out, Cause::Leave, Target::Own, Action::Remove, Some(node));

            if i_lead {
                self.push_own_table(Cause::Leave, Some(node), &[], out);
                signals.push(Signal::SiblingGone(node));
            } else if node_led {
                if self.snapshot.is_leader() {
                    self.convert(Some(node), out, signals);
                } else {
                    signals.push(Signal::OwnLeaderUnresolved);
                }
            }
            return;
        }

        let dirs: Vec<Direction> = self
            .snapshot
            .neighbor_directions()
            .into_iter()
            .filter(|dir| self.snapshot.neighbor(*dir).is_some_and(|v| v.table.contains(&node)))
            .collect();
        for dir in dirs {
            if !self.remove_from_neighbor(dir, node, out, signals) {
                return;
            }
        }
    }

    /// Drop `node` from the neighbor cluster at `dir`. Returns false when
    /// that empties the cluster and the node must disconnect.
    fn remove_from_neighbor(
        &mut self,
        dir: Direction,
        node: NodeId,
        out: &mut Outbox,
        signals: &mut Vec<Signal>,
    ) -> bool {
        let me = self.me();
        let Some(view) = self.snapshot.neighbor_mut(dir) else {
            return true;
        };
        let node_led = view.table.is_main(&node);
        view.table.remove(&node);
        let cluster = view.id.clone();
        let remaining = view.leader();
        cnp_metrics::increment_members_removed();
        self.emit(out, Cause::Leave, dir.into(), Action::Remove, Some(node));

        let Some(leader) = remaining else {
            warn!(
                target: "canopy::membership",
                cluster = %cluster,
                "Neighbor cluster is empty"
            );
            signals.push(Signal::Disconnect);
            return false;
        };

        if node_led {
            info!(
                target: "canopy::membership",
                failed = %node,
                leader = %leader,
                dir = %dir,
                "Neighbor leader replaced"
            );
            out.send(Envelope::routed(
                me,
                leader,
                self.route_to(&cluster),
                Message::LeaderNotice { failed: node },
            ));
            signals.push(Signal::NeighborLeaderChanged(dir, leader));
        }
        true
    }

    /// A neighbor told this cluster its leader is gone.
    pub(crate) fn on_leader_notice(&mut self, failed: NodeId, out: &mut Outbox, signals: &mut Vec<Signal>) {
        if self.snapshot.own().table.contains(&failed) {
            self.on_unreachable(failed, out, signals);
        }
    }

    fn convert(&mut self, failed: Option<NodeId>, out: &mut Outbox, signals: &mut Vec<Signal>) {
        self.push_own_table(Cause::Leave, failed, &[], out);
        signals.push(Signal::BecameLeader);
        cnp_metrics::increment_leader_conversions();
        info!(
            target: "canopy::membership",
            cluster = %self.snapshot.own().id,
            size = self.snapshot.own().table.len(),
            "Converted to cluster leader"
        );
    }
}
