//! Three-stage acknowledged forwarding.
//!
//! - Stage 1: a member hands a message to its own leader and keeps it until
//!   the leader acks.
//! - Stage 2: leaders pass the message across tree edges. Each leader records
//!   which directions still owe an ack and which neighbor to ack upstream.
//! - Stage 3: a leader fans a broadcast out to the rest of its cluster.
//!   Members keep it until the leader releases it, so a member that is
//!   promoted can replay whatever its old leader had in flight.
//!
//! All caches are keyed by [`MessageId`]. Delivery to the application is
//! decided separately through a bounded window of ids already surfaced.

use crate::events::{Delivery, OverlayEvent};
use crate::membership::Signal;
use crate::message::{DeliveryKind, Envelope, Forward, Message, MessageId, Route};
use crate::node::Outbox;
use crate::snapshot::{Direction, TopologySnapshot};
use bytes::Bytes;
use cnp_core::{ClusterId, NodeId};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Insertion-ordered set of ids that forgets its oldest entry past `cap`.
pub(crate) struct RecentIds {
    cap: usize,
    order: VecDeque<MessageId>,
    set: HashSet<MessageId>,
}

impl RecentIds {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    /// Returns false if `id` was already remembered.
    pub(crate) fn insert(&mut self, id: MessageId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub(crate) fn contains(&self, id: &MessageId) -> bool {
        self.set.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }
}

/// Per-node forwarding counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardingStats {
    pub originated: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub bounces: u64,
    pub replays: u64,
}

/// Cache occupancy, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub stage1: usize,
    pub stage2: usize,
    pub stage3: usize,
}

impl PendingCounts {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stage1 == 0 && self.stage2 == 0 && self.stage3 == 0
    }
}

/// A message this node handed to its leader.
struct Outgoing {
    kind: DeliveryKind,
    payload: Bytes,
    deadline: Instant,
}

/// Neighbor owed a stage-2 ack once a relay completes.
struct Upstream {
    node: NodeId,
    cluster: ClusterId,
    dir: Option<Direction>,
}

/// A message a leader is propagating.
struct Relay {
    kind: DeliveryKind,
    payload: Bytes,
    upstream: Option<Upstream>,
    /// Directions still owing a stage-2 ack, with the leader last targeted.
    pending_dirs: BTreeMap<Direction, NodeId>,
    pending_siblings: BTreeSet<NodeId>,
    /// Siblings to release once the relay completes.
    fanned_out: BTreeSet<NodeId>,
    /// Members that sent this as stage 1 and await an ack.
    member_acks: BTreeSet<NodeId>,
    deadline: Instant,
}

impl Relay {
    fn is_settled(&self) -> bool {
        self.pending_dirs.is_empty() && self.pending_siblings.is_empty()
    }
}

/// A broadcast a member received from its leader.
struct Held {
    kind: DeliveryKind,
    payload: Bytes,
    seq: u64,
}

pub struct Forwarding {
    me: NodeId,
    ack_timeout: Duration,
    next_seq: u64,
    stage1: BTreeMap<MessageId, Outgoing>,
    stage2: BTreeMap<MessageId, Relay>,
    stage3: BTreeMap<MessageId, Held>,
    /// Arrival order of `stage3`; entries whose seq no longer matches are stale.
    stage3_order: VecDeque<(u64, MessageId)>,
    stage3_seq: u64,
    stage3_cap: usize,
    delivered: RecentIds,
    completed: RecentIds,
    stats: ForwardingStats,
}

fn own_route(snap: &TopologySnapshot) -> Route {
    Route {
        from: snap.own().id.clone(),
        to: snap.own().id.clone(),
    }
}

fn route_to(snap: &TopologySnapshot, to: &ClusterId) -> Route {
    Route {
        from: snap.own().id.clone(),
        to: to.clone(),
    }
}

/// Whether a leader holding this snapshot surfaces a message of `kind`.
fn leader_in_scope(kind: DeliveryKind, snap: &TopologySnapshot) -> bool {
    match kind {
        DeliveryKind::Broadcast => true,
        DeliveryKind::ToRoot => snap.is_root(),
    }
}

impl Forwarding {
    #[must_use]
    pub fn new(me: NodeId, ack_timeout: Duration, window: usize) -> Self {
        Self {
            me,
            ack_timeout,
            next_seq: 1,
            stage1: BTreeMap::new(),
            stage2: BTreeMap::new(),
            stage3: BTreeMap::new(),
            stage3_order: VecDeque::new(),
            stage3_seq: 0,
            stage3_cap: window.max(1),
            delivered: RecentIds::new(window),
            completed: RecentIds::new(window),
            stats: ForwardingStats::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> ForwardingStats {
        self.stats
    }

    #[must_use]
    pub fn pending(&self) -> PendingCounts {
        PendingCounts {
            stage1: self.stage1.len(),
            stage2: self.stage2.len(),
            stage3: self.stage3.len(),
        }
    }

    #[must_use]
    pub fn delivered_window_len(&self) -> usize {
        self.delivered.len()
    }

    /// Inject a new message from the local application.
    pub(crate) fn originate(
        &mut self,
        kind: DeliveryKind,
        payload: Bytes,
        snap: &TopologySnapshot,
        now: Instant,
        out: &mut Outbox,
    ) -> MessageId {
        let id = MessageId::new(self.me, self.next_seq);
        self.next_seq += 1;
        self.stats.originated += 1;
        cnp_metrics::increment_messages_originated();

        if snap.is_leader() {
            self.relay_new(Forward { id, kind, payload }, None, BTreeSet::new(), snap, now, out);
        } else {
            let outgoing = Outgoing {
                kind,
                payload,
                deadline: now + self.ack_timeout,
            };
            self.send_stage1(id, &outgoing, snap, out);
            self.stage1.insert(id, outgoing);
        }
        debug!(target: "canopy::forwarding", id = %id, kind = ?kind, "Message originated");
        id
    }

    pub(crate) fn on_stage1(
        &mut self,
        from: NodeId,
        fwd: Forward,
        snap: &TopologySnapshot,
        now: Instant,
        out: &mut Outbox,
    ) {
        let id = fwd.id;
        if self.completed.contains(&id) {
            self.note_duplicate();
            out.send(Envelope::routed(self.me, from, own_route(snap), Message::Stage1Ack(id)));
            return;
        }
        if let Some(relay) = self.stage2.get_mut(&id) {
            relay.member_acks.insert(from);
            self.note_duplicate();
            return;
        }
        let members = BTreeSet::from([from]);
        self.relay_new(fwd, None, members, snap, now, out);
    }

    pub(crate) fn on_stage2(
        &mut self,
        from: NodeId,
        from_cluster: ClusterId,
        fwd: Forward,
        snap: &TopologySnapshot,
        now: Instant,
        out: &mut Outbox,
    ) {
        let id = fwd.id;
        let dir = snap.direction_of(&from_cluster);

        if self.completed.contains(&id) {
            self.note_duplicate();
            self.ack_stage2(id, from, &from_cluster, snap, out);
            return;
        }

        if let Some(relay) = self.stage2.get_mut(&id) {
            self.stats.duplicates += 1;
            cnp_metrics::increment_duplicates_suppressed();

            // Re-sent by the same neighbor cluster, possibly by its new leader.
            if let Some(upstream) = relay.upstream.as_mut() {
                if upstream.dir.is_some() && upstream.dir == dir {
                    upstream.node = from;
                    return;
                }
            }

            let owed = dir.is_some_and(|d| relay.pending_dirs.remove(&d).is_some());
            if owed && relay.upstream.is_none() {
                relay.upstream = Some(Upstream {
                    node: from,
                    cluster: from_cluster,
                    dir,
                });
            } else {
                self.ack_stage2(id, from, &from_cluster, snap, out);
            }
            if owed {
                self.try_complete(id, snap, out);
            }
            return;
        }

        let upstream = Upstream {
            node: from,
            cluster: from_cluster,
            dir,
        };
        self.relay_new(fwd, Some(upstream), BTreeSet::new(), snap, now, out);
    }

    pub(crate) fn on_stage3(
        &mut self,
        from: NodeId,
        fwd: Forward,
        snap: &TopologySnapshot,
        out: &mut Outbox,
    ) {
        let id = fwd.id;
        if fwd.kind == DeliveryKind::Broadcast {
            self.deliver(id, fwd.kind, &fwd.payload, out);
        }
        if !snap.is_leader() && !self.stage3.contains_key(&id) {
            self.hold(id, fwd.kind, fwd.payload);
        }
        out.send(Envelope::routed(self.me, from, own_route(snap), Message::Stage3Ack(id)));
    }

    pub(crate) fn on_stage1_ack(&mut self, id: MessageId) {
        if self.stage1.remove(&id).is_some() {
            trace!(target: "canopy::forwarding", id = %id, "Stage 1 acknowledged");
        }
    }

    pub(crate) fn on_stage2_ack(
        &mut self,
        from: NodeId,
        from_cluster: &ClusterId,
        id: MessageId,
        snap: &TopologySnapshot,
        out: &mut Outbox,
    ) {
        let Some(relay) = self.stage2.get_mut(&id) else {
            return;
        };
        let dir = snap.direction_of(from_cluster).or_else(|| {
            relay
                .pending_dirs
                .iter()
                .find(|(_, target)| **target == from)
                .map(|(dir, _)| *dir)
        });
        if let Some(dir) = dir {
            relay.pending_dirs.remove(&dir);
        }
        self.try_complete(id, snap, out);
    }

    pub(crate) fn on_stage3_ack(
        &mut self,
        from: NodeId,
        id: MessageId,
        snap: &TopologySnapshot,
        out: &mut Outbox,
    ) {
        if let Some(relay) = self.stage2.get_mut(&id) {
            relay.pending_siblings.remove(&from);
            self.try_complete(id, snap, out);
        }
    }

    pub(crate) fn on_stage3_release(&mut self, id: MessageId) {
        self.stage3.remove(&id);
    }

    /// A stage message came back as a routing error. Schedule it for the
    /// next retry pass, which re-resolves the destination.
    pub(crate) fn on_bounce(&mut self, original: &Message, now: Instant) {
        let deadline = match original {
            Message::Stage1(fwd) => self.stage1.get_mut(&fwd.id).map(|o| &mut o.deadline),
            Message::Stage2(fwd) | Message::Stage3(fwd) => {
                self.stage2.get_mut(&fwd.id).map(|r| &mut r.deadline)
            },
            _ => None,
        };
        if let Some(deadline) = deadline {
            *deadline = now;
            self.stats.bounces += 1;
        }
    }

    /// Resend everything whose ack deadline has passed.
    pub(crate) fn on_tick(&mut self, snap: &TopologySnapshot, now: Instant, out: &mut Outbox) {
        let me = self.me;
        let mut retried = 0u64;

        if !snap.is_leader() {
            let leader = snap.own_leader().filter(|l| *l != me);
            for (id, outgoing) in &mut self.stage1 {
                if outgoing.deadline > now {
                    continue;
                }
                outgoing.deadline = now + self.ack_timeout;
                if let Some(leader) = leader {
                    out.send(Envelope::routed(
                        me,
                        leader,
                        own_route(snap),
                        Message::Stage1(Forward {
                            id: *id,
                            kind: outgoing.kind,
                            payload: outgoing.payload.clone(),
                        }),
                    ));
                    retried += 1;
                }
            }
        }

        let mut settled = Vec::new();
        for (id, relay) in &mut self.stage2 {
            if relay.deadline > now {
                continue;
            }
            relay.deadline = now + self.ack_timeout;
            let fwd = Forward {
                id: *id,
                kind: relay.kind,
                payload: relay.payload.clone(),
            };

            // A direction whose cluster is gone owes nothing.
            relay
                .pending_dirs
                .retain(|dir, _| snap.neighbor_leader(*dir).is_some());
            for (dir, target) in &mut relay.pending_dirs {
                if let (Some(leader), Some(view)) = (snap.neighbor_leader(*dir), snap.neighbor(*dir)) {
                    *target = leader;
                    out.send(Envelope::routed(
                        me,
                        leader,
                        route_to(snap, &view.id),
                        Message::Stage2(fwd.clone()),
                    ));
                    retried += 1;
                }
            }

            relay
                .pending_siblings
                .retain(|s| snap.own().table.contains(s));
            for sibling in &relay.pending_siblings {
                out.send(Envelope::routed(
                    me,
                    *sibling,
                    own_route(snap),
                    Message::Stage3(fwd.clone()),
                ));
                retried += 1;
            }

            if relay.is_settled() {
                settled.push(*id);
            }
        }
        for id in settled {
            self.try_complete(id, snap, out);
        }

        if retried > 0 {
            self.stats.retries += retried;
            cnp_metrics::increment_forward_retries(retried);
            debug!(target: "canopy::forwarding", retried, "Resent unacknowledged messages");
        }
    }

    /// React to a topology change reported by membership.
    pub(crate) fn on_signal(
        &mut self,
        signal: Signal,
        snap: &TopologySnapshot,
        now: Instant,
        out: &mut Outbox,
    ) {
        match signal {
            Signal::SiblingGone(node) => self.sibling_gone(node, snap, out),
            Signal::SiblingsMoved(slot, moved) => self.siblings_moved(slot, &moved, snap, now, out),
            Signal::OwnLeaderUnresolved => {
                for outgoing in self.stage1.values_mut() {
                    outgoing.deadline = now;
                }
            },
            Signal::OwnLeaderChanged(leader) => {
                if leader == self.me {
                    return;
                }
                for (id, outgoing) in &mut self.stage1 {
                    outgoing.deadline = now + self.ack_timeout;
                    out.send(Envelope::routed(
                        self.me,
                        leader,
                        own_route(snap),
                        Message::Stage1(Forward {
                            id: *id,
                            kind: outgoing.kind,
                            payload: outgoing.payload.clone(),
                        }),
                    ));
                }
            },
            Signal::NeighborLeaderChanged(dir, leader) => {
                self.neighbor_leader_changed(dir, leader, snap, now, out);
            },
            Signal::BecameLeader => self.replay(snap, now, out),
            Signal::Relocated => self.drop_held(),
            Signal::Disconnect => self.clear(),
        }
    }

    /// Drop every cache. Used on disconnection.
    pub(crate) fn clear(&mut self) {
        self.stage1.clear();
        self.stage2.clear();
        self.drop_held();
        self.delivered.clear();
        self.completed.clear();
    }

    /// Keep a broadcast received from the leader, evicting the oldest held
    /// entry once over capacity.
    fn hold(&mut self, id: MessageId, kind: DeliveryKind, payload: Bytes) {
        self.stage3_seq += 1;
        let seq = self.stage3_seq;
        self.stage3.insert(id, Held { kind, payload, seq });
        self.stage3_order.push_back((seq, id));

        while self.stage3.len() > self.stage3_cap {
            let Some((seq, oldest)) = self.stage3_order.pop_front() else {
                break;
            };
            if self.stage3.get(&oldest).is_some_and(|h| h.seq == seq) {
                self.stage3.remove(&oldest);
            }
        }
        if self.stage3_order.len() > 2 * self.stage3_cap {
            let held = &self.stage3;
            self.stage3_order
                .retain(|(seq, id)| held.get(id).is_some_and(|h| h.seq == *seq));
        }
    }

    fn drop_held(&mut self) {
        self.stage3.clear();
        self.stage3_order.clear();
    }

    fn sibling_gone(&mut self, node: NodeId, snap: &TopologySnapshot, out: &mut Outbox) {
        let mut touched = Vec::new();
        for (id, relay) in &mut self.stage2 {
            let owed = relay.pending_siblings.remove(&node);
            relay.member_acks.remove(&node);
            relay.fanned_out.remove(&node);
            if owed {
                touched.push(*id);
            }
        }
        for id in touched {
            self.try_complete(id, snap, out);
        }
    }

    /// Members moved into a new child cluster are still owed whatever they
    /// had not acknowledged. The child's leader takes that over as stage 2.
    fn siblings_moved(
        &mut self,
        slot: u16,
        moved: &[NodeId],
        snap: &TopologySnapshot,
        now: Instant,
        out: &mut Outbox,
    ) {
        let dir = Direction::Child(slot);
        let (Some(leader), Some(view)) = (snap.neighbor_leader(dir), snap.neighbor(dir)) else {
            for node in moved {
                self.sibling_gone(*node, snap, out);
            }
            return;
        };
        let route = route_to(snap, &view.id);

        let mut handed_over = Vec::new();
        for (id, relay) in &mut self.stage2 {
            let mut owed = false;
            for node in moved {
                owed |= relay.pending_siblings.remove(node);
                relay.member_acks.remove(node);
                relay.fanned_out.remove(node);
            }
            if !owed {
                continue;
            }
            if relay.upstream.as_ref().is_none_or(|u| u.dir != Some(dir)) {
                relay.pending_dirs.insert(dir, leader);
                relay.deadline = now + self.ack_timeout;
                out.send(Envelope::routed(
                    self.me,
                    leader,
                    route.clone(),
                    Message::Stage2(Forward {
                        id: *id,
                        kind: relay.kind,
                        payload: relay.payload.clone(),
                    }),
                ));
            }
            handed_over.push(*id);
        }
        if !handed_over.is_empty() {
            debug!(
                target: "canopy::forwarding",
                child = %view.id,
                leader = %leader,
                handed_over = handed_over.len(),
                "Handed unacknowledged messages to new child cluster"
            );
        }
        for id in handed_over {
            self.try_complete(id, snap, out);
        }
    }

    fn neighbor_leader_changed(
        &mut self,
        dir: Direction,
        leader: NodeId,
        snap: &TopologySnapshot,
        now: Instant,
        out: &mut Outbox,
    ) {
        let Some(view) = snap.neighbor(dir) else {
            return;
        };
        let route = route_to(snap, &view.id);
        let mut resent = 0u64;
        for (id, relay) in &mut self.stage2 {
            if let Some(upstream) = relay.upstream.as_mut() {
                if upstream.dir == Some(dir) {
                    upstream.node = leader;
                }
            }
            if let Some(target) = relay.pending_dirs.get_mut(&dir) {
                *target = leader;
                relay.deadline = now + self.ack_timeout;
                out.send(Envelope::routed(
                    self.me,
                    leader,
                    route.clone(),
                    Message::Stage2(Forward {
                        id: *id,
                        kind: relay.kind,
                        payload: relay.payload.clone(),
                    }),
                ));
                resent += 1;
            }
        }
        if resent > 0 {
            debug!(
                target: "canopy::forwarding",
                dir = %dir,
                leader = %leader,
                resent,
                "Re-sent pending messages to new neighbor leader"
            );
        }
    }

    /// Take over what the previous leader had in flight: messages this node
    /// was still trying to hand upward, then everything it held as a member.
    fn replay(&mut self, snap: &TopologySnapshot, now: Instant, out: &mut Outbox) {
        let outgoing = std::mem::take(&mut self.stage1);
        let held = std::mem::take(&mut self.stage3);
        self.stage3_order.clear();
        let mut replayed = 0u64;

        let pending = outgoing
            .into_iter()
            .map(|(id, o)| (id, o.kind, o.payload))
            .chain(held.into_iter().map(|(id, h)| (id, h.kind, h.payload)));

        for (id, kind, payload) in pending {
            if self.stage2.contains_key(&id) || self.completed.contains(&id) {
                continue;
            }
            self.relay_new(Forward { id, kind, payload }, None, BTreeSet::new(), snap, now, out);
            replayed += 1;
        }

        if replayed > 0 {
            self.stats.replays += replayed;
            cnp_metrics::increment_failover_replays(replayed);
            debug!(target: "canopy::forwarding", replayed, "Replayed in-flight messages after promotion");
        }
    }

    /// Start propagating a message not yet known to this leader.
    fn relay_new(
        &mut self,
        fwd: Forward,
        upstream: Option<Upstream>,
        member_acks: BTreeSet<NodeId>,
        snap: &TopologySnapshot,
        now: Instant,
        out: &mut Outbox,
    ) {
        let Forward { id, kind, payload } = fwd;
        if leader_in_scope(kind, snap) {
            self.deliver(id, kind, &payload, out);
        }

        let arrival = upstream.as_ref().and_then(|u| u.dir);
        let dirs = match kind {
            DeliveryKind::Broadcast => snap.neighbor_directions(),
            DeliveryKind::ToRoot => snap.parent().map(|_| Direction::Parent).into_iter().collect(),
        };

        let mut pending_dirs = BTreeMap::new();
        for dir in dirs {
            if Some(dir) == arrival {
                continue;
            }
            let (Some(leader), Some(view)) = (snap.neighbor_leader(dir), snap.neighbor(dir)) else {
                continue;
            };
            out.send(Envelope::routed(
                self.me,
                leader,
                route_to(snap, &view.id),
                Message::Stage2(Forward {
                    id,
                    kind,
                    payload: payload.clone(),
                }),
            ));
            pending_dirs.insert(dir, leader);
        }

        let mut pending_siblings = BTreeSet::new();
        if kind == DeliveryKind::Broadcast {
            for sibling in snap.siblings() {
                out.send(Envelope::routed(
                    self.me,
                    sibling,
                    own_route(snap),
                    Message::Stage3(Forward {
                        id,
                        kind,
                        payload: payload.clone(),
                    }),
                ));
                pending_siblings.insert(sibling);
            }
        }

        trace!(
            target: "canopy::forwarding",
            id = %id,
            dirs = pending_dirs.len(),
            siblings = pending_siblings.len(),
            "Relaying message"
        );

        self.stage2.insert(
            id,
            Relay {
                kind,
                payload,
                upstream,
                pending_dirs,
                fanned_out: pending_siblings.clone(),
                pending_siblings,
                member_acks,
                deadline: now + self.ack_timeout,
            },
        );
        self.try_complete(id, snap, out);
    }

    /// Finish a relay once every owed ack has arrived.
    fn try_complete(&mut self, id: MessageId, snap: &TopologySnapshot, out: &mut Outbox) {
        if !self.stage2.get(&id).is_some_and(Relay::is_settled) {
            return;
        }
        let Some(relay) = self.stage2.remove(&id) else {
            return;
        };

        if let Some(upstream) = &relay.upstream {
            self.ack_stage2(id, upstream.node, &upstream.cluster, snap, out);
        }
        for member in &relay.member_acks {
            out.send(Envelope::routed(self.me, *member, own_route(snap), Message::Stage1Ack(id)));
        }
        for sibling in relay
            .fanned_out
            .iter()
            .filter(|s| snap.own().table.contains(s))
        {
            out.send(Envelope::routed(
                self.me,
                *sibling,
                own_route(snap),
                Message::Stage3Release(id),
            ));
        }
        self.completed.insert(id);
        trace!(target: "canopy::forwarding", id = %id, "Relay complete");
    }

    fn ack_stage2(
        &self,
        id: MessageId,
        to: NodeId,
        cluster: &ClusterId,
        snap: &TopologySnapshot,
        out: &mut Outbox,
    ) {
        out.send(Envelope::routed(self.me, to, route_to(snap, cluster), Message::Stage2Ack(id)));
    }

    fn send_stage1(&self, id: MessageId, outgoing: &Outgoing, snap: &TopologySnapshot, out: &mut Outbox) {
        let Some(leader) = snap.own_leader().filter(|l| *l != self.me) else {
            return;
        };
        out.send(Envelope::routed(
            self.me,
            leader,
            own_route(snap),
            Message::Stage1(Forward {
                id,
                kind: outgoing.kind,
                payload: outgoing.payload.clone(),
            }),
        ));
    }

    fn deliver(&mut self, id: MessageId, kind: DeliveryKind, payload: &Bytes, out: &mut Outbox) {
        if self.delivered.insert(id) {
            self.stats.delivered += 1;
            cnp_metrics::increment_messages_delivered();
            out.emit(OverlayEvent::Delivered(Delivery {
                id,
                kind,
                payload: payload.clone(),
            }));
        } else {
            self.note_duplicate();
        }
    }

    fn note_duplicate(&mut self) {
        self.stats.duplicates += 1;
        cnp_metrics::increment_duplicates_suppressed();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::snapshot::{ClusterView, Placement};
    use crate::table::ClusterTable;
    use std::net::SocketAddr;

    fn node(port: u16) -> NodeId {
        NodeId::new(SocketAddr::from(([127, 0, 0, 1], port)), 1)
    }

    /// `me` leads `/0` with one sibling, under a root led by node 1.
    fn leader_snapshot(me: NodeId) -> TopologySnapshot {
        let own = ClusterId::root().child(0);
        TopologySnapshot::from_placement(
            me,
            Placement {
                reliability: 2,
                fanout: 2,
                own: ClusterView::new(own, ClusterTable::from_chronology([me, node(21)])),
                parent: Some(ClusterView::new(
                    ClusterId::root(),
                    ClusterTable::from_chronology([node(1), node(2)]),
                )),
                children: vec![None, None],
            },
        )
    }

    fn stage_targets(out: &Outbox) -> Vec<(&'static str, NodeId)> {
        out.messages.iter().map(|e| (e.body.name(), e.to)).collect()
    }

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let mut ids = RecentIds::new(2);
        let a = MessageId::new(node(1), 1);
        let b = MessageId::new(node(1), 2);
        let c = MessageId::new(node(1), 3);
        assert!(ids.insert(a));
        assert!(!ids.insert(a));
        ids.insert(b);
        ids.insert(c);
        assert!(!ids.contains(&a));
        assert!(ids.contains(&b) && ids.contains(&c));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_leader_originated_broadcast_fans_out() {
        let me = node(20);
        let snap = leader_snapshot(me);
        let mut fwd = Forwarding::new(me, Duration::from_millis(100), 64);
        let mut out = Outbox::default();
        let now = Instant::now();

        let id = fwd.originate(DeliveryKind::Broadcast, Bytes::from_static(b"x"), &snap, now, &mut out);

        assert_eq!(stage_targets(&out), vec![("stage2", node(1)), ("stage3", node(21))]);
        assert_eq!(fwd.stats().delivered, 1);
        assert_eq!(fwd.pending().stage2, 1);

        // Both acks complete the relay and release the sibling.
        let mut out = Outbox::default();
        fwd.on_stage3_ack(node(21), id, &snap, &mut out);
        fwd.on_stage2_ack(node(1), &ClusterId::root(), id, &snap, &mut out);
        assert_eq!(stage_targets(&out), vec![("stage3_release", node(21))]);
        assert!(fwd.pending().is_empty());
    }

    #[test]
    fn test_duplicate_from_pending_direction_counts_as_ack() {
        let me = node(20);
        let snap = leader_snapshot(me);
        let mut fwd = Forwarding::new(me, Duration::from_millis(100), 64);
        let now = Instant::now();
        let id = MessageId::new(node(21), 1);
        let msg = Forward {
            id,
            kind: DeliveryKind::Broadcast,
            payload: Bytes::from_static(b"x"),
        };

        // Arrives as stage 1 from the sibling; no upstream.
        let mut out = Outbox::default();
        fwd.on_stage1(node(21), msg.clone(), &snap, now, &mut out);
        fwd.on_stage3_ack(node(21), id, &snap, &mut out);

        // The parent relays the same message down: it is adopted as upstream.
        let mut out = Outbox::default();
        fwd.on_stage2(node(1), ClusterId::root(), msg, &snap, now, &mut out);

        let names: Vec<_> = stage_targets(&out);
        assert!(names.contains(&("stage2_ack", node(1))));
        assert!(names.contains(&("stage1_ack", node(21))));
        assert!(fwd.pending().is_empty());
        assert_eq!(fwd.stats().delivered, 1);
    }

    #[test]
    fn test_completed_message_is_acked_without_repropagation() {
        let me = node(20);
        let snap = leader_snapshot(me);
        let mut fwd = Forwarding::new(me, Duration::from_millis(100), 64);
        let now = Instant::now();
        let mut out = Outbox::default();
        let id = fwd.originate(DeliveryKind::ToRoot, Bytes::from_static(b"up"), &snap, now, &mut out);
        fwd.on_stage2_ack(node(1), &ClusterId::root(), id, &snap, &mut out);
        assert!(fwd.pending().is_empty());

        let mut out = Outbox::default();
        fwd.on_stage1(
            node(21),
            Forward {
                id,
                kind: DeliveryKind::ToRoot,
                payload: Bytes::from_static(b"up"),
            },
            &snap,
            now,
            &mut out,
        );
        assert_eq!(stage_targets(&out), vec![("stage1_ack", node(21))]);
    }

    #[test]
    fn test_member_retries_until_acked() {
        let me = node(21);
        let leader = node(20);
        let snap = TopologySnapshot::from_placement(
            me,
            Placement {
                reliability: 2,
                fanout: 2,
                own: ClusterView::new(ClusterId::root(), ClusterTable::from_chronology([leader, me])),
                parent: None,
                children: vec![None, None],
            },
        );
        let mut fwd = Forwarding::new(me, Duration::from_millis(100), 64);
        let start = Instant::now();
        let mut out = Outbox::default();
        let id = fwd.originate(DeliveryKind::Broadcast, Bytes::from_static(b"m"), &snap, start, &mut out);
        assert_eq!(stage_targets(&out), vec![("stage1", leader)]);
        // Members only surface broadcasts that come back through stage 3.
        assert_eq!(fwd.stats().delivered, 0);

        let mut out = Outbox::default();
        fwd.on_tick(&snap, start + Duration::from_millis(50), &mut out);
        assert!(out.messages.is_empty());

        fwd.on_tick(&snap, start + Duration::from_millis(150), &mut out);
        assert_eq!(stage_targets(&out), vec![("stage1", leader)]);

        fwd.on_stage1_ack(id);
        let mut out = Outbox::default();
        fwd.on_tick(&snap, start + Duration::from_secs(5), &mut out);
        assert!(out.messages.is_empty());
    }

    #[test]
    fn test_sibling_gone_releases_obligations() {
        let me = node(20);
        let snap = leader_snapshot(me);
        let mut fwd = Forwarding::new(me, Duration::from_millis(100), 64);
        let mut out = Outbox::default();
        let id = fwd.originate(DeliveryKind::Broadcast, Bytes::from_static(b"x"), &snap, Instant::now(), &mut out);
        fwd.on_stage2_ack(node(1), &ClusterId::root(), id, &snap, &mut out);
        assert_eq!(fwd.pending().stage2, 1);

        let mut out = Outbox::default();
        fwd.on_signal(Signal::SiblingGone(node(21)), &snap, Instant::now(), &mut out);
        assert!(fwd.pending().is_empty());
        // The gone sibling is not released; it is no longer tracked.
        assert!(out.messages.is_empty());
    }

    fn root_snapshot(me: NodeId, members: &[NodeId], child: Option<&[NodeId]>) -> TopologySnapshot {
        let root = ClusterId::root();
        let children = vec![
            child.map(|m| ClusterView::new(root.child(0), ClusterTable::from_chronology(m.iter().copied()))),
            None,
        ];
        TopologySnapshot::from_placement(
            me,
            Placement {
                reliability: 2,
                fanout: 2,
                own: ClusterView::new(root, ClusterTable::from_chronology(members.iter().copied())),
                parent: None,
                children,
            },
        )
    }

    #[test]
    fn test_moved_sibling_is_handed_to_child_leader() {
        let me = node(1);
        let before = root_snapshot(me, &[me, node(2), node(3)], None);
        let mut fwd = Forwarding::new(me, Duration::from_millis(100), 64);
        let now = Instant::now();
        let mut out = Outbox::default();
        let id = fwd.originate(DeliveryKind::Broadcast, Bytes::from_static(b"m"), &before, now, &mut out);

        // Node 3 never acked its stage 3 before being split off with node 4.
        let after = root_snapshot(me, &[me, node(2)], Some(&[node(3), node(4)]));
        let mut out = Outbox::default();
        fwd.on_signal(Signal::SiblingsMoved(0, vec![node(3)]), &after, now, &mut out);
        assert_eq!(stage_targets(&out), vec![("stage2", node(3))]);

        let mut out = Outbox::default();
        fwd.on_stage3_ack(node(2), id, &after, &mut out);
        assert_eq!(fwd.pending().stage2, 1);
        fwd.on_stage2_ack(node(3), &ClusterId::root().child(0), id, &after, &mut out);
        assert!(fwd.pending().is_empty());
        assert_eq!(stage_targets(&out), vec![("stage3_release", node(2))]);
    }

    #[test]
    fn test_moved_sibling_that_acked_needs_no_handover() {
        let me = node(1);
        let before = root_snapshot(me, &[me, node(2), node(3)], None);
        let mut fwd = Forwarding::new(me, Duration::from_millis(100), 64);
        let now = Instant::now();
        let mut out = Outbox::default();
        let id = fwd.originate(DeliveryKind::Broadcast, Bytes::from_static(b"m"), &before, now, &mut out);
        fwd.on_stage3_ack(node(3), id, &before, &mut out);

        let after = root_snapshot(me, &[me, node(2)], Some(&[node(3), node(4)]));
        let mut out = Outbox::default();
        fwd.on_signal(Signal::SiblingsMoved(0, vec![node(3)]), &after, now, &mut out);
        assert!(out.messages.is_empty());

        fwd.on_stage3_ack(node(2), id, &after, &mut out);
        assert!(fwd.pending().is_empty());
    }

    #[test]
    fn test_held_broadcasts_evict_in_arrival_order() {
        let me = node(21);
        let snap = TopologySnapshot::from_placement(
            me,
            Placement {
                reliability: 2,
                fanout: 2,
                own: ClusterView::new(ClusterId::root(), ClusterTable::from_chronology([node(20), me])),
                parent: None,
                children: vec![None, None],
            },
        );
        let mut fwd = Forwarding::new(me, Duration::from_millis(100), 2);
        let mut out = Outbox::default();
        let ids = [
            MessageId::new(node(40), 1),
            MessageId::new(node(41), 1),
            // Sorts before both, but arrives last.
            MessageId::new(node(5), 1),
        ];
        for id in ids {
            let msg = Forward {
                id,
                kind: DeliveryKind::Broadcast,
                payload: Bytes::from_static(b"h"),
            };
            fwd.on_stage3(node(20), msg, &snap, &mut out);
        }

        assert_eq!(fwd.pending().stage3, 2);
        assert!(!fwd.stage3.contains_key(&ids[0]));
        assert!(fwd.stage3.contains_key(&ids[1]));
        assert!(fwd.stage3.contains_key(&ids[2]));

        // A released entry leaves a stale slot that must not evict a re-held copy.
        fwd.on_stage3_release(ids[1]);
        fwd.on_stage3(
            node(20),
            Forward {
                id: ids[1],
                kind: DeliveryKind::Broadcast,
                payload: Bytes::from_static(b"h"),
            },
            &snap,
            &mut out,
        );
        let later = MessageId::new(node(6), 1);
        fwd.on_stage3(
            node(20),
            Forward {
                id: later,
                kind: DeliveryKind::Broadcast,
                payload: Bytes::from_static(b"h"),
            },
            &snap,
            &mut out,
        );
        assert!(fwd.stage3.contains_key(&ids[1]));
        assert!(fwd.stage3.contains_key(&later));
        assert!(!fwd.stage3.contains_key(&ids[2]));
    }
}
