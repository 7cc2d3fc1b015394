//! I/O-free overlay participant.
//!
//! [`OverlayNode`] owns the topology snapshot and every forwarding cache.
//! Each input (an inbound envelope, a transport failure, a timer tick, an
//! application request) is handled to completion and answered with an
//! [`Outbox`] of envelopes to transmit and events to surface. The caller is
//! responsible for moving bytes and time.

use crate::config::OverlayConfig;
use crate::error::{OverlayError, Result};
use crate::events::OverlayEvent;
use crate::forwarding::{Forwarding, ForwardingStats, PendingCounts};
use crate::membership::{Membership, Signal};
use crate::message::{DeliveryKind, Envelope, Message, MessageId};
use crate::probe::ProbeTracker;
use crate::snapshot::TopologySnapshot;
use bytes::Bytes;
use cnp_core::NodeId;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Output of one state-machine step.
#[derive(Debug, Default)]
#[must_use]
pub struct Outbox {
    pub messages: Vec<Envelope>,
    pub events: Vec<OverlayEvent>,
}

impl Outbox {
    pub(crate) fn send(&mut self, envelope: Envelope) {
        self.messages.push(envelope);
    }

    pub(crate) fn emit(&mut self, event: OverlayEvent) {
        self.events.push(event);
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.events.is_empty()
    }

    pub fn append(&mut self, mut other: Outbox) {
        self.messages.append(&mut other.messages);
        self.events.append(&mut other.events);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detached,
    Joining { contact: SocketAddr },
    Active,
    Disconnected,
}

pub struct OverlayNode {
    config: OverlayConfig,
    me: NodeId,
    phase: Phase,
    membership: Option<Membership>,
    forwarding: Forwarding,
    probes: ProbeTracker,
}

impl OverlayNode {
    pub fn new(me: NodeId, config: OverlayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            forwarding: Forwarding::new(me, config.ack_timeout, config.delivery_window),
            probes: ProbeTracker::new(config.probe_failure_threshold),
            config,
            me,
            phase: Phase::Detached,
            membership: None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn me(&self) -> NodeId {
        self.me
    }

    #[inline]
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<&TopologySnapshot> {
        self.membership.as_ref().map(Membership::snapshot)
    }

    /// Placed in a tree and still connected.
    #[inline]
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.phase == Phase::Active
    }

    #[inline]
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.phase == Phase::Disconnected
    }

    #[must_use]
    pub fn stats(&self) -> ForwardingStats {
        self.forwarding.stats()
    }

    #[must_use]
    pub fn pending(&self) -> PendingCounts {
        self.forwarding.pending()
    }

    /// Become the only member of a new root cluster.
    pub fn initialize(&mut self) -> Result<Outbox> {
        self.ensure_detached()?;
        let mut out = Outbox::default();
        self.membership = Some(Membership::bootstrap(
            self.me,
            self.config.reliability,
            self.config.fanout,
            &mut out,
        ));
        self.phase = Phase::Active;
        Ok(out)
    }

    /// Ask the node listening at `contact` to place this one.
    pub fn join(&mut self, contact: SocketAddr) -> Result<Outbox> {
        self.ensure_detached()?;
        let mut out = Outbox::default();
        out.send(Envelope::direct(
            self.me,
            NodeId::contact(contact),
            Message::JoinRequest { joiner: self.me },
        ));
        self.phase = Phase::Joining { contact };
        info!(target: "canopy::membership", node = %self.me, contact = %contact, "Joining overlay");
        Ok(out)
    }

    /// Abandon an outstanding join. A late acknowledgment is then ignored.
    pub fn cancel_join(&mut self) {
        if let Phase::Joining { contact } = self.phase {
            debug!(target: "canopy::membership", contact = %contact, "Join cancelled");
            self.phase = Phase::Detached;
        }
    }

    fn ensure_detached(&self) -> Result<()> {
        match self.phase {
            Phase::Detached => Ok(()),
            Phase::Disconnected => Err(OverlayError::Disconnected),
            Phase::Joining { .. } | Phase::Active => Err(OverlayError::AlreadyJoined),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.phase {
            Phase::Active => Ok(()),
            Phase::Disconnected => Err(OverlayError::Disconnected),
            Phase::Detached | Phase::Joining { .. } => Err(OverlayError::NotJoined),
        }
    }

    pub fn broadcast(&mut self, payload: Bytes, now: Instant) -> Result<(MessageId, Outbox)> {
        self.originate(DeliveryKind::Broadcast, payload, now)
    }

    pub fn send_to_root(&mut self, payload: Bytes, now: Instant) -> Result<(MessageId, Outbox)> {
        self.originate(DeliveryKind::ToRoot, payload, now)
    }

    fn originate(
        &mut self,
        kind: DeliveryKind,
        payload: Bytes,
        now: Instant,
    ) -> Result<(MessageId, Outbox)> {
        self.ensure_active()?;
        let membership = self.membership.as_ref().ok_or(OverlayError::NotJoined)?;
        let mut out = Outbox::default();
        let id = self
            .forwarding
            .originate(kind, payload, membership.snapshot(), now, &mut out);
        Ok((id, out))
    }

    /// Process one decoded inbound envelope.
    pub fn handle_envelope(&mut self, envelope: Envelope, now: Instant) -> Outbox {
        let mut out = Outbox::default();

        if envelope.to.addr() != self.me.addr() || (envelope.to != self.me && !envelope.to.is_contact()) {
            trace!(
                target: "canopy::actor",
                to = %envelope.to,
                "Dropping envelope addressed to another identity"
            );
            return out;
        }

        match self.phase {
            Phase::Detached | Phase::Disconnected => {},
            Phase::Joining { .. } => self.handle_joining(envelope, &mut out),
            Phase::Active => self.handle_active(envelope, now, &mut out),
        }
        out
    }

    fn handle_joining(&mut self, envelope: Envelope, out: &mut Outbox) {
        let Message::JoinAck { placement } = envelope.body else {
            trace!(
                target: "canopy::membership",
                kind = envelope.body.name(),
                "Ignoring message while joining"
            );
            return;
        };
        if !placement.own.table.contains(&self.me) {
            warn!(
                target: "canopy::membership",
                from = %envelope.from,
                "Join acknowledgment does not place this node"
            );
            return;
        }
        self.membership = Some(Membership::joined(self.me, placement, out));
        self.phase = Phase::Active;
    }

    fn handle_active(&mut self, envelope: Envelope, now: Instant, out: &mut Outbox) {
        let Some(membership) = self.membership.as_mut() else {
            return;
        };

        let misrouted = envelope
            .route
            .as_ref()
            .is_some_and(|r| r.to != membership.snapshot().own().id);
        let wrong_role = envelope.body.is_leader_only() && !membership.snapshot().is_leader();
        if (misrouted || wrong_role) && !matches!(envelope.body, Message::RoutingError { .. }) {
            debug!(
                target: "canopy::forwarding",
                from = %envelope.from,
                kind = envelope.body.name(),
                misrouted,
                wrong_role,
                "Bouncing envelope"
            );
            out.send(envelope.bounce(self.me));
            return;
        }

        let from = envelope.from;
        let route = envelope.route;
        let mut signals = Vec::new();

        match envelope.body {
            Message::JoinRequest { joiner } => membership.on_join_request(joiner, out, &mut signals),
            Message::JoinAck { .. } => {
                trace!(target: "canopy::membership", from = %from, "Ignoring late join acknowledgment");
            },
            Message::Relocate { placement } => membership.on_relocate(from, placement, out, &mut signals),
            Message::TableUpdate {
                view,
                cause,
                affected,
            } => membership.on_table_update(view, cause, affected, out, &mut signals),
            Message::LeaderNotice { failed } => membership.on_leader_notice(failed, out, &mut signals),
            Message::Stage1(fwd) => {
                self.forwarding
                    .on_stage1(from, fwd, membership.snapshot(), now, out);
            },
            Message::Stage2(fwd) => {
                if let Some(route) = route {
                    self.forwarding
                        .on_stage2(from, route.from, fwd, membership.snapshot(), now, out);
                }
            },
            Message::Stage3(fwd) => self.forwarding.on_stage3(from, fwd, membership.snapshot(), out),
            Message::Stage1Ack(id) => self.forwarding.on_stage1_ack(id),
            Message::Stage2Ack(id) => {
                if let Some(route) = route {
                    self.forwarding
                        .on_stage2_ack(from, &route.from, id, membership.snapshot(), out);
                }
            },
            Message::Stage3Ack(id) => {
                self.forwarding
                    .on_stage3_ack(from, id, membership.snapshot(), out);
            },
            Message::Stage3Release(id) => self.forwarding.on_stage3_release(id),
            Message::RoutingError { original } => {
                cnp_metrics::increment_routing_bounces();
                match original.body {
                    Message::JoinRequest { joiner } => {
                        membership.on_join_request(joiner, out, &mut signals);
                    },
                    ref body @ (Message::Stage1(_) | Message::Stage2(_) | Message::Stage3(_)) => {
                        debug!(
                            target: "canopy::forwarding",
                            from = %from,
                            kind = body.name(),
                            "Stage message bounced, retrying"
                        );
                        self.forwarding.on_bounce(body, now);
                    },
                    ref body => {
                        trace!(target: "canopy::forwarding", kind = body.name(), "Dropping bounced message");
                    },
                }
            },
            Message::Ping => out.send(Envelope::direct(self.me, from, Message::Pong)),
            Message::Pong => self.probes.record_pong(&from),
            Message::Fault { reason } => {
                warn!(target: "canopy::membership", from = %from, reason = %reason, "Peer reported a fault");
                membership.on_unreachable(from, out, &mut signals);
                self.probes.forget(&from);
            },
        }

        self.apply_signals(signals, now, out);
    }

    fn apply_signals(&mut self, signals: Vec<Signal>, now: Instant, out: &mut Outbox) {
        for signal in signals {
            if signal == Signal::Disconnect {
                self.disconnect(out);
                return;
            }
            let Some(membership) = self.membership.as_ref() else {
                return;
            };
            match &signal {
                Signal::SiblingGone(node) => self.probes.forget(node),
                Signal::SiblingsMoved(_, moved) => {
                    for node in moved {
                        self.probes.forget(node);
                    }
                },
                _ => {},
            }
            self.forwarding
                .on_signal(signal, membership.snapshot(), now, out);
        }
    }

    /// `node` is presumed dead, either by the transport or a peer's notice.
    pub fn handle_unreachable(&mut self, node: NodeId, now: Instant) -> Outbox {
        let mut out = Outbox::default();
        self.unreachable(node, now, &mut out);
        out
    }

    fn unreachable(&mut self, node: NodeId, now: Instant, out: &mut Outbox) {
        if self.phase != Phase::Active {
            return;
        }
        let Some(membership) = self.membership.as_mut() else {
            return;
        };
        let mut signals = Vec::new();
        membership.on_unreachable(node, out, &mut signals);
        self.probes.forget(&node);
        self.apply_signals(signals, now, out);
    }

    /// A frame from the network could not be understood. Every known peer is
    /// told this node is faulty, and the node leaves the overlay.
    pub fn handle_malformed(&mut self, reason: &str) -> Outbox {
        let mut out = Outbox::default();
        if self.phase != Phase::Active {
            warn!(target: "canopy::actor", reason, "Ignoring malformed frame while not attached");
            return out;
        }
        cnp_metrics::increment_faults();
        warn!(target: "canopy::actor", reason, "Malformed frame received, leaving overlay");
        if let Some(membership) = self.membership.as_ref() {
            for node in membership.snapshot().known_nodes() {
                out.send(Envelope::direct(
                    self.me,
                    node,
                    Message::Fault {
                        reason: reason.to_string(),
                    },
                ));
            }
        }
        self.disconnect(&mut out);
        out
    }

    pub fn on_retry_tick(&mut self, now: Instant) -> Outbox {
        let mut out = Outbox::default();
        if self.phase != Phase::Active {
            return out;
        }
        if let Some(membership) = self.membership.as_ref() {
            self.forwarding.on_tick(membership.snapshot(), now, &mut out);
        }
        out
    }

    pub fn on_probe_tick(&mut self, now: Instant) -> Outbox {
        let mut out = Outbox::default();
        if self.phase != Phase::Active {
            return out;
        }
        let Some(membership) = self.membership.as_ref() else {
            return out;
        };

        let round = self.probes.round(&membership.snapshot().probe_targets());
        for node in &round.ping {
            out.send(Envelope::direct(self.me, *node, Message::Ping));
        }
        cnp_metrics::increment_probes_sent(round.ping.len() as u64);

        for node in round.expired {
            cnp_metrics::increment_probe_timeouts();
            info!(target: "canopy::probe", node = %node, "Peer missed too many probes");
            self.unreachable(node, now, &mut out);
        }
        out
    }

    fn disconnect(&mut self, out: &mut Outbox) {
        if self.phase == Phase::Disconnected {
            return;
        }
        self.phase = Phase::Disconnected;
        if let Some(membership) = self.membership.as_mut() {
            membership.mark_disconnected();
        }
        self.forwarding.clear();
        self.probes.clear();
        cnp_metrics::increment_disconnects();
        warn!(target: "canopy::membership", node = %self.me, "Disconnected from overlay");
        out.emit(OverlayEvent::Disconnected);
    }
}
