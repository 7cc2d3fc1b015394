//! Overlay protocol messages.

use crate::events::Cause;
use crate::snapshot::{ClusterView, Placement};
use bytes::Bytes;
use cnp_core::{ClusterId, NodeId};
use std::fmt;

/// Identity of one reliably forwarded message, unique per originating node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub origin: NodeId,
    pub seq: u64,
}

impl MessageId {
    #[inline]
    #[must_use]
    pub const fn new(origin: NodeId, seq: u64) -> Self {
        Self { origin, seq }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryKind {
    /// Every connected participant.
    Broadcast = 0,
    /// The root cluster's leader only.
    ToRoot = 1,
}

impl DeliveryKind {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Broadcast),
            1 => Some(Self::ToRoot),
            _ => None,
        }
    }
}

/// Sender and intended recipient cluster of a tree-protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub from: ClusterId,
    pub to: ClusterId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub id: MessageId,
    pub kind: DeliveryKind,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    JoinRequest { joiner: NodeId },
    JoinAck { placement: Placement },
    Relocate { placement: Placement },
    TableUpdate {
        view: ClusterView,
        cause: Cause,
        affected: Option<NodeId>,
    },
    /// The named node, which led the recipient's cluster, is gone.
    LeaderNotice { failed: NodeId },
    Stage1(Forward),
    Stage2(Forward),
    Stage3(Forward),
    Stage1Ack(MessageId),
    Stage2Ack(MessageId),
    Stage3Ack(MessageId),
    Stage3Release(MessageId),
    RoutingError { original: Box<Envelope> },
    Ping,
    Pong,
    Fault { reason: String },
}

impl Message {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinRequest { .. } => "join_request",
            Self::JoinAck { .. } => "join_ack",
            Self::Relocate { .. } => "relocate",
            Self::TableUpdate { .. } => "table_update",
            Self::LeaderNotice { .. } => "leader_notice",
            Self::Stage1(_) => "stage1",
            Self::Stage2(_) => "stage2",
            Self::Stage3(_) => "stage3",
            Self::Stage1Ack(_) => "stage1_ack",
            Self::Stage2Ack(_) => "stage2_ack",
            Self::Stage3Ack(_) => "stage3_ack",
            Self::Stage3Release(_) => "stage3_release",
            Self::RoutingError { .. } => "routing_error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Fault { .. } => "fault",
        }
    }

    /// Only a cluster's main member may process these.
    #[inline]
    #[must_use]
    pub const fn is_leader_only(&self) -> bool {
        matches!(self, Self::Stage1(_) | Self::Stage2(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub route: Option<Route>,
    pub body: Message,
}

impl Envelope {
    #[must_use]
    pub fn direct(from: NodeId, to: NodeId, body: Message) -> Self {
        Self {
            from,
            to,
            route: None,
            body,
        }
    }

    #[must_use]
    pub fn routed(from: NodeId, to: NodeId, route: Route, body: Message) -> Self {
        Self {
            from,
            to,
            route: Some(route),
            body,
        }
    }

    /// Bounce this envelope back to its sender.
    #[must_use]
    pub fn bounce(self, me: NodeId) -> Self {
        let to = self.from;
        Self::direct(
            me,
            to,
            Message::RoutingError {
                original: Box::new(self),
            },
        )
    }
}
