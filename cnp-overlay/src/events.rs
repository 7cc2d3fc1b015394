use crate::message::{DeliveryKind, MessageId};
use crate::snapshot::{Direction, TopologySnapshot};
use bytes::Bytes;
use cnp_core::NodeId;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cause {
    Join = 0,
    Leave = 1,
    Move = 2,
    Init = 3,
}

impl Cause {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Join),
            1 => Some(Self::Leave),
            2 => Some(Self::Move),
            3 => Some(Self::Init),
            _ => None,
        }
    }
}

/// Which of the node's tables a change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Own,
    Parent,
    Child(u16),
}

impl From<Direction> for Target {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::Parent => Self::Parent,
            Direction::Child(slot) => Self::Child(slot),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Remove,
    None,
}

#[derive(Debug, Clone)]
pub struct TopologyChange {
    pub affected: Option<NodeId>,
    pub cause: Cause,
    pub target: Target,
    pub action: Action,
    /// Topology right after the change.
    pub snapshot: Arc<TopologySnapshot>,
}

impl fmt::Display for TopologyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.cause, self.target, self.action)?;
        if let Some(node) = &self.affected {
            write!(f, " {node}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    pub kind: DeliveryKind,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub enum OverlayEvent {
    Topology(TopologyChange),
    Delivered(Delivery),
    Disconnected,
}
