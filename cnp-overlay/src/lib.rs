#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod actor;
mod codec;
mod config;
mod error;
mod events;
mod forwarding;
mod membership;
mod message;
mod node;
mod probe;
mod snapshot;
mod table;

pub use actor::{NodeActor, OverlayHandle};
pub use codec::{MessageType, OverlayCodec};
pub use config::OverlayConfig;
pub use error::{OverlayError, Result};
pub use events::{Action, Cause, Delivery, OverlayEvent, Target, TopologyChange};
pub use forwarding::{ForwardingStats, PendingCounts};
pub use message::{DeliveryKind, Envelope, Forward, Message, MessageId, Route};
pub use node::{Outbox, OverlayNode, Phase};
pub use probe::{ProbeRound, ProbeTracker};
pub use snapshot::{ClusterView, Direction, Placement, TopologySnapshot};
pub use table::ClusterTable;
