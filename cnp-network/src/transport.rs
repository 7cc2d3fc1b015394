use bytes::Bytes;
use cnp_core::NodeId;

/// Fire-and-forget point-to-point delivery.
///
/// Implementations connect lazily, reuse per-destination connections and
/// report delivery failures asynchronously as [`TransportEvent::Unreachable`]
/// on the owner's event channel.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: &NodeId, payload: Bytes);

    /// Drop any connection state held for `peer`.
    fn forget(&self, _peer: &NodeId) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete inbound payload.
    Frame(Bytes),
    /// A send to this peer failed.
    Unreachable(NodeId),
}
