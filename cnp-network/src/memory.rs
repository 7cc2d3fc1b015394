//! In-process transport keyed by listening address.
//!
//! Every registered endpoint owns an inbound event queue in a shared
//! registry. Sending to an address that is not registered, or whose queue
//! has been dropped, reports the destination as unreachable to the sender.

use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use cnp_core::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

type Registry = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<TransportEvent>>>>;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Registry,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint. Re-registering an address replaces its queue.
    pub fn register(
        &self,
        addr: SocketAddr,
        capacity: usize,
    ) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, tx.clone());

        let transport = MemoryTransport {
            network: self.clone(),
            local: addr,
            events: tx,
        };
        (transport, rx)
    }

    /// Detach an endpoint, making it unreachable to everyone else.
    pub fn unregister(&self, addr: &SocketAddr) -> bool {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr)
            .is_some()
    }

    #[must_use]
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(addr)
    }

    fn lookup(&self, addr: &SocketAddr) -> Option<mpsc::Sender<TransportEvent>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .cloned()
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local: SocketAddr,
    events: mpsc::Sender<TransportEvent>,
}

impl MemoryTransport {
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: &NodeId, payload: Bytes) {
        let delivered = match self.network.lookup(&to.addr()) {
            Some(tx) => match tx.try_send(TransportEvent::Frame(payload)) {
                Ok(()) => true,
                // Queue pressure is loss, not death.
                Err(TrySendError::Full(_)) => {
                    cnp_metrics::increment_send_failures();
                    return;
                },
                Err(TrySendError::Closed(_)) => false,
            },
            None => false,
        };

        if delivered {
            cnp_metrics::increment_frames_sent();
        } else {
            cnp_metrics::increment_send_failures();
            trace!(
                target: "canopy::transport",
                from = %self.local,
                peer = %to,
                "In-memory destination unreachable"
            );
            let _ = self.events.try_send(TransportEvent::Unreachable(*to));
        }
    }
}
