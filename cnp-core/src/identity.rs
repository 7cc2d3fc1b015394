//! Node identity.
//!
//! A participant is named by the endpoint it listens on plus the wall-clock
//! millisecond at which it created or joined the tree. The pair doubles as
//! the transport address and as the total-order comparison key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    addr: SocketAddr,
    joined_at_ms: u64,
}

impl NodeId {
    #[inline]
    #[must_use]
    pub const fn new(addr: SocketAddr, joined_at_ms: u64) -> Self {
        Self { addr, joined_at_ms }
    }

    /// Identity stamped with the current wall-clock time.
    #[must_use]
    pub fn now(addr: SocketAddr) -> Self {
        let joined_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self::new(addr, joined_at_ms)
    }

    /// Placeholder identity for a contact endpoint whose join timestamp is
    /// not yet known. Only usable as a transport destination.
    #[inline]
    #[must_use]
    pub const fn contact(addr: SocketAddr) -> Self {
        Self::new(addr, 0)
    }

    #[inline]
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    #[must_use]
    pub const fn joined_at_ms(&self) -> u64 {
        self.joined_at_ms
    }

    #[inline]
    #[must_use]
    pub const fn is_contact(&self) -> bool {
        self.joined_at_ms == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.addr, self.joined_at_ms)
    }
}
