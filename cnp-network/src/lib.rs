#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod connection;
mod frame;
mod memory;
mod tcp;
mod transport;

pub use connection::ConnectionBuffer;
pub use frame::{encode_frame, parse_frame};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, TransportConfig};
pub use transport::{Transport, TransportEvent};
