#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod checksum;
mod cluster_id;
mod error;
mod identity;

pub use checksum::crc32;
pub use cluster_id::ClusterId;
pub use error::{CanopyError, Result};
pub use identity::NodeId;

/// Wire protocol version carried in every overlay envelope.
pub const PROTOCOL_VERSION: u8 = 1;
/// Transport frame header: length(4) + crc(4).
pub const FRAME_HEADER_SIZE: usize = 8;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MiB
