use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanopyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Frame too large: {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, CanopyError>;
