use cnp_core::CanopyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("No join acknowledgment before timeout")]
    JoinTimeout,

    #[error("Node has not joined an overlay")]
    NotJoined,

    #[error("Node is already part of an overlay")]
    AlreadyJoined,

    #[error("Node is disconnected from the overlay")]
    Disconnected,

    #[error("Overlay actor has stopped")]
    ActorStopped,

    #[error(transparent)]
    Core(#[from] CanopyError),
}

pub type Result<T> = std::result::Result<T, OverlayError>;
