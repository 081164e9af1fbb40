use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Join rejected because the room already holds two participants
    #[error("Room is full: {0}")]
    CapacityExceeded(String),

    /// Local camera/microphone access refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Creating or applying a negotiation payload failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Transport temporarily disconnected")]
    TransientDisconnect,

    #[error("Transport failed: {0}")]
    HardFailure(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that end a call session outright.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::HardFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
