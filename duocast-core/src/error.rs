use thiserror::Error;

/// Core error taxonomy.
///
/// Session errors carry the exact reason strings clients key on, so the
/// `Display` output doubles as the wire-level failure reason.
#[derive(Error, Debug)]
pub enum Error {
    #[error("No active session")]
    NoActiveSession,

    #[error("Session ended")]
    SessionEnded,

    #[error("Invalid access code")]
    InvalidAccessCode,

    #[error("Host full")]
    HostFull,

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
