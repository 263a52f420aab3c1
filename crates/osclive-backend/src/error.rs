//! Backend error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("stale data still pending after {0} probes")]
    DrainExhausted(usize),

    #[error("transfer error: no data marker {0} times")]
    TransferError(usize),

    #[error("write to {channel} not acknowledged, got {got:02x?}")]
    Nack { channel: String, got: Vec<u8> },

    #[error("channel {0} not synchronized yet")]
    NotSynced(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] osclive_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend already running")]
    AlreadyRunning,

    #[error("backend stopped")]
    Stopped,
}

impl BackendError {
    /// Recoverable errors drop the link and go through the reconnect loop, the others
    /// propagate to the caller
    pub fn is_recoverable(&self) -> bool {
        match self {
            BackendError::ConnectionLost(_)
            | BackendError::PortNotFound(_)
            | BackendError::DrainExhausted(_)
            | BackendError::TransferError(_)
            | BackendError::Nack { .. }
            | BackendError::NotSynced(_)
            | BackendError::Protocol(_)
            | BackendError::Io(_) => true,
            BackendError::Core(e) => e.is_framing(),
            BackendError::Config(_) | BackendError::AlreadyRunning | BackendError::Stopped => false,
        }
    }
}
