//! Relay error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("OSC error: {0}")]
    Osc(String),

    #[error("store error: {0}")]
    Store(#[from] osclive_core::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rosc::OscError> for RelayError {
    fn from(e: rosc::OscError) -> Self {
        RelayError::Osc(format!("{:?}", e))
    }
}
