//! Error types for OSCLive core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Channel name not part of the mixer profile
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// Control name not defined for the channel
    #[error("unknown control {control} on channel {channel}")]
    UnknownControl { channel: String, control: String },

    /// Response frame does not start with the SysEx start byte
    #[error("bad start byte: expected 0xf0, got 0x{0:02x}")]
    BadStartByte(u8),

    /// Response id does not echo the expected id
    #[error("unexpected response: expected {expected:02x?}, got {got:02x?}")]
    UnexpectedResponse { expected: Vec<u8>, got: Vec<u8> },

    /// Response frame lacks the SysEx end byte where it should be
    #[error("missing terminator at byte {position}")]
    MissingTerminator { position: usize },

    /// Response frame shorter than the channel geometry requires
    #[error("short frame: need {needed} bytes, have {have}")]
    ShortFrame { needed: usize, have: usize },

    /// Channel kind has no write command
    #[error("channel {0} is read-only")]
    ReadOnly(String),
}

impl Error {
    /// Framing errors describe a malformed device response
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Error::BadStartByte(_)
                | Error::UnexpectedResponse { .. }
                | Error::MissingTerminator { .. }
                | Error::ShortFrame { .. }
        )
    }
}
