//! OSCLive Relay
//!
//! OSC over TCP server that mirrors a StudioLive mixer to control surfaces.
//! Every client gets the full state on connect, control changes as they happen and
//! bundled meter updates; its writes go through the shared channel state store.
//!
//! This crate provides:
//! - Length-prefixed OSC stream framing ([`framing`])
//! - The address layout and dispatch table ([`Layout`])
//! - Per-client sessions with bundle scopes ([`ClientSession`])
//! - The accept loop and connection registry ([`RelayServer`])
//! - Record/playback control ([`transport`])

pub mod error;
pub mod framing;
pub mod layout;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{RelayError, Result};
pub use layout::{Layout, Route};
pub use server::{RelayConfig, RelayServer};
pub use session::{BundleGuard, ClientSession, SessionId};
pub use transport::{AudioTransport, NullTransport, TransportCommand, TransportControl};
