//! OSCLive Core
//!
//! Wire-level primitives and shared state for the StudioLive OSC bridge.
//!
//! This crate provides:
//! - SysEx framing and the packed field codec ([`codec`])
//! - Channel and control descriptors ([`ChannelDescriptor`], [`ControlDescriptor`])
//! - The StudioLive 16.0.2 mixer profiles ([`device`])
//! - The channel state mirror with listener fan-out ([`ChannelStateStore`])

pub mod codec;
pub mod device;
pub mod error;
pub mod store;
pub mod types;

pub use device::DeviceProfile;
pub use error::{Error, Result};
pub use store::{CallbackId, ChannelStateStore, ControlWriter};
pub use types::*;

/// SysEx start byte
pub const SYSEX_START: u8 = 0xF0;

/// SysEx end byte
pub const SYSEX_END: u8 = 0xF7;

/// Response id the mixer uses to acknowledge a write
pub const WRITE_ACK: u8 = 0x10;

/// Default OSC relay TCP port
pub const DEFAULT_RELAY_PORT: u16 = 4301;

/// mDNS service type for the relay
pub const MDNS_SERVICE_TYPE: &str = "_osc._tcp.local.";
