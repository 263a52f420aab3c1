//! OSCLive Discovery
//!
//! Announces the relay as an `_osc._tcp` service so control surfaces can find it
//! without typing an address.

pub mod error;

#[cfg(feature = "mdns")]
pub mod mdns;

pub use error::{DiscoveryError, Result};

#[cfg(feature = "mdns")]
pub use mdns::ServiceAdvertiser;

pub use osclive_core::MDNS_SERVICE_TYPE;

/// Instance name announced when none is configured
pub const DEFAULT_SERVICE_NAME: &str = "OSCLive";
