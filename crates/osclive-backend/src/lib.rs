//! OSCLive device backends
//!
//! Keeps a [`osclive_core::ChannelStateStore`] in sync with a StudioLive mixer:
//! - SysEx register link ([`RawBackend`]) over a FireWire register bus or MIDI
//! - Universal Control network protocol ([`NetworkBackend`])

pub mod adapter;
pub mod error;
mod link;
pub mod network;
pub mod raw;
pub mod register;
pub mod traits;

#[cfg(feature = "midi")]
pub mod midi;

#[cfg(feature = "firewire")]
pub mod firewire;

use std::sync::{Arc, Weak};

use osclive_core::ChannelStateStore;

pub use adapter::{Adapter, AdapterFactory};
pub use error::{BackendError, Result};
pub use link::LinkState;
pub use network::{NetworkBackend, NetworkBackendConfig};
pub use raw::{RawBackend, RawBackendConfig};
pub use register::{RegisterAdapter, RegisterAdapterFactory, RegisterBus, RegisterTiming};
pub use traits::Backend;

#[cfg(feature = "midi")]
pub use midi::{MidiAdapter, MidiAdapterConfig, MidiAdapterFactory};

#[cfg(feature = "firewire")]
pub use firewire::{firewire_factory, FirewireBus, FirewireConfig};

/// Route client-originated store changes to `backend`
///
/// The store only keeps a weak reference; dropping the backend detaches it.
pub fn attach<B: Backend + 'static>(store: &ChannelStateStore, backend: &Arc<B>) {
    let writer: Weak<B> = Arc::downgrade(backend);
    store.attach_writer(writer);
}
