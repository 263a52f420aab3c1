//! Backend trait definitions

use osclive_core::ControlWriter;

use crate::{LinkState, Result};

/// A device backend
///
/// Backends mirror the mixer into a [`osclive_core::ChannelStateStore`] and receive
/// client-originated changes through [`ControlWriter`].
pub trait Backend: ControlWriter {
    /// Short description for log lines
    fn name(&self) -> String;

    /// Connect, run the cold-start sync and start the background thread
    ///
    /// Blocks until the first connection succeeds or the configured attempt limit is hit.
    fn start(&self) -> Result<()>;

    /// Stop the background thread and release the device
    fn shutdown(&self);

    fn state(&self) -> LinkState;
}
