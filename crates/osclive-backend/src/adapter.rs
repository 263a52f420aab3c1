//! Transport adapter traits

use crate::Result;

/// Byte pipe to the mixer
///
/// One `write` followed by at most one `read` forms a transaction; the backend never
/// interleaves two transactions on the same adapter.
pub trait Adapter: Send {
    /// Send one SysEx frame
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read one response of (at least) `len` bytes
    fn read(&mut self, len: usize) -> Result<Vec<u8>>;
}

/// Opens a fresh adapter on every connect attempt
///
/// Opening includes draining stale data a previous session left behind.
pub trait AdapterFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn Adapter>>;

    /// Short description for log lines
    fn describe(&self) -> String;
}
