//! FireWire register adapter
//!
//! The mixer exposes two word-aligned registers: SysEx commands are written to one,
//! responses are read from the other. Until a response is ready the read register
//! returns the no-data marker `0xFE` in its first byte.

use std::time::Duration;
use tracing::{debug, trace};

use osclive_core::codec::pad_to_word;

use crate::adapter::{Adapter, AdapterFactory};
use crate::{BackendError, Result};

/// Command register
pub const WRITE_ADDRESS: u64 = 0xFFFF_E0F0_0408;

/// Response register
pub const READ_ADDRESS: u64 = 0xFFFF_E0F0_091C;

/// First byte of the response register while no response is pending
pub const NO_DATA: u8 = 0xFE;

/// Block access to the device address space
pub trait RegisterBus: Send {
    fn read_block(&mut self, address: u64, len: usize) -> Result<Vec<u8>>;
    fn write_block(&mut self, address: u64, data: &[u8]) -> Result<()>;
}

/// Retry policy of the register link
#[derive(Debug, Clone)]
pub struct RegisterTiming {
    /// Delay between the first `short_retries` polls of the response register
    pub short_delay: Duration,
    pub short_retries: usize,
    /// Delay between later polls
    pub long_delay: Duration,
    /// Polls before giving up on a response
    pub max_retries: usize,
    /// More retries than this count as a transfer error
    pub fail_after: usize,
    /// Probe reads allowed while draining at open
    pub drain_probes: usize,
}

impl Default for RegisterTiming {
    fn default() -> Self {
        Self {
            short_delay: Duration::from_millis(2),
            short_retries: 8,
            long_delay: Duration::from_millis(100),
            max_retries: 20,
            fail_after: 15,
            drain_probes: 100,
        }
    }
}

/// [`Adapter`] over a [`RegisterBus`]
pub struct RegisterAdapter<B: RegisterBus> {
    bus: B,
    timing: RegisterTiming,
}

impl<B: RegisterBus> RegisterAdapter<B> {
    /// Wrap a bus and drain the response register
    pub fn open(bus: B, timing: RegisterTiming) -> Result<Self> {
        let mut adapter = Self { bus, timing };
        adapter.drain()?;
        Ok(adapter)
    }

    fn drain(&mut self) -> Result<()> {
        let mut probes = 0;
        while self.first_byte(4)? != NO_DATA {
            probes += 1;
            if probes >= self.timing.drain_probes {
                return Err(BackendError::DrainExhausted(probes));
            }
        }
        if probes > 0 {
            debug!("Drained {} stale responses", probes);
        }
        Ok(())
    }

    fn first_byte(&mut self, len: usize) -> Result<u8> {
        let data = self.bus.read_block(READ_ADDRESS, len)?;
        data.first()
            .copied()
            .ok_or_else(|| BackendError::ConnectionLost("empty register read".to_string()))
    }

    pub fn into_inner(self) -> B {
        self.bus
    }
}

impl<B: RegisterBus> Adapter for RegisterAdapter<B> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut frame = data.to_vec();
        pad_to_word(&mut frame);
        trace!("register write {:02x?}", frame);
        self.bus.write_block(WRITE_ADDRESS, &frame)
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let aligned = (len + 3) / 4 * 4;
        let mut data = self.bus.read_block(READ_ADDRESS, aligned)?;
        let mut retries = 0;
        while data.first() == Some(&NO_DATA) && retries < self.timing.max_retries {
            data = self.bus.read_block(READ_ADDRESS, aligned)?;
            retries += 1;
            let delay = if retries < self.timing.short_retries {
                self.timing.short_delay
            } else {
                self.timing.long_delay
            };
            std::thread::sleep(delay);
        }
        if retries > self.timing.fail_after {
            return Err(BackendError::TransferError(retries));
        }
        trace!("register read {:02x?}", data);
        Ok(data)
    }
}

/// Opens a [`RegisterAdapter`] over a freshly opened bus
pub struct RegisterAdapterFactory<F> {
    open_bus: F,
    timing: RegisterTiming,
}

impl<F> RegisterAdapterFactory<F> {
    pub fn new(open_bus: F) -> Self {
        Self {
            open_bus,
            timing: RegisterTiming::default(),
        }
    }

    pub fn with_timing(open_bus: F, timing: RegisterTiming) -> Self {
        Self { open_bus, timing }
    }
}

impl<F, B> AdapterFactory for RegisterAdapterFactory<F>
where
    F: Fn() -> Result<B> + Send + Sync,
    B: RegisterBus + 'static,
{
    fn open(&self) -> Result<Box<dyn Adapter>> {
        let bus = (self.open_bus)()?;
        Ok(Box::new(RegisterAdapter::open(bus, self.timing.clone())?))
    }

    fn describe(&self) -> String {
        "firewire register link".to_string()
    }
}
