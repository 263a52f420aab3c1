//! SysEx register-link backend
//!
//! Reads and writes whole channel frames over an [`Adapter`]. A poll thread reads the
//! status frame every cycle; its change bitmap selects which channels are re-read, and
//! a dedicated bit triggers one bulk read of the fader positions.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use osclive_core::codec::{
    self, decode_channel, encode_control, is_ack, nibble_pair_decode, parse_response, sysex_frame,
};
use osclive_core::device::{STATUS_FADERS_MOVED, STATUS_LEVELS_START};
use osclive_core::{
    ChannelDescriptor, ChannelIndex, ChannelStateStore, ControlWriter, DeviceProfile, Level,
    ValueKind,
};

use crate::adapter::{Adapter, AdapterFactory};
use crate::link::{Link, LinkState};
use crate::traits::Backend;
use crate::{BackendError, Result};

/// Raw backend configuration
#[derive(Debug, Clone)]
pub struct RawBackendConfig {
    /// Pause between poll cycles
    pub poll_interval: Duration,
    /// Pause between connect attempts
    pub reconnect_delay: Duration,
    /// Give up the initial connect after this many failures, `None` retries forever
    pub max_connect_attempts: Option<usize>,
}

impl Default for RawBackendConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(5),
            max_connect_attempts: None,
        }
    }
}

struct RawInner {
    store: Arc<ChannelStateStore>,
    profile: Arc<DeviceProfile>,
    factory: Box<dyn AdapterFactory>,
    /// Transaction lock: held across every write-then-read exchange
    adapter: Mutex<Option<Box<dyn Adapter>>>,
    link: Link,
    config: RawBackendConfig,
}

/// Backend for the SysEx register link (FireWire or MIDI)
pub struct RawBackend {
    inner: Arc<RawInner>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RawBackend {
    pub fn new(
        store: Arc<ChannelStateStore>,
        profile: Arc<DeviceProfile>,
        factory: Box<dyn AdapterFactory>,
        config: RawBackendConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RawInner {
                store,
                profile,
                factory,
                adapter: Mutex::new(None),
                link: Link::new(),
                config,
            }),
            poll_thread: Mutex::new(None),
        }
    }

    /// Open the adapter and run the cold-start sync on the calling thread
    ///
    /// [`Backend::start`] does this before spawning the poll thread.
    pub fn connect(&self) -> Result<()> {
        self.inner.link.reset();
        self.inner.connect(self.inner.config.max_connect_attempts)
    }

    /// Run one poll cycle on the calling thread
    pub fn poll_once(&self) -> Result<()> {
        self.inner.poll_once()
    }

    /// Re-read every channel
    pub fn init_data(&self) -> Result<()> {
        self.inner.init_data()
    }

    /// Route either the main mix or analog inputs 15/16 to FireWire streams 15/16
    pub fn route_source_1516(&self, main_mix: bool) -> Result<()> {
        let cmd: [u8; 7] = if main_mix {
            [0x52, 0x13, 0x0e, 0x02, 0x00, 0x00, 0x00]
        } else {
            [0x52, 0x13, 0x0e, 0x00, 0x0e, 0x00, 0x00]
        };
        // no acknowledgement for routing commands
        self.inner.transceive(&sysex_frame(&cmd, &[]), 0)?;
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }
}

impl RawInner {
    fn transceive(&self, frame: &[u8], read_len: usize) -> Result<Vec<u8>> {
        let mut adapter = self.adapter.lock();
        exchange(&mut adapter, frame, read_len)
    }

    fn read_channel(&self, desc: &ChannelDescriptor) -> Result<Vec<u8>> {
        let frame_len = desc.frame_len();
        let response = self.transceive(&sysex_frame(&desc.read_id, &[]), frame_len)?;
        Ok(parse_response(&response, &desc.resp_id, frame_len)?.to_vec())
    }

    /// Decode a fresh payload into the store and keep it as the new shadow
    fn apply_channel(&self, name: &str, desc: &ChannelDescriptor, payload: Vec<u8>) -> Result<()> {
        let mut changed = false;
        for (control, value) in decode_channel(desc, &payload) {
            changed |= self.store.update_control(name, control, value)?;
        }

        let old = self.store.replace_raw(name, payload)?;
        if !changed && tracing::enabled!(tracing::Level::DEBUG) && !old.is_empty() {
            let new = self.store.raw(name)?;
            for i in codec::unexplained_changes(desc, &old, &new) {
                debug!(
                    "Channel {} change: byte {}, old = {:02x}, new = {:02x}",
                    name, i, old[i], new[i]
                );
            }
        }
        Ok(())
    }

    fn init_data(&self) -> Result<()> {
        for (name, desc) in self.profile.channels() {
            let payload = self.read_channel(desc)?;
            self.apply_channel(name, desc, payload)?;
        }
        Ok(())
    }

    fn poll_once(&self) -> Result<()> {
        let status_desc = self
            .profile
            .status
            .as_ref()
            .ok_or_else(|| BackendError::Config("profile has no status frame".to_string()))?;
        let status = self.read_channel(status_desc)?;
        let offset = status_desc.offset;
        let status_byte = |byte: usize| {
            byte.checked_sub(offset)
                .and_then(|i| status.get(i))
                .copied()
                .unwrap_or(0)
        };

        self.update_levels(&status, offset)?;

        if status_byte(STATUS_FADERS_MOVED) != 0 {
            self.update_faders()?;
        }

        for (name, desc) in self.profile.channels() {
            let (Some(group), ChannelIndex::Number(index)) = (desc.kind.status_group(), &desc.index)
            else {
                continue;
            };
            let Some(byte) = group.checked_sub(*index as usize / 4) else {
                continue;
            };
            if status_byte(byte) & (1 << (index % 4)) != 0 {
                debug!("Channel {} changed on the device", name);
                let payload = self.read_channel(desc)?;
                self.apply_channel(name, desc, payload)?;
            }
        }
        Ok(())
    }

    /// Meter bytes follow each other in channel order, two per stereo channel
    fn update_levels(&self, status: &[u8], offset: usize) -> Result<()> {
        let mut i = STATUS_LEVELS_START - offset;
        for (name, desc) in self.profile.channels() {
            let level = match desc.kind.level_count() {
                1 => status.get(i).map(|l| Level::Mono(*l)),
                2 => match (status.get(i), status.get(i + 1)) {
                    (Some(l), Some(r)) => Some(Level::Stereo(*l, *r)),
                    _ => None,
                },
                _ => continue,
            };
            i += desc.kind.level_count();
            if let Some(level) = level {
                self.store.set_level(name, level)?;
            }
        }
        self.store.notify_levels();
        Ok(())
    }

    fn update_faders(&self) -> Result<()> {
        let faders_desc = self
            .profile
            .faders
            .as_ref()
            .ok_or_else(|| BackendError::Config("profile has no faders frame".to_string()))?;
        let faders = self.read_channel(faders_desc)?;

        for (name, desc) in self.profile.channels() {
            let ChannelIndex::Number(index) = &desc.index else {
                continue;
            };
            if !desc.kind.is_input() || desc.control("gain").is_none() {
                continue;
            }
            let b = *index as usize * 2;
            if let Some(pair) = faders.get(b..b + 2) {
                let value = nibble_pair_decode([pair[0], pair[1]], ValueKind::Gain);
                self.store.update_control(name, "gain", value)?;
            }
        }
        Ok(())
    }

    /// Encode into the shadow payload and send the whole frame
    fn write_control(&self, channel: &str, control: &str, value: f64) -> Result<()> {
        let desc = self.store.descriptor(channel)?;
        if !desc.is_writable() {
            return Err(osclive_core::Error::ReadOnly(channel.to_string()).into());
        }
        let ctrl = *desc
            .control(control)
            .ok_or_else(|| osclive_core::Error::UnknownControl {
                channel: channel.to_string(),
                control: control.to_string(),
            })?;

        // edit and send under the transaction lock so frames leave in edit order
        let mut adapter = self.adapter.lock();
        let payload = self.store.edit_raw(channel, |d, raw| {
            if raw.len() != d.length {
                return None;
            }
            encode_control(&ctrl, raw, d.offset, value);
            Some(raw.clone())
        })?;
        let payload = payload.ok_or_else(|| BackendError::NotSynced(channel.to_string()))?;

        let response = exchange(&mut adapter, &sysex_frame(&desc.write_id, &payload), 3)?;
        if !is_ack(&response) {
            return Err(BackendError::Nack {
                channel: channel.to_string(),
                got: response,
            });
        }
        Ok(())
    }

    fn drop_adapter(&self) {
        *self.adapter.lock() = None;
    }

    fn connect(&self, max_attempts: Option<usize>) -> Result<()> {
        self.link
            .connect_with_retry(self.config.reconnect_delay, max_attempts, || {
                self.drop_adapter();
                let adapter = self.factory.open()?;
                *self.adapter.lock() = Some(adapter);

                self.link.set_state(LinkState::Syncing);
                if let Err(e) = self.init_data() {
                    self.drop_adapter();
                    return Err(e);
                }
                self.link.set_state(LinkState::Polling);
                Ok(())
            })?;
        info!("StudioLive connected via {}", self.factory.describe());
        Ok(())
    }

    fn run(self: Arc<Self>) {
        while !self.link.is_stopped() {
            match self.poll_once() {
                Ok(()) => {
                    if self.link.sleep(self.config.poll_interval) {
                        break;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Poll failed: {}, reconnecting", e);
                    self.drop_adapter();
                    self.link.set_state(LinkState::Reconnecting);
                    if let Err(e) = self.connect(None) {
                        if !matches!(e, BackendError::Stopped) {
                            error!("Reconnect failed: {}", e);
                        }
                        break;
                    }
                }
                Err(e) => {
                    error!("Poll loop stopped: {}", e);
                    break;
                }
            }
        }
        self.drop_adapter();
        if self.link.is_stopped() {
            self.link.set_state(LinkState::Stopped);
        } else {
            self.link.set_state(LinkState::Disconnected);
        }
        debug!("Poll thread exiting");
    }
}

/// One write-then-read transaction on an already locked adapter slot
fn exchange(adapter: &mut Option<Box<dyn Adapter>>, frame: &[u8], read_len: usize) -> Result<Vec<u8>> {
    let adapter = adapter.as_mut().ok_or_else(|| {
        BackendError::ConnectionLost("no adapter, mixer unexpectedly disconnected?".to_string())
    })?;
    adapter.write(frame)?;
    if read_len == 0 {
        return Ok(Vec::new());
    }
    adapter.read(read_len)
}

impl ControlWriter for RawBackend {
    fn write_control(&self, channel: &str, control: &str, value: f64) {
        if let Err(e) = self.inner.write_control(channel, control, value) {
            warn!(
                "Device not responding, write of {}/{} unsuccessful: {}",
                channel, control, e
            );
        }
    }
}

impl Backend for RawBackend {
    fn name(&self) -> String {
        format!("{} ({})", self.inner.profile.name, self.inner.factory.describe())
    }

    fn start(&self) -> Result<()> {
        let mut poll_thread = self.poll_thread.lock();
        if poll_thread.is_some() {
            return Err(BackendError::AlreadyRunning);
        }
        self.inner.link.reset();
        self.inner.connect(self.inner.config.max_connect_attempts)?;

        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("osclive-poll".to_string())
            .spawn(move || inner.run())?;
        *poll_thread = Some(handle);
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.link.stop();
        if let Some(handle) = self.poll_thread.lock().take() {
            if handle.join().is_err() {
                error!("Poll thread panicked");
            }
        }
        self.inner.drop_adapter();
        self.inner.link.set_state(LinkState::Stopped);
        info!("StudioLive backend stopped");
    }

    fn state(&self) -> LinkState {
        self.inner.link.state()
    }
}

impl Drop for RawBackend {
    fn drop(&mut self) {
        self.inner.link.stop();
    }
}
