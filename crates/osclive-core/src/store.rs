//! Channel state mirror and listener fan-out
//!
//! The store holds the last known value of every control of every channel, the meter
//! levels and the raw shadow payloads. Every channel has its own lock; listener lists
//! are copy-on-write so a broadcast iterates a snapshot and never holds a lock while a
//! callback runs.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::device::DeviceProfile;
use crate::types::{ChannelDescriptor, Level};
use crate::{Error, Result};

/// Control update listener: `(channel, control, value)`
pub type UpdateCallback = Arc<dyn Fn(&str, &str, f64) + Send + Sync>;

/// Meter update listener
pub type LevelCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Write path into the device
///
/// Called after a client-originated change has been stored and broadcast.
pub trait ControlWriter: Send + Sync {
    fn write_control(&self, channel: &str, control: &str, value: f64);
}

/// Runtime state of one channel
#[derive(Debug)]
struct ChannelState {
    descriptor: Arc<ChannelDescriptor>,
    ctrls: HashMap<String, f64>,
    level: Level,
    raw: Vec<u8>,
}

impl ChannelState {
    fn check_control(&self, channel: &str, control: &str) -> Result<()> {
        if self.descriptor.control(control).is_some() {
            Ok(())
        } else {
            Err(Error::UnknownControl {
                channel: channel.to_string(),
                control: control.to_string(),
            })
        }
    }
}

/// Shared mirror of the mixer state
pub struct ChannelStateStore {
    names: Vec<String>,
    channels: HashMap<String, Mutex<ChannelState>>,
    update_callbacks: RwLock<Arc<Vec<(CallbackId, UpdateCallback)>>>,
    level_callbacks: RwLock<Arc<Vec<(CallbackId, LevelCallback)>>>,
    next_id: AtomicU64,
    writer: RwLock<Option<Weak<dyn ControlWriter>>>,
}

impl ChannelStateStore {
    /// Create the full channel set of a profile
    pub fn new(profile: &DeviceProfile) -> Self {
        let mut names = Vec::new();
        let mut channels = HashMap::new();
        for (name, descriptor) in profile.channels() {
            names.push(name.clone());
            channels.insert(
                name.clone(),
                Mutex::new(ChannelState {
                    descriptor: descriptor.clone(),
                    ctrls: HashMap::new(),
                    level: Level::default(),
                    raw: Vec::new(),
                }),
            );
        }

        Self {
            names,
            channels,
            update_callbacks: RwLock::new(Arc::new(Vec::new())),
            level_callbacks: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            writer: RwLock::new(None),
        }
    }

    fn channel(&self, channel: &str) -> Result<&Mutex<ChannelState>> {
        self.channels
            .get(channel)
            .ok_or_else(|| Error::UnknownChannel(channel.to_string()))
    }

    /// Channel names in profile order
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn descriptor(&self, channel: &str) -> Result<Arc<ChannelDescriptor>> {
        Ok(self.channel(channel)?.lock().descriptor.clone())
    }

    /// Current value, 0 when the control was never set
    pub fn get_control(&self, channel: &str, control: &str) -> Result<f64> {
        let state = self.channel(channel)?.lock();
        state.check_control(channel, control)?;
        Ok(state.ctrls.get(control).copied().unwrap_or(0.0))
    }

    /// Client-originated change
    ///
    /// The clamped value is stored and broadcast to every update listener before the
    /// attached writer sends it to the device.
    pub fn set_control(&self, channel: &str, control: &str, value: f64) -> Result<()> {
        let value = clamp_unit(value);
        {
            let mut state = self.channel(channel)?.lock();
            state.check_control(channel, control)?;
            state.ctrls.insert(control.to_string(), value);
        }
        debug!("set {}/{} = {:.3}", channel, control, value);

        self.broadcast(channel, control, value);

        let writer = self.writer.read().as_ref().and_then(Weak::upgrade);
        if let Some(writer) = writer {
            writer.write_control(channel, control, value);
        }
        Ok(())
    }

    /// Device-originated change
    ///
    /// Stores and broadcasts only when the value differs from the stored one. Never
    /// writes back. Returns whether the value changed.
    pub fn update_control(&self, channel: &str, control: &str, value: f64) -> Result<bool> {
        let value = clamp_unit(value);
        {
            let mut state = self.channel(channel)?.lock();
            state.check_control(channel, control)?;
            if state.ctrls.get(control) == Some(&value) {
                return Ok(false);
            }
            state.ctrls.insert(control.to_string(), value);
        }
        trace!("update {}/{} = {:.3}", channel, control, value);

        self.broadcast(channel, control, value);
        Ok(true)
    }

    fn broadcast(&self, channel: &str, control: &str, value: f64) {
        let callbacks = self.update_callbacks.read().clone();
        for (_, callback) in callbacks.iter() {
            callback(channel, control, value);
        }
    }

    /// Meter reading; a stereo pair is reduced to its first value unless requested
    pub fn get_level(&self, channel: &str, prefer_stereo: bool) -> Result<Level> {
        let level = self.channel(channel)?.lock().level;
        Ok(match level {
            Level::Stereo(l, _) if !prefer_stereo => Level::Mono(l),
            other => other,
        })
    }

    pub fn set_level(&self, channel: &str, level: Level) -> Result<()> {
        self.channel(channel)?.lock().level = level;
        Ok(())
    }

    /// Invoke every level listener
    pub fn notify_levels(&self) {
        let callbacks = self.level_callbacks.read().clone();
        for (_, callback) in callbacks.iter() {
            callback();
        }
    }

    /// Copy of the shadow payload, empty before the first read
    pub fn raw(&self, channel: &str) -> Result<Vec<u8>> {
        Ok(self.channel(channel)?.lock().raw.clone())
    }

    /// Replace the shadow payload, returning the previous one
    pub fn replace_raw(&self, channel: &str, raw: Vec<u8>) -> Result<Vec<u8>> {
        let mut state = self.channel(channel)?.lock();
        Ok(std::mem::replace(&mut state.raw, raw))
    }

    /// Edit the shadow payload in place under the channel lock
    pub fn edit_raw<R, F>(&self, channel: &str, edit: F) -> Result<R>
    where
        F: FnOnce(&ChannelDescriptor, &mut Vec<u8>) -> R,
    {
        let mut state = self.channel(channel)?.lock();
        let state = &mut *state;
        Ok(edit(&state.descriptor, &mut state.raw))
    }

    pub fn add_update_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&str, &str, f64) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let callback: UpdateCallback = Arc::new(callback);
        let mut list = self.update_callbacks.write();
        let mut next = (**list).clone();
        next.push((id, callback));
        *list = Arc::new(next);
        id
    }

    pub fn remove_update_callback(&self, id: CallbackId) -> bool {
        let mut list = self.update_callbacks.write();
        let before = list.len();
        let next: Vec<_> = list.iter().filter(|(i, _)| *i != id).cloned().collect();
        let removed = next.len() != before;
        *list = Arc::new(next);
        removed
    }

    pub fn add_level_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id();
        let callback: LevelCallback = Arc::new(callback);
        let mut list = self.level_callbacks.write();
        let mut next = (**list).clone();
        next.push((id, callback));
        *list = Arc::new(next);
        id
    }

    pub fn remove_level_callback(&self, id: CallbackId) -> bool {
        let mut list = self.level_callbacks.write();
        let before = list.len();
        let next: Vec<_> = list.iter().filter(|(i, _)| *i != id).cloned().collect();
        let removed = next.len() != before;
        *list = Arc::new(next);
        removed
    }

    pub fn update_callback_count(&self) -> usize {
        self.update_callbacks.read().len()
    }

    pub fn level_callback_count(&self) -> usize {
        self.level_callbacks.read().len()
    }

    /// Route client-originated changes to a device writer
    pub fn attach_writer(&self, writer: Weak<dyn ControlWriter>) {
        *self.writer.write() = Some(writer);
    }

    pub fn detach_writer(&self) {
        *self.writer.write() = None;
    }

    fn next_id(&self) -> CallbackId {
        CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for ChannelStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStateStore")
            .field("channels", &self.names)
            .field("update_callbacks", &self.update_callback_count())
            .field("level_callbacks", &self.level_callback_count())
            .finish()
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
