//! In-memory StudioLive speaking the SysEx register-link protocol

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use osclive_backend::{Adapter, AdapterFactory, BackendError};
use osclive_core::codec::{decode_control, encode_control, nibble_pair_encode, sysex_frame};
use osclive_core::device::{STATUS_FADERS_MOVED, STATUS_LEVELS_START};
use osclive_core::{
    ChannelDescriptor, ChannelIndex, DeviceProfile, ValueKind, SYSEX_END, SYSEX_START, WRITE_ACK,
};

/// Negative acknowledgement sent when writes are set to fail
pub const NACK: [u8; 3] = [SYSEX_START, 0x11, SYSEX_END];

/// Frames received that were not read or write commands
pub const ROUTE_CHANNEL: &str = "<route>";

struct MixerState {
    profile: DeviceProfile,
    payloads: HashMap<String, Vec<u8>>,
    status: Vec<u8>,
    online: bool,
    fail_writes: bool,
    corrupt_next: bool,
    reads: HashMap<String, usize>,
    writes: Vec<(String, Vec<u8>)>,
    open_count: usize,
}

/// Simulated mixer shared between a test and the adapters it hands out
///
/// Payloads start zeroed except for the identity bytes echoed from the read command
/// (`idx` for inputs, `01 idx` for the GEQ, `03 idx` for effects).
#[derive(Clone)]
pub struct SimulatedMixer {
    state: Arc<Mutex<MixerState>>,
}

impl SimulatedMixer {
    pub fn new(profile: DeviceProfile) -> Self {
        let mut payloads = HashMap::new();
        for (name, desc) in profile.channels() {
            payloads.insert(name.clone(), initial_payload(desc));
        }
        let status_len = profile.status.as_ref().map(|d| d.length).unwrap_or(0);

        Self {
            state: Arc::new(Mutex::new(MixerState {
                profile,
                payloads,
                status: vec![0; status_len],
                online: true,
                fail_writes: false,
                corrupt_next: false,
                reads: HashMap::new(),
                writes: Vec::new(),
                open_count: 0,
            })),
        }
    }

    pub fn studiolive_1602() -> Self {
        Self::new(DeviceProfile::studiolive_1602())
    }

    /// Factory handing out adapters connected to this mixer
    pub fn factory(&self) -> SimAdapterFactory {
        SimAdapterFactory {
            mixer: self.clone(),
        }
    }

    /// Offline mixers refuse new adapters and fail every transaction
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Answer writes with a NACK instead of the acknowledgement
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Drop the terminator of the next response
    pub fn corrupt_next_response(&self) {
        self.state.lock().corrupt_next = true;
    }

    /// Front panel change: update the payload and flag the channel in the status frame
    pub fn set_control(&self, channel: &str, control: &str, value: f64) {
        let mut state = self.state.lock();
        let desc = state.edit_control(channel, control, value);
        state.flag_changed(&desc);
    }

    /// Update the payload without raising any status flag
    ///
    /// Only a full re-read of the channel picks such a change up.
    pub fn set_control_silently(&self, channel: &str, control: &str, value: f64) {
        self.state.lock().edit_control(channel, control, value);
    }

    /// Fader move: only the faders flag is raised
    pub fn move_fader(&self, channel: &str, value: f64) {
        let mut state = self.state.lock();
        let desc = descriptor(&state.profile, channel);
        let ctrl = *desc.control("gain").expect("gain control");
        let payload = state.payloads.get_mut(channel).expect("payload");
        assert!(encode_control(&ctrl, payload, desc.offset, value));
        state.set_status_byte(STATUS_FADERS_MOVED, 1);
    }

    /// Meter bytes, in status frame order
    pub fn set_levels(&self, levels: &[u8]) {
        let mut state = self.state.lock();
        let offset = state.status_offset();
        let start = STATUS_LEVELS_START - offset;
        state.status[start..start + levels.len()].copy_from_slice(levels);
    }

    /// Value the mixer currently holds
    pub fn control(&self, channel: &str, control: &str) -> f64 {
        let state = self.state.lock();
        let desc = descriptor(&state.profile, channel);
        let ctrl = desc.control(control).expect("control");
        decode_control(ctrl, &state.payloads[channel], desc.offset).expect("payload control")
    }

    pub fn payload(&self, channel: &str) -> Vec<u8> {
        self.state.lock().payloads[channel].clone()
    }

    /// Read commands served for a channel (`status` and `faders` included)
    pub fn read_count(&self, channel: &str) -> usize {
        self.state.lock().reads.get(channel).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.state.lock().reads.values().sum()
    }

    /// Accepted writes as (channel, payload), routing commands under [`ROUTE_CHANNEL`]
    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.reads.clear();
        state.writes.clear();
    }

    fn transact(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        let mut state = self.state.lock();
        if !state.online {
            return Err(BackendError::ConnectionLost("mixer offline".to_string()));
        }
        let mut response = state.respond(frame);
        if state.corrupt_next {
            if let Some(last) = response.as_mut().and_then(|r| r.last_mut()) {
                state.corrupt_next = false;
                *last = 0x00;
            }
        }
        Ok(response)
    }
}

impl MixerState {
    fn status_offset(&self) -> usize {
        self.profile.status.as_ref().map(|d| d.offset).unwrap_or(2)
    }

    fn set_status_byte(&mut self, byte: usize, value: u8) {
        let i = byte - self.status_offset();
        self.status[i] = value;
    }

    fn edit_control(&mut self, channel: &str, control: &str, value: f64) -> Arc<ChannelDescriptor> {
        let desc = descriptor(&self.profile, channel);
        let ctrl = *desc
            .control(control)
            .unwrap_or_else(|| panic!("unknown control {}/{}", channel, control));
        let payload = self.payloads.get_mut(channel).expect("payload");
        assert!(encode_control(&ctrl, payload, desc.offset, value));
        desc
    }

    fn flag_changed(&mut self, desc: &ChannelDescriptor) {
        let (Some(group), ChannelIndex::Number(idx)) = (desc.kind.status_group(), &desc.index)
        else {
            return;
        };
        let i = group - *idx as usize / 4 - self.status_offset();
        self.status[i] |= 1 << (idx % 4);
    }

    fn count_read(&mut self, name: &str) {
        *self.reads.entry(name.to_string()).or_insert(0) += 1;
    }

    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 2 || frame[0] != SYSEX_START || frame[frame.len() - 1] != SYSEX_END {
            return None;
        }
        let command = &frame[1..frame.len() - 1];

        if let Some(status) = self.profile.status.clone() {
            if command == status.read_id.as_slice() {
                self.count_read("status");
                let response = sysex_frame(&status.resp_id, &self.status);
                // change bits and the faders flag are cleared once reported
                let start = status.offset;
                let first = 10 - start;
                let last = STATUS_FADERS_MOVED - start;
                self.status[first..=last].fill(0);
                return Some(response);
            }
        }
        if let Some(faders) = self.profile.faders.clone() {
            if command == faders.read_id.as_slice() {
                self.count_read("faders");
                return Some(sysex_frame(&faders.resp_id, &self.faders_payload(&faders)));
            }
        }

        let channels = self.profile.channels().to_vec();
        for (name, desc) in &channels {
            if command == desc.read_id.as_slice() {
                self.count_read(name);
                return Some(sysex_frame(&desc.resp_id, &self.payloads[name]));
            }
        }

        for (name, desc) in &channels {
            if !desc.is_writable() || !command.starts_with(&desc.write_id) {
                continue;
            }
            let payload = &command[desc.write_id.len()..];
            if payload.len() != desc.length || !payload.starts_with(&identity(desc)) {
                continue;
            }
            if self.fail_writes {
                return Some(NACK.to_vec());
            }
            self.payloads.insert(name.clone(), payload.to_vec());
            self.writes.push((name.clone(), payload.to_vec()));
            return Some(vec![SYSEX_START, WRITE_ACK, SYSEX_END]);
        }

        self.writes.push((ROUTE_CHANNEL.to_string(), command.to_vec()));
        None
    }

    fn faders_payload(&self, faders: &ChannelDescriptor) -> Vec<u8> {
        let mut payload = vec![0u8; faders.length];
        for (name, desc) in self.profile.channels() {
            let (true, ChannelIndex::Number(idx)) = (desc.kind.is_input(), &desc.index) else {
                continue;
            };
            let Some(gain) = desc.control("gain") else {
                continue;
            };
            let value = decode_control(gain, &self.payloads[name], desc.offset).unwrap_or(0.0);
            let b = *idx as usize * 2;
            if b + 2 <= payload.len() {
                payload[b..b + 2].copy_from_slice(&nibble_pair_encode(value, ValueKind::Gain));
            }
        }
        payload
    }
}

fn descriptor(profile: &DeviceProfile, channel: &str) -> Arc<ChannelDescriptor> {
    profile
        .channel(channel)
        .unwrap_or_else(|| panic!("unknown channel {}", channel))
        .clone()
}

fn identity(desc: &ChannelDescriptor) -> Vec<u8> {
    desc.read_id.get(1..).map(<[u8]>::to_vec).unwrap_or_default()
}

fn initial_payload(desc: &ChannelDescriptor) -> Vec<u8> {
    let mut payload = vec![0u8; desc.length];
    let id = identity(desc);
    payload[..id.len()].copy_from_slice(&id);
    payload
}

/// Adapter connected to a [`SimulatedMixer`]
pub struct SimAdapter {
    mixer: SimulatedMixer,
    pending: Option<Vec<u8>>,
}

impl Adapter for SimAdapter {
    fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        self.pending = self.mixer.transact(data)?;
        Ok(())
    }

    fn read(&mut self, _len: usize) -> Result<Vec<u8>, BackendError> {
        if !self.mixer.state.lock().online {
            return Err(BackendError::ConnectionLost("mixer offline".to_string()));
        }
        self.pending
            .take()
            .ok_or_else(|| BackendError::ConnectionLost("no response pending".to_string()))
    }
}

pub struct SimAdapterFactory {
    mixer: SimulatedMixer,
}

impl AdapterFactory for SimAdapterFactory {
    fn open(&self) -> Result<Box<dyn Adapter>, BackendError> {
        let mut state = self.mixer.state.lock();
        if !state.online {
            return Err(BackendError::ConnectionLost("mixer offline".to_string()));
        }
        state.open_count += 1;
        Ok(Box::new(SimAdapter {
            mixer: self.mixer.clone(),
            pending: None,
        }))
    }

    fn describe(&self) -> String {
        "simulated mixer".to_string()
    }
}
