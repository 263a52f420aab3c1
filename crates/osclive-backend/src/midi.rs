//! MIDI SysEx adapter

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use osclive_core::SYSEX_END;

use crate::adapter::{Adapter, AdapterFactory};
use crate::{BackendError, Result};

/// Probe frame sent right after opening the ports
const PROBE: [u8; 3] = [0xF0, 0x33, 0xF7];

/// MIDI adapter configuration
#[derive(Debug, Clone)]
pub struct MidiAdapterConfig {
    /// Substring of the input and output port names
    pub port: String,
    /// Client name announced to the MIDI system
    pub client_name: String,
    /// Timeout for one response
    pub read_timeout: Duration,
    /// Timeout for the reply to the probe frame
    pub probe_timeout: Duration,
}

impl Default for MidiAdapterConfig {
    fn default() -> Self {
        Self {
            port: "StudioLive".to_string(),
            client_name: "osclive".to_string(),
            read_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// SysEx over a pair of MIDI ports
///
/// The midir connections live on a worker thread; frames cross over std channels.
pub struct MidiAdapter {
    out_tx: mpsc::Sender<Vec<u8>>,
    in_rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    config: MidiAdapterConfig,
    _worker: std::thread::JoinHandle<()>,
}

impl MidiAdapter {
    /// Open both ports and drain the mixer with a probe exchange
    pub fn open(config: MidiAdapterConfig) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String>>();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>();

        let worker_config = config.clone();
        let worker = std::thread::Builder::new()
            .name("osclive-midi".to_string())
            .spawn(move || {
                let (_input, mut output, name) = match connect_ports(&worker_config, in_tx) {
                    Ok(conns) => conns,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(name));

                while let Ok(data) = out_rx.recv() {
                    if let Err(e) = output.send(&data) {
                        warn!("MIDI send failed: {}", e);
                        break;
                    }
                }
                debug!("MIDI worker exiting");
            })?;

        let name = ready_rx
            .recv()
            .map_err(|_| BackendError::ConnectionLost("MIDI worker exited".to_string()))??;
        info!("Opened MIDI ports: {}", name);

        let mut adapter = Self {
            out_tx,
            in_rx,
            pending: Vec::new(),
            config,
            _worker: worker,
        };

        adapter.write(&PROBE)?;
        let timeout = adapter.config.probe_timeout;
        adapter.read_frame(timeout)?;
        Ok(adapter)
    }

    /// Input port names
    pub fn list_ports() -> Result<Vec<String>> {
        let midi_in = MidiInput::new("osclive scanner")
            .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;
        Ok(midi_in
            .ports()
            .iter()
            .filter_map(|p| midi_in.port_name(p).ok())
            .collect())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == SYSEX_END) {
                let frame: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.in_rx.recv_timeout(remaining) {
                Ok(data) => self.pending.extend_from_slice(&data),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(BackendError::ConnectionLost(format!(
                        "no SysEx response within {:?}",
                        timeout
                    )))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(BackendError::ConnectionLost("MIDI input closed".to_string()))
                }
            }
        }
    }
}

impl Adapter for MidiAdapter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.out_tx
            .send(data.to_vec())
            .map_err(|_| BackendError::ConnectionLost("MIDI output closed".to_string()))
    }

    fn read(&mut self, _len: usize) -> Result<Vec<u8>> {
        let timeout = self.config.read_timeout;
        self.read_frame(timeout)
    }
}

fn connect_ports(
    config: &MidiAdapterConfig,
    in_tx: mpsc::Sender<Vec<u8>>,
) -> Result<(MidiInputConnection<()>, MidiOutputConnection, String)> {
    let mut midi_in = MidiInput::new(&config.client_name)
        .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;
    // SysEx is filtered by default
    midi_in.ignore(Ignore::None);
    let midi_out = MidiOutput::new(&config.client_name)
        .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;

    let in_names: Vec<(String, midir::MidiInputPort)> = midi_in
        .ports()
        .into_iter()
        .filter_map(|p| midi_in.port_name(&p).ok().map(|n| (n, p)))
        .collect();
    let (in_name, in_port) = in_names
        .iter()
        .find(|(n, _)| n.contains(&config.port))
        .cloned()
        .ok_or_else(|| port_not_found(&config.port, in_names.iter().map(|(n, _)| n)))?;

    let out_names: Vec<(String, midir::MidiOutputPort)> = midi_out
        .ports()
        .into_iter()
        .filter_map(|p| midi_out.port_name(&p).ok().map(|n| (n, p)))
        .collect();
    let (_, out_port) = out_names
        .iter()
        .find(|(n, _)| n.contains(&config.port))
        .cloned()
        .ok_or_else(|| port_not_found(&config.port, out_names.iter().map(|(n, _)| n)))?;

    let input = midi_in
        .connect(
            &in_port,
            "osclive-in",
            move |_stamp, message, _| {
                if message.first() == Some(&0xF0) {
                    let _ = in_tx.send(message.to_vec());
                }
            },
            (),
        )
        .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;
    let output = midi_out
        .connect(&out_port, "osclive-out")
        .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;

    Ok((input, output, in_name))
}

fn port_not_found<'a>(wanted: &str, available: impl Iterator<Item = &'a String>) -> BackendError {
    let available: Vec<&str> = available.map(String::as_str).collect();
    BackendError::PortNotFound(format!("MIDI port {} not found in: {}", wanted, available.join(", ")))
}

/// Opens a [`MidiAdapter`] per connect attempt
pub struct MidiAdapterFactory {
    config: MidiAdapterConfig,
}

impl MidiAdapterFactory {
    pub fn new(config: MidiAdapterConfig) -> Self {
        Self { config }
    }
}

impl AdapterFactory for MidiAdapterFactory {
    fn open(&self) -> Result<Box<dyn Adapter>> {
        Ok(Box::new(MidiAdapter::open(self.config.clone())?))
    }

    fn describe(&self) -> String {
        format!("MIDI port '{}'", self.config.port)
    }
}
