//! Per-client session
//!
//! A session owns the outbound queue of one client. Mixer updates, meter bursts and
//! transport feedback are encoded here and queued; the connection's writer task drains
//! the queue onto the socket.

use bytes::Bytes;
use osclive_core::ChannelStateStore;
use parking_lot::Mutex;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::framing::encode_packet;
use crate::layout::{Layout, Route, GEQ_CHANNEL};
use crate::transport::TransportControl;

/// Session identifier
pub type SessionId = String;

/// Meter levels arrive as 0..=255 and are sent scaled by this divisor
const LEVEL_SCALE: f32 = 32.0;

/// The heartbeat toggles every 8 bursts
const PING_PERIOD: u32 = 16;

#[derive(Debug, Default)]
struct BundleState {
    depth: usize,
    pending: Vec<OscMessage>,
}

#[derive(Debug, Clone, Copy)]
struct Meter {
    level: Option<f32>,
    peak: f32,
}

#[derive(Debug, Default)]
struct Meters {
    ping: u32,
    channels: HashMap<String, Meter>,
}

/// A connected OSC client
pub struct ClientSession {
    pub id: SessionId,
    pub peer: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    store: Arc<ChannelStateStore>,
    layout: Arc<Layout>,
    transport: Arc<TransportControl>,
    bundle: Mutex<BundleState>,
    meters: Mutex<Meters>,
}

/// Open bundle scope; the outermost scope sends everything queued as one frame
#[must_use = "the bundle is sent when the guard is dropped"]
pub struct BundleGuard<'a> {
    session: &'a ClientSession,
}

impl Drop for BundleGuard<'_> {
    fn drop(&mut self) {
        self.session.end_bundle();
    }
}

impl ClientSession {
    pub fn new(
        peer: SocketAddr,
        store: Arc<ChannelStateStore>,
        layout: Arc<Layout>,
        transport: Arc<TransportControl>,
        tx: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        let channels = layout
            .channels
            .iter()
            .map(|ch| {
                (
                    ch.clone(),
                    Meter {
                        level: None,
                        peak: 0.0,
                    },
                )
            })
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            peer,
            tx,
            store,
            layout,
            transport,
            bundle: Mutex::new(BundleState::default()),
            meters: Mutex::new(Meters { ping: 0, channels }),
        }
    }

    /// Queue one message, or hold it while a bundle scope is open
    pub fn send(&self, message: OscMessage) {
        {
            let mut bundle = self.bundle.lock();
            if bundle.depth > 0 {
                bundle.pending.push(message);
                return;
            }
        }
        self.send_packet(&OscPacket::Message(message));
    }

    pub fn send_value(&self, addr: impl Into<String>, value: OscType) {
        self.send(OscMessage {
            addr: addr.into(),
            args: vec![value],
        });
    }

    fn send_packet(&self, packet: &OscPacket) {
        match encode_packet(packet) {
            Ok(frame) => {
                // the receiver is gone once the connection closed
                let _ = self.tx.send(frame);
            }
            Err(e) => error!("Failed to encode packet for {}: {}", self.peer, e),
        }
    }

    pub fn bundle(&self) -> BundleGuard<'_> {
        self.bundle.lock().depth += 1;
        BundleGuard { session: self }
    }

    fn end_bundle(&self) {
        let pending = {
            let mut bundle = self.bundle.lock();
            bundle.depth = bundle.depth.saturating_sub(1);
            if bundle.depth > 0 || bundle.pending.is_empty() {
                return;
            }
            std::mem::take(&mut bundle.pending)
        };
        trace!("Flushing bundle of {} messages to {}", pending.len(), self.peer);
        self.send_packet(&OscPacket::Bundle(OscBundle {
            timetag: OscTime {
                seconds: 0,
                fractional: 1,
            },
            content: pending.into_iter().map(OscPacket::Message).collect(),
        }));
    }

    /// Send the complete mirrored state
    pub fn dump(&self) {
        debug!("Sending full state to {}", self.peer);
        for channel in &self.layout.channels {
            for control in &self.layout.controls {
                let value = self.control_value(channel, control);
                self.send_value(
                    format!("/channel/{}/{}", channel, control),
                    OscType::Float(value as f32),
                );
            }
        }

        for (channel, label) in &self.layout.labels {
            self.send_value(
                format!("/channel/{}/label", channel),
                OscType::String(label.clone()),
            );
        }

        if !self.layout.geq_bands.is_empty() {
            for (i, band) in self.layout.geq_bands.iter().enumerate() {
                let value = self.control_value(GEQ_CHANNEL, band);
                self.send_value(
                    format!("/channel/{}/{}", GEQ_CHANNEL, i + 1),
                    OscType::Float(value as f32),
                );
            }
            let value = self.control_value(GEQ_CHANNEL, "enable");
            self.send_value(
                format!("/channel/{}/enable", GEQ_CHANNEL),
                OscType::Float(value as f32),
            );
        }

        for message in self.transport.current_messages() {
            self.send(message);
        }
    }

    fn control_value(&self, channel: &str, control: &str) -> f64 {
        match self.store.get_control(channel, control) {
            Ok(value) => value,
            Err(e) => {
                error!("{}", e);
                0.0
            }
        }
    }

    /// Meter update: heartbeat, changed levels and new peaks in one bundle
    pub fn level_burst(&self) {
        let _bundle = self.bundle();
        let mut meters = self.meters.lock();

        meters.ping = (meters.ping + 1) % PING_PERIOD;
        if meters.ping % 8 == 0 {
            let alive = meters.ping >= 8;
            self.send_value("/connection_ping", OscType::Bool(alive));
        }

        for channel in &self.layout.inputs {
            let value = match self.store.get_level(channel, false) {
                Ok(level) => level.first() as f32 / LEVEL_SCALE,
                Err(e) => {
                    error!("{}", e);
                    0.0
                }
            };
            let Some(meter) = meters.channels.get_mut(channel) else {
                continue;
            };
            if meter.level != Some(value) {
                meter.level = Some(value);
                self.send_value(format!("/channel/{}/level", channel), OscType::Float(value));
            }
            if value > meter.peak {
                meter.peak = value;
                self.send_value(format!("/channel/{}/peak", channel), OscType::Float(value));
            }
        }
    }

    /// Mirror a control change to the client
    pub fn on_update(&self, channel: &str, control: &str, value: f64) {
        if self.layout.is_relayed(channel) {
            self.send_value(
                format!("/channel/{}/{}", channel, control),
                OscType::Float(value as f32),
            );
        }
        if channel == GEQ_CHANNEL {
            if let Some(band) = self.layout.geq_band(control) {
                self.send_value(
                    format!("/channel/{}/{}", channel, band),
                    OscType::Float(value as f32),
                );
            } else if control == "enable" {
                self.send_value(
                    format!("/channel/{}/enable", channel),
                    OscType::Float(value as f32),
                );
            }
        }
    }

    fn reset_peak(&self, channel: &str) {
        if let Some(meter) = self.meters.lock().channels.get_mut(channel) {
            meter.peak = -1.0;
        }
        self.level_burst();
    }

    /// Execute one inbound message
    ///
    /// Store writes reach the device through blocking I/O, so they run on the blocking
    /// pool and are awaited before the next message of this client is handled.
    pub async fn handle_message(&self, message: OscMessage) -> Result<()> {
        let Some(route) = self.layout.route(&message.addr) else {
            trace!("No route for {}", message.addr);
            return Ok(());
        };
        debug!("{} {:?} from {}", message.addr, message.args, self.peer);

        match route {
            Route::Control { channel, control } => {
                let Some(value) = numeric_arg(&message.args) else {
                    debug!("{} without a value", message.addr);
                    return Ok(());
                };
                self.set_controls(vec![(channel.clone(), control.clone())], value)
                    .await
            }
            _ if !is_trigger(&message.args) => Ok(()),
            Route::PanReset { channel } => {
                self.set_controls(vec![(channel.clone(), "pan".to_string())], 0.5)
                    .await
            }
            Route::PeakReset { channel } => {
                self.reset_peak(channel);
                Ok(())
            }
            Route::GeqReset => {
                let bands = self
                    .layout
                    .geq_bands
                    .iter()
                    .map(|b| (GEQ_CHANNEL.to_string(), b.clone()))
                    .collect();
                self.set_controls(bands, 0.5).await
            }
            Route::Init => {
                self.dump();
                Ok(())
            }
            Route::Transport(command) => {
                let transport = self.transport.clone();
                let command = *command;
                tokio::task::spawn_blocking(move || transport.execute(command))
                    .await
                    .map_err(join_error)??;
                Ok(())
            }
        }
    }

    async fn set_controls(&self, targets: Vec<(String, String)>, value: f64) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            for (channel, control) in &targets {
                store.set_control(channel, control, value)?;
            }
            Ok::<_, osclive_core::Error>(())
        })
        .await
        .map_err(join_error)??;
        Ok(())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

fn join_error(e: tokio::task::JoinError) -> RelayError {
    RelayError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// First argument as a control value
pub fn numeric_arg(args: &[OscType]) -> Option<f64> {
    match args.first()? {
        OscType::Float(v) => Some(*v as f64),
        OscType::Double(v) => Some(*v),
        OscType::Int(v) => Some(*v as f64),
        OscType::Long(v) => Some(*v as f64),
        OscType::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Button releases (a zero or false argument) do not fire actions
fn is_trigger(args: &[OscType]) -> bool {
    numeric_arg(args).map_or(true, |v| v != 0.0)
}

/// Messages of a packet, bundles flattened in order
pub fn flatten(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(m) => out.push(m),
        OscPacket::Bundle(b) => {
            for p in b.content {
                flatten(p, out);
            }
        }
    }
}
