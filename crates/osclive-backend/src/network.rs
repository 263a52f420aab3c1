//! Universal Control network backend
//!
//! Universal Control exposes the mixer over TCP. Every message is a little endian
//! `signature ‖ length ‖ body`; the body starts with a 12 byte header carrying the
//! model magic and a category.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use osclive_core::{
    ChannelIndex, ChannelKind, ChannelStateStore, ControlDescriptor, ControlWriter, DeviceProfile,
    Level,
};

use crate::link::{Link, LinkState};
use crate::traits::Backend;
use crate::{BackendError, Result};

/// Message signature
pub const SIGNATURE: u32 = 0xAA55_0011;

/// Body header length
pub const HEADER_LEN: usize = 12;

pub const CATEGORY_CONTROL: u16 = 2;
pub const CATEGORY_HELLO: u16 = 3;
pub const CATEGORY_CHANNEL_NAME: u16 = 4;
pub const CATEGORY_LEVELS: u16 = 5;

/// Level bytes in a category 5 message
pub const LEVEL_COUNT: usize = 128;

const KEY_LEN: usize = 32;
const CHANNEL_NAME_LEN: usize = 48;
const MAX_BODY_LEN: usize = 1024 * 1024;

/// Network backend configuration
#[derive(Debug, Clone)]
pub struct NetworkBackendConfig {
    /// Universal Control host
    pub host: String,
    /// Defaults to the profile's port
    pub port: Option<u16>,
    /// Client identification sent in the handshake
    pub ident: String,
    /// Client name sent in the handshake
    pub name: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub max_connect_attempts: Option<usize>,
}

impl Default for NetworkBackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            ident: "1BE8DC6BF62EA577B".to_string(),
            name: "SL-Remote".to_string(),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: None,
        }
    }
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq)]
pub enum UcMessage {
    Levels(Vec<u8>),
    ChannelName { id: u16, name: String },
    Control { id: u16, value: f64, key: String },
    Other { category: u16, len: usize },
}

/// Frame a body: signature, length, header, payload
pub fn encode_packet(magic: [u32; 3], category: u16, payload: &[u8]) -> Bytes {
    let body_len = HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(8 + body_len);
    buf.put_u32_le(SIGNATURE);
    buf.put_u32_le(body_len as u32);
    buf.put_u32_le(magic[0]);
    buf.put_u32_le(magic[1]);
    buf.put_u16_le(category);
    buf.put_u16_le(magic[2] as u16);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn hello_message(magic: [u32; 3], ident: &str, name: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 * KEY_LEN);
    put_padded(&mut payload, ident, KEY_LEN);
    put_padded(&mut payload, name, KEY_LEN);
    encode_packet(magic, CATEGORY_HELLO, &payload)
}

/// Control change, `u16 id ‖ f64 value ‖ key[32]` packed
pub fn control_message(magic: [u32; 3], id: u16, value: f64, key: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + 8 + KEY_LEN);
    payload.put_u16_le(id);
    payload.put_f64_le(value);
    put_padded(&mut payload, key, KEY_LEN);
    encode_packet(magic, CATEGORY_CONTROL, &payload)
}

/// Category 5 payload
pub fn levels_message(magic: [u32; 3], levels: &[u8; LEVEL_COUNT]) -> Bytes {
    encode_packet(magic, CATEGORY_LEVELS, levels)
}

/// Parse a message body (everything after the length word)
pub fn parse_body(magic: [u32; 3], body: &[u8]) -> Result<UcMessage> {
    if body.len() < HEADER_LEN {
        return Err(BackendError::Protocol(format!(
            "message body of {} bytes is shorter than its header",
            body.len()
        )));
    }
    let mut header = &body[..HEADER_LEN];
    let got = [header.get_u32_le(), header.get_u32_le()];
    let category = header.get_u16_le();
    let got_magic2 = header.get_u16_le() as u32;
    if got != [magic[0], magic[1]] || got_magic2 != magic[2] {
        return Err(BackendError::Protocol(format!(
            "unexpected magic {:08x} {:08x} {}",
            got[0], got[1], got_magic2
        )));
    }

    let mut payload = &body[HEADER_LEN..];
    let message = match category {
        CATEGORY_LEVELS => {
            expect_len(category, payload, LEVEL_COUNT)?;
            UcMessage::Levels(payload[..LEVEL_COUNT].to_vec())
        }
        CATEGORY_CHANNEL_NAME => {
            expect_len(category, payload, 4 + CHANNEL_NAME_LEN)?;
            let _ = payload.get_u16_le();
            let id = payload.get_u16_le();
            UcMessage::ChannelName {
                id,
                name: parse_str(&payload[..CHANNEL_NAME_LEN]),
            }
        }
        CATEGORY_CONTROL => {
            expect_len(category, payload, 2 + 8 + KEY_LEN)?;
            let id = payload.get_u16_le();
            let value = payload.get_f64_le();
            UcMessage::Control {
                id,
                value,
                key: parse_str(&payload[..KEY_LEN]),
            }
        }
        category => UcMessage::Other {
            category,
            len: payload.len(),
        },
    };
    Ok(message)
}

fn expect_len(category: u16, payload: &[u8], len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(BackendError::Protocol(format!(
            "category {} payload has {} bytes, need {}",
            category,
            payload.len(),
            len
        )));
    }
    Ok(())
}

fn put_padded(buf: &mut BytesMut, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, len - n);
}

fn parse_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Read one message body from the stream
pub fn read_body<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 8];
    reader.read_exact(&mut prefix)?;
    let mut prefix = &prefix[..];
    let signature = prefix.get_u32_le();
    let len = prefix.get_u32_le() as usize;
    if signature != SIGNATURE {
        return Err(BackendError::Protocol(format!("bad signature {:08x}", signature)));
    }
    if len > MAX_BODY_LEN {
        return Err(BackendError::Protocol(format!("message of {} bytes too large", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

struct NetInner {
    store: Arc<ChannelStateStore>,
    profile: Arc<DeviceProfile>,
    config: NetworkBackendConfig,
    magic: [u32; 3],
    port: u16,
    /// Write half; also used to unblock the reader on shutdown
    writer: Mutex<Option<TcpStream>>,
    link: Link,
}

/// Backend talking to Universal Control
pub struct NetworkBackend {
    inner: Arc<NetInner>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkBackend {
    pub fn new(
        store: Arc<ChannelStateStore>,
        profile: Arc<DeviceProfile>,
        config: NetworkBackendConfig,
    ) -> Result<Self> {
        let network = profile.network.ok_or_else(|| {
            BackendError::Config(format!("{} has no network profile", profile.name))
        })?;
        let port = config.port.unwrap_or(network.port);
        Ok(Self {
            inner: Arc::new(NetInner {
                store,
                profile,
                config,
                magic: network.magic,
                port,
                writer: Mutex::new(None),
                link: Link::new(),
            }),
            reader_thread: Mutex::new(None),
        })
    }
}

impl NetInner {
    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.config.host.as_str(), self.port)
            .to_socket_addrs()?
            .collect();
        if addrs.is_empty() {
            return Err(BackendError::Config(format!(
                "{} does not resolve",
                self.config.host
            )));
        }
        Ok(addrs)
    }

    fn open_stream(&self) -> Result<TcpStream> {
        let mut last = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        Err(last
            .map(BackendError::Io)
            .unwrap_or_else(|| BackendError::ConnectionLost("no address to connect to".into())))
    }

    /// Handshake, then consume messages until the first level update
    fn handshake(&self) -> Result<TcpStream> {
        let mut stream = self.open_stream()?;
        stream.set_nodelay(true)?;
        let write_half = stream.try_clone()?;
        *self.writer.lock() = Some(write_half);

        stream.write_all(&hello_message(self.magic, &self.config.ident, &self.config.name))?;
        self.link.set_state(LinkState::Syncing);

        stream.set_read_timeout(Some(self.config.connect_timeout))?;
        loop {
            let body = read_body(&mut stream)?;
            let message = parse_body(self.magic, &body)?;
            let levels = matches!(message, UcMessage::Levels(_));
            self.handle(message)?;
            if levels {
                break;
            }
        }
        stream.set_read_timeout(None)?;
        Ok(stream)
    }

    fn connect(&self, max_attempts: Option<usize>) -> Result<TcpStream> {
        let mut connected = None;
        self.link
            .connect_with_retry(self.config.reconnect_delay, max_attempts, || {
                self.drop_stream();
                match self.handshake() {
                    Ok(stream) => {
                        connected = Some(stream);
                        Ok(())
                    }
                    Err(e) => {
                        self.drop_stream();
                        Err(e)
                    }
                }
            })?;
        let stream = connected
            .ok_or_else(|| BackendError::ConnectionLost("handshake produced no stream".into()))?;
        self.link.set_state(LinkState::Polling);
        info!(
            "Connected to Universal Control at {}:{}",
            self.config.host, self.port
        );
        Ok(stream)
    }

    fn drop_stream(&self) {
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn handle(&self, message: UcMessage) -> Result<()> {
        match message {
            UcMessage::Levels(levels) => self.apply_levels(&levels)?,
            UcMessage::ChannelName { id, name } => {
                debug!("Channel {:02} name '{}'", id, name);
            }
            UcMessage::Control { id, value, key } => {
                let Some((channel, desc)) = self.profile.channel_by_key(&key) else {
                    debug!("Control update for unknown channel {}", key);
                    return Ok(());
                };
                let Some(control) = desc.control_by_param(id) else {
                    debug!(
                        "Unknown control update {} for channel {} with value {:.2}",
                        id, channel, value
                    );
                    return Ok(());
                };
                self.store.update_control(channel, control, value)?;
            }
            UcMessage::Other { category, len } => {
                trace!("Ignoring category {} message of {} bytes", category, len);
            }
        }
        Ok(())
    }

    /// Inputs take one level byte each, two for stereo, in channel order
    fn apply_levels(&self, levels: &[u8]) -> Result<()> {
        let mut i = 0;
        for (name, desc) in self.profile.channels() {
            let level = match desc.kind.level_count() {
                1 => levels.get(i).map(|l| Level::Mono(*l)),
                2 => match (levels.get(i), levels.get(i + 1)) {
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

    fn write_control(&self, channel: &str, control: &str, value: f64) -> Result<()> {
        let desc = self.store.descriptor(channel)?;
        if desc.kind == ChannelKind::Geq {
            return Err(osclive_core::Error::ReadOnly(channel.to_string()).into());
        }
        let ChannelIndex::Key(key) = &desc.index else {
            return Err(BackendError::Config(format!("{} has no network key", channel)));
        };
        let Some(ControlDescriptor::Param { id }) = desc.control(control) else {
            return Err(osclive_core::Error::UnknownControl {
                channel: channel.to_string(),
                control: control.to_string(),
            }
            .into());
        };

        let message = control_message(self.magic, *id, value, key);
        let mut writer = self.writer.lock();
        let stream = writer
            .as_mut()
            .ok_or_else(|| BackendError::ConnectionLost("not connected".to_string()))?;
        stream.write_all(&message)?;
        Ok(())
    }

    fn run(self: Arc<Self>, mut stream: TcpStream) {
        while !self.link.is_stopped() {
            let result = read_body(&mut stream)
                .and_then(|body| parse_body(self.magic, &body))
                .and_then(|message| self.handle(message));
            match result {
                Ok(()) => {}
                Err(_) if self.link.is_stopped() => break,
                Err(e) if e.is_recoverable() => {
                    warn!("Universal Control link failed: {}, reconnecting", e);
                    self.drop_stream();
                    self.link.set_state(LinkState::Reconnecting);
                    match self.connect(None) {
                        Ok(s) => stream = s,
                        Err(e) => {
                            if !matches!(e, BackendError::Stopped) {
                                error!("Reconnect failed: {}", e);
                            }
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Reader stopped: {}", e);
                    break;
                }
            }
        }
        self.drop_stream();
        if self.link.is_stopped() {
            self.link.set_state(LinkState::Stopped);
        } else {
            self.link.set_state(LinkState::Disconnected);
        }
        debug!("Reader thread exiting");
    }
}

impl ControlWriter for NetworkBackend {
    fn write_control(&self, channel: &str, control: &str, value: f64) {
        if let Err(e) = self.inner.write_control(channel, control, value) {
            warn!(
                "Universal Control write of {}/{} unsuccessful: {}",
                channel, control, e
            );
        }
    }
}

impl Backend for NetworkBackend {
    fn name(&self) -> String {
        format!(
            "{} (Universal Control {}:{})",
            self.inner.profile.name, self.inner.config.host, self.inner.port
        )
    }

    fn start(&self) -> Result<()> {
        let mut reader_thread = self.reader_thread.lock();
        if reader_thread.is_some() {
            return Err(BackendError::AlreadyRunning);
        }
        self.inner.link.reset();
        let stream = self.inner.connect(self.inner.config.max_connect_attempts)?;

        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("osclive-uc".to_string())
            .spawn(move || inner.run(stream))?;
        *reader_thread = Some(handle);
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.link.stop();
        self.inner.drop_stream();
        if let Some(handle) = self.reader_thread.lock().take() {
            if handle.join().is_err() {
                error!("Reader thread panicked");
            }
        }
        self.inner.link.set_state(LinkState::Stopped);
        info!("Universal Control backend stopped");
    }

    fn state(&self) -> LinkState {
        self.inner.link.state()
    }
}

impl Drop for NetworkBackend {
    fn drop(&mut self) {
        self.inner.link.stop();
        self.inner.drop_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osclive_core::device::UC_MAGIC;

    fn body(packet: &[u8]) -> &[u8] {
        &packet[8..]
    }

    #[test]
    fn test_packet_prefix() {
        let packet = encode_packet(UC_MAGIC, 7, &[1, 2, 3]);
        assert_eq!(&packet[..4], &[0x11, 0x00, 0x55, 0xAA]);
        assert_eq!(&packet[4..8], &15u32.to_le_bytes());
        assert_eq!(packet.len(), 8 + 15);
    }

    #[test]
    fn test_hello_layout() {
        let packet = hello_message(UC_MAGIC, "1BE8DC6BF62EA577B", "SL-Remote");
        let body = body(&packet);
        assert_eq!(body.len(), HEADER_LEN + 64);
        assert_eq!(u16::from_le_bytes([body[8], body[9]]), CATEGORY_HELLO);
        assert_eq!(&body[12..29], b"1BE8DC6BF62EA577B");
        assert_eq!(body[29], 0);
        assert_eq!(&body[44..53], b"SL-Remote");
    }

    #[test]
    fn test_control_message_parses_back() {
        let packet = control_message(UC_MAGIC, 3052, 1.0, "in3,0");
        assert_eq!(packet.len(), 8 + HEADER_LEN + 42);
        let message = parse_body(UC_MAGIC, body(&packet)).unwrap();
        assert_eq!(
            message,
            UcMessage::Control {
                id: 3052,
                value: 1.0,
                key: "in3,0".to_string()
            }
        );
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let packet = encode_packet([1, 2, 3], CATEGORY_LEVELS, &[0; LEVEL_COUNT]);
        assert!(matches!(
            parse_body(UC_MAGIC, body(&packet)),
            Err(BackendError::Protocol(_))
        ));
    }

    #[test]
    fn test_short_levels_rejected() {
        let packet = encode_packet(UC_MAGIC, CATEGORY_LEVELS, &[0; 10]);
        assert!(parse_body(UC_MAGIC, body(&packet)).is_err());
    }

    #[test]
    fn test_read_body_checks_signature() {
        let mut data: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(read_body(&mut data), Err(BackendError::Protocol(_))));

        let packet = encode_packet(UC_MAGIC, 17, &[9, 9]);
        let mut data: &[u8] = &packet;
        let body = read_body(&mut data).unwrap();
        assert_eq!(
            parse_body(UC_MAGIC, &body).unwrap(),
            UcMessage::Other {
                category: 17,
                len: 2
            }
        );
    }
}
