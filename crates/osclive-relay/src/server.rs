//! OSC relay server
//!
//! Accepts TCP control surfaces and mirrors the mixer state to each of them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use osclive_core::{ChannelStateStore, DeviceProfile};
//! use osclive_relay::{NullTransport, RelayConfig, RelayServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(ChannelStateStore::new(&DeviceProfile::studiolive_1602()));
//!     let relay = RelayServer::new(store, RelayConfig::default(), Arc::new(NullTransport));
//!     relay.serve("0.0.0.0:4301").await.unwrap();
//! }
//! ```

use bytes::Bytes;
use dashmap::DashMap;
use osclive_core::{ChannelStateStore, DEFAULT_RELAY_PORT};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::framing::{decode_packet, FrameDecoder, MAX_FRAME_SIZE};
use crate::layout::Layout;
use crate::session::{flatten, ClientSession, SessionId};
use crate::transport::{AudioTransport, TransportControl};

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address
    pub listen: String,
    /// Largest accepted inbound frame body
    pub max_frame_size: usize,
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
    /// Input channel labels, keyed by channel name
    pub input_labels: BTreeMap<String, String>,
    /// Aux bus labels, keyed by channel name
    pub aux_labels: BTreeMap<String, String>,
    /// Where recordings are written and looked up
    pub recordings_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_RELAY_PORT),
            max_frame_size: MAX_FRAME_SIZE,
            keepalive_secs: 30,
            input_labels: BTreeMap::new(),
            aux_labels: BTreeMap::new(),
            recordings_dir: PathBuf::from("recordings"),
        }
    }
}

struct Connection {
    session: Arc<ClientSession>,
    task: Mutex<Option<AbortHandle>>,
}

struct Shared {
    config: RelayConfig,
    store: Arc<ChannelStateStore>,
    layout: Arc<Layout>,
    transport: Arc<TransportControl>,
    connections: DashMap<SessionId, Connection>,
}

/// OSC relay
pub struct RelayServer {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(
        store: Arc<ChannelStateStore>,
        config: RelayConfig,
        transport: Arc<dyn AudioTransport>,
    ) -> Self {
        let layout = Arc::new(Layout::new(
            &store,
            &config.input_labels,
            &config.aux_labels,
        ));
        let transport = Arc::new(TransportControl::new(
            transport,
            config.recordings_dir.clone(),
        ));
        transport.watch();
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                layout,
                transport,
                connections: DashMap::new(),
            }),
            shutdown,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn layout(&self) -> &Layout {
        &self.shared.layout
    }

    pub fn transport(&self) -> &Arc<TransportControl> {
        &self.shared.transport
    }

    /// Bind `addr` and serve until [`RelayServer::shutdown`]
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("OSC relay listening on {}", listener.local_addr()?);
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("OSC client connected: {}", peer);
                        self.handle_connection(stream, peer);
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("OSC relay stopped accepting");
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let shared = &self.shared;
        if shared.config.keepalive_secs > 0 {
            let socket = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(shared.config.keepalive_secs));
            if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
                warn!("Failed to enable keepalive for {}: {}", peer, e);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(ClientSession::new(
            peer,
            shared.store.clone(),
            shared.layout.clone(),
            shared.transport.clone(),
            tx,
        ));
        let id = session.id.clone();
        shared.connections.insert(
            id.clone(),
            Connection {
                session: session.clone(),
                task: Mutex::new(None),
            },
        );

        let task = tokio::spawn(run_connection(shared.clone(), session, stream, rx));
        if let Some(connection) = shared.connections.get(&id) {
            *connection.task.lock() = Some(task.abort_handle());
        }
    }

    /// Stop accepting and force-close every client
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<AbortHandle> = self
            .shared
            .connections
            .iter()
            .filter_map(|c| c.task.lock().take())
            .collect();
        info!("Closing {} OSC client(s)", tasks.len());
        for task in tasks {
            task.abort();
        }
        self.shared.connections.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Addresses of the connected clients
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.shared
            .connections
            .iter()
            .map(|c| c.session.peer)
            .collect()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Listener registrations of one session, undone on drop
///
/// Dropping also covers an aborted connection task.
struct Registration {
    shared: Arc<Shared>,
    session_id: SessionId,
    peer: SocketAddr,
    update: osclive_core::CallbackId,
    level: osclive_core::CallbackId,
    transport: u64,
}

impl Registration {
    fn new(shared: Arc<Shared>, session: &Arc<ClientSession>) -> Self {
        let weak = Arc::downgrade(session);
        let update = shared.store.add_update_callback(move |channel, control, value| {
            if let Some(session) = weak.upgrade() {
                session.on_update(channel, control, value);
            }
        });
        let weak = Arc::downgrade(session);
        let level = shared.store.add_level_callback(move || {
            if let Some(session) = weak.upgrade() {
                session.level_burst();
            }
        });
        let weak = Arc::downgrade(session);
        let transport = shared.transport.add_listener(move |messages| {
            if let Some(session) = weak.upgrade() {
                for message in messages {
                    session.send(message.clone());
                }
            }
        });

        Self {
            session_id: session.id.clone(),
            peer: session.peer,
            shared,
            update,
            level,
            transport,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shared.store.remove_update_callback(self.update);
        self.shared.store.remove_level_callback(self.level);
        self.shared.transport.remove_listener(self.transport);
        self.shared.connections.remove(&self.session_id);
        info!("OSC client disconnected: {}", self.peer);
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    session: Arc<ClientSession>,
    stream: TcpStream,
    rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let max_frame_size = shared.config.max_frame_size;
    let _registration = Registration::new(shared, &session);
    session.dump();

    let (reader, writer) = stream.into_split();
    tokio::select! {
        result = read_loop(reader, &session, max_frame_size) => {
            if let Err(e) = result {
                warn!("Closing {}: {}", session.peer, e);
            }
        }
        result = write_loop(writer, rx) => {
            if let Err(e) = result {
                debug!("Write to {} failed: {}", session.peer, e);
            }
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    session: &ClientSession,
    max_frame_size: usize,
) -> Result<()> {
    let mut decoder = FrameDecoder::new(max_frame_size);
    loop {
        if reader.read_buf(decoder.buffer_mut()).await? == 0 {
            return Ok(());
        }
        while let Some(body) = decoder.next_frame()? {
            let packet = match decode_packet(&body) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Undecodable packet from {}: {}", session.peer, e);
                    continue;
                }
            };
            let mut messages = Vec::new();
            flatten(packet, &mut messages);
            for message in messages {
                if let Err(e) = session.handle_message(message).await {
                    error!("Request from {} failed: {}", session.peer, e);
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> Result<()> {
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
    }
    Ok(())
}
