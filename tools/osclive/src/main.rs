//! OSCLive
//!
//! Mirrors a PreSonus StudioLive mixer to OSC control surfaces over TCP.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use osclive_backend::{
    attach, AdapterFactory, Backend, MidiAdapter, MidiAdapterConfig, MidiAdapterFactory,
    NetworkBackend, NetworkBackendConfig, RawBackend, RawBackendConfig,
};
use osclive_core::{ChannelStateStore, DeviceProfile};
use osclive_relay::{NullTransport, RelayConfig, RelayServer};

use crate::config::{split_host_port, BackendMode, FileConfig};

#[derive(Parser)]
#[command(name = "osclive")]
#[command(about = "OSC remote control server for PreSonus StudioLive mixers")]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Connect to the host running Universal Control (HOST[:PORT])
    #[arg(short, long, value_name = "HOST", conflicts_with = "midi")]
    uc: Option<String>,

    /// Use a MIDI port (the default link)
    #[arg(short, long, value_name = "PORT")]
    midi: Option<String>,

    /// Use the FireWire register link on a character device
    #[arg(
        long,
        value_name = "DEVICE",
        num_args = 0..=1,
        default_missing_value = "/dev/fw1",
        conflicts_with_all = ["uc", "midi"]
    )]
    firewire: Option<String>,

    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Service name for discovery
    #[arg(short, long)]
    name: Option<String>,

    /// Do not announce the relay over mDNS
    #[arg(long)]
    no_announce: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the available MIDI ports and exit
    #[arg(long)]
    list_midi_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.list_midi_ports {
        for port in MidiAdapter::list_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let mut file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    apply_overrides(&cli, &mut file);

    let store_profile = match file.backend.mode {
        BackendMode::Uc => DeviceProfile::studiolive_1602_network(),
        _ => DeviceProfile::studiolive_1602(),
    };
    let profile = Arc::new(store_profile);
    let store = Arc::new(ChannelStateStore::new(&profile));
    let backend = build_backend(&file, store.clone(), profile)?;

    tracing::info!("Connecting to {}", backend.name());
    let starter = backend.clone();
    tokio::select! {
        started = tokio::task::spawn_blocking(move || starter.start()) => {
            started.context("backend start panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted while connecting");
            backend.shutdown();
            return Ok(());
        }
    }

    let relay_config = RelayConfig {
        listen: file.relay.listen.clone(),
        keepalive_secs: file.relay.keepalive_secs,
        input_labels: file.labels.input.clone(),
        aux_labels: file.labels.aux.clone(),
        recordings_dir: file.transport.recordings_dir.clone(),
        ..RelayConfig::default()
    };
    let listener = tokio::net::TcpListener::bind(&relay_config.listen)
        .await
        .with_context(|| format!("binding {}", relay_config.listen))?;
    let port = listener.local_addr()?.port();
    tracing::info!("Listening on: {}", listener.local_addr()?);

    let relay = Arc::new(RelayServer::new(
        store,
        relay_config,
        Arc::new(NullTransport),
    ));

    #[cfg(feature = "announce")]
    let mut advertiser = if file.relay.announce {
        let mut advertiser = osclive_discovery::ServiceAdvertiser::new()?;
        advertiser.advertise(&file.relay.name, port, &[])?;
        Some(advertiser)
    } else {
        None
    };
    #[cfg(not(feature = "announce"))]
    let _ = port;

    let server = relay.clone();
    let serving = tokio::spawn(async move { server.serve_on(listener).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    relay.shutdown();
    match serving.await {
        Ok(Err(e)) => tracing::error!("Relay error: {}", e),
        Err(e) => tracing::error!("Relay task failed: {}", e),
        Ok(Ok(())) => {}
    }

    #[cfg(feature = "announce")]
    if let Some(advertiser) = advertiser.as_mut() {
        if let Err(e) = advertiser.stop() {
            tracing::warn!("{}", e);
        }
    }

    tokio::task::spawn_blocking(move || backend.shutdown()).await?;
    Ok(())
}

/// Command line flags win over the config file
fn apply_overrides(cli: &Cli, file: &mut FileConfig) {
    if let Some(listen) = &cli.listen {
        file.relay.listen = listen.clone();
    }
    if let Some(name) = &cli.name {
        file.relay.name = name.clone();
    }
    if cli.no_announce {
        file.relay.announce = false;
    }
    if let Some(host) = &cli.uc {
        file.backend.mode = BackendMode::Uc;
        file.backend.uc_host = host.clone();
    }
    if let Some(port) = &cli.midi {
        file.backend.mode = BackendMode::Midi;
        file.backend.midi_port = port.clone();
    }
    if let Some(device) = &cli.firewire {
        file.backend.mode = BackendMode::Firewire;
        file.backend.firewire_device = device.clone();
    }
}

fn build_backend(
    file: &FileConfig,
    store: Arc<ChannelStateStore>,
    profile: Arc<DeviceProfile>,
) -> Result<Arc<dyn Backend>> {
    let reconnect_delay = Duration::from_millis(file.backend.reconnect_delay_ms);
    match file.backend.mode {
        BackendMode::Uc => {
            let (host, port) = split_host_port(&file.backend.uc_host)?;
            let config = NetworkBackendConfig {
                host,
                port,
                reconnect_delay,
                ..NetworkBackendConfig::default()
            };
            let backend = Arc::new(NetworkBackend::new(store.clone(), profile, config)?);
            attach(&store, &backend);
            Ok(backend)
        }
        BackendMode::Midi => {
            let factory = MidiAdapterFactory::new(MidiAdapterConfig {
                port: file.backend.midi_port.clone(),
                ..MidiAdapterConfig::default()
            });
            Ok(raw_backend(file, store, profile, Box::new(factory)))
        }
        #[cfg(feature = "firewire")]
        BackendMode::Firewire => {
            let factory = osclive_backend::firewire_factory(osclive_backend::FirewireConfig {
                device: file.backend.firewire_device.clone(),
                ..osclive_backend::FirewireConfig::default()
            });
            Ok(raw_backend(file, store, profile, Box::new(factory)))
        }
        #[cfg(not(feature = "firewire"))]
        BackendMode::Firewire => anyhow::bail!(
            "this build has no FireWire support; rebuild with `--features firewire` \
             or use --midi PORT or --uc HOST"
        ),
    }
}

fn raw_backend(
    file: &FileConfig,
    store: Arc<ChannelStateStore>,
    profile: Arc<DeviceProfile>,
    factory: Box<dyn AdapterFactory>,
) -> Arc<dyn Backend> {
    let config = RawBackendConfig {
        poll_interval: Duration::from_millis(file.backend.poll_interval_ms),
        reconnect_delay: Duration::from_millis(file.backend.reconnect_delay_ms),
        ..RawBackendConfig::default()
    };
    let backend = Arc::new(RawBackend::new(store.clone(), profile, factory, config));
    attach(&store, &backend);
    backend
}
