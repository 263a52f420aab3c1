//! Relay tests
//!
//! Tests for the OSC relay including:
//! - State dump on connect
//! - Fan-out of mixer changes and client writes
//! - Address dispatch and bundle handling
//! - Connection lifecycle

use parking_lot::Mutex;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use osclive_backend::{attach, Backend, RawBackend, RawBackendConfig};
use osclive_core::{ChannelStateStore, DeviceProfile, Level};
use osclive_relay::transport::StatusCallback;
use osclive_relay::{AudioTransport, NullTransport, RelayConfig, RelayServer};
use osclive_test_utils::{
    float_arg, wait_for, SimulatedMixer, TestClient, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT,
};

const QUIET: Duration = Duration::from_millis(300);

struct Harness {
    store: Arc<ChannelStateStore>,
    relay: Arc<RelayServer>,
    port: u16,
}

async fn start_relay_with(
    store: Arc<ChannelStateStore>,
    config: RelayConfig,
    transport: Arc<dyn AudioTransport>,
) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(RelayServer::new(store.clone(), config, transport));
    let server = relay.clone();
    tokio::spawn(async move {
        let _ = server.serve_on(listener).await;
    });
    Harness { store, relay, port }
}

async fn start_relay() -> Harness {
    let store = Arc::new(ChannelStateStore::new(&DeviceProfile::studiolive_1602()));
    start_relay_with(store, RelayConfig::default(), Arc::new(NullTransport)).await
}

/// Connected client with the initial dump already consumed
async fn client(port: u16) -> TestClient {
    let mut client = TestClient::connect(port).await.unwrap();
    let dump = client.messages_until_quiet(QUIET).await;
    assert!(!dump.is_empty(), "no state dump received");
    client
}

fn matching<'a>(messages: &'a [OscMessage], addr: &str) -> Vec<&'a OscMessage> {
    messages.iter().filter(|m| m.addr == addr).collect()
}

#[tokio::test]
async fn test_fresh_client_receives_full_state() {
    let harness = start_relay().await;
    harness.store.update_control("aux2", "mute", 1.0).unwrap();
    harness.store.update_control("geq0", "20kHz", 0.75).unwrap();

    let mut client = TestClient::connect(harness.port).await.unwrap();
    let dump = client.messages_until_quiet(QUIET).await;

    let layout = harness.relay.layout();
    for channel in &layout.channels {
        for control in &layout.controls {
            let addr = format!("/channel/{}/{}", channel, control);
            assert!(!matching(&dump, &addr).is_empty(), "{} missing", addr);
        }
    }
    let mute = matching(&dump, "/channel/aux2/mute");
    assert_eq!(float_arg(mute[0]), Some(1.0));
    let band = matching(&dump, "/channel/geq0/31");
    assert_eq!(float_arg(band[0]), Some(0.75));
    assert_eq!(
        matching(&dump, "/channel/main/label")[0].args,
        vec![OscType::String("Main".into())]
    );
    // unset controls read as zero
    assert_eq!(float_arg(matching(&dump, "/channel/ch7/solo")[0]), Some(0.0));
}

#[tokio::test]
async fn test_labels_from_config() {
    let store = Arc::new(ChannelStateStore::new(&DeviceProfile::studiolive_1602()));
    let mut config = RelayConfig::default();
    config.input_labels.insert("ch1".into(), "Kick".into());
    config.aux_labels.insert("aux4".into(), "IEM".into());
    let harness = start_relay_with(store, config, Arc::new(NullTransport)).await;

    let mut client = TestClient::connect(harness.port).await.unwrap();
    let dump = client.messages_until_quiet(QUIET).await;
    assert_eq!(
        matching(&dump, "/channel/ch1/label")[0].args,
        vec![OscType::String("Kick".into())]
    );
    assert_eq!(
        matching(&dump, "/channel/aux4/label")[0].args,
        vec![OscType::String("IEM".into())]
    );
}

#[tokio::test]
async fn test_mixer_change_reaches_every_client_once() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;
    let mut b = client(harness.port).await;

    harness.store.update_control("ch1", "gain", 0.2).unwrap();
    harness.store.update_control("ch1", "gain", 0.6).unwrap();

    for client in [&mut a, &mut b] {
        let messages = client.messages_until_quiet(QUIET).await;
        let gains: Vec<f64> = matching(&messages, "/channel/ch1/gain")
            .into_iter()
            .filter_map(|m| float_arg(m))
            .collect();
        assert_eq!(gains.len(), 2);
        assert!((gains[1] - 0.6).abs() < 1e-6);
        assert_eq!(gains.iter().filter(|g| (**g - 0.6).abs() < 1e-6).count(), 1);
    }
}

#[tokio::test]
async fn test_client_write_updates_store_and_other_clients() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;
    let mut b = client(harness.port).await;

    a.send_float("/channel/ch2/mute", 1.0).await.unwrap();

    let store = harness.store.clone();
    assert!(
        wait_for(
            || {
                let store = store.clone();
                async move { store.get_control("ch2", "mute").unwrap() == 1.0 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );
    let echo = b
        .wait_for_message("/channel/ch2/mute", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(float_arg(&echo), Some(1.0));
}

#[tokio::test]
async fn test_out_of_range_write_is_clamped() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;

    a.send_float("/channel/ch1/pan", 1.5).await.unwrap();
    let echo = a
        .wait_for_message("/channel/ch1/pan", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(float_arg(&echo), Some(1.0));
    assert_eq!(harness.store.get_control("ch1", "pan").unwrap(), 1.0);
}

#[tokio::test]
async fn test_unknown_addresses_are_ignored() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;

    a.send_float("/nothing/here", 1.0).await.unwrap();
    a.send_float("/channel/fx0/mute", 1.0).await.unwrap();
    a.send_float("/channel/masters/talkback", 1.0).await.unwrap();
    a.send_float("/channel/ch1/solo", 1.0).await.unwrap();

    // handled in order, so the last one landing means the others were seen
    let solo = a
        .wait_for_message("/channel/ch1/solo", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(float_arg(&solo), Some(1.0));
    assert_eq!(harness.store.get_control("masters", "talkback").unwrap(), 0.0);
    assert!(a.messages_until_quiet(QUIET).await.is_empty());
    assert_eq!(harness.relay.connection_count(), 1);
}

#[tokio::test]
async fn test_inbound_bundle_is_flattened() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;

    let bundle = OscPacket::Bundle(OscBundle {
        timetag: OscTime {
            seconds: 0,
            fractional: 1,
        },
        content: vec![
            OscPacket::Message(OscMessage {
                addr: "/channel/ch3/aux1".into(),
                args: vec![OscType::Float(0.25)],
            }),
            OscPacket::Bundle(OscBundle {
                timetag: OscTime {
                    seconds: 0,
                    fractional: 1,
                },
                content: vec![OscPacket::Message(OscMessage {
                    addr: "/channel/ch3/aux2".into(),
                    args: vec![OscType::Int(1)],
                })],
            }),
        ],
    });
    a.send(&bundle).await.unwrap();

    a.wait_for_message("/channel/ch3/aux2", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(harness.store.get_control("ch3", "aux1").unwrap(), 0.25);
    assert_eq!(harness.store.get_control("ch3", "aux2").unwrap(), 1.0);
}

#[tokio::test]
async fn test_level_update_is_one_bundle() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;

    harness.store.set_level("ch1", Level::Mono(128)).unwrap();
    harness.store.set_level("ch2", Level::Mono(64)).unwrap();
    harness.store.notify_levels();

    let packets = a.recv_until_quiet(QUIET).await;
    assert_eq!(packets.len(), 1);
    let OscPacket::Bundle(bundle) = &packets[0] else {
        panic!("meter update was not bundled");
    };
    let addrs: Vec<&str> = bundle
        .content
        .iter()
        .filter_map(|p| match p {
            OscPacket::Message(m) => Some(m.addr.as_str()),
            _ => None,
        })
        .collect();
    assert!(addrs.contains(&"/channel/ch1/level"));
    assert!(addrs.contains(&"/channel/ch1/peak"));
    assert!(addrs.contains(&"/channel/ch2/peak"));
    assert!(!addrs.contains(&"/channel/aux1/peak"));
}

#[tokio::test]
async fn test_panreset_and_geq_reset() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;
    harness.store.update_control("ch4", "pan", 0.1).unwrap();
    harness.store.update_control("geq0", "63Hz", 0.9).unwrap();
    a.messages_until_quiet(QUIET).await;

    a.send_float("/channel/ch4/panreset", 1.0).await.unwrap();
    a.send_float("/channel/geq0/reset", 1.0).await.unwrap();

    let band = a
        .wait_for_message("/channel/geq0/31", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(float_arg(&band), Some(0.5));
    assert_eq!(harness.store.get_control("ch4", "pan").unwrap(), 0.5);
    assert_eq!(harness.store.get_control("geq0", "63Hz").unwrap(), 0.5);
}

#[tokio::test]
async fn test_init_resends_state() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;

    a.send_message("/init", vec![]).await.unwrap();
    let dump = a.messages_until_quiet(QUIET).await;
    assert!(!matching(&dump, "/channel/fxb/mute").is_empty());
    assert!(!matching(&dump, "/channel/geq0/enable").is_empty());
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let store = Arc::new(ChannelStateStore::new(&DeviceProfile::studiolive_1602()));
    let config = RelayConfig {
        max_frame_size: 64,
        ..RelayConfig::default()
    };
    let harness = start_relay_with(store, config, Arc::new(NullTransport)).await;
    let mut a = client(harness.port).await;
    assert_eq!(harness.relay.connection_count(), 1);

    a.send_raw(&[0u8; 128]).await.unwrap();
    assert!(a.is_closed(DEFAULT_TIMEOUT).await);

    let relay = harness.relay.clone();
    assert!(
        wait_for(
            || {
                let relay = relay.clone();
                async move { relay.connection_count() == 0 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );
}

#[tokio::test]
async fn test_disconnect_unregisters_listeners() {
    let harness = start_relay().await;
    let a = client(harness.port).await;
    assert_eq!(harness.store.update_callback_count(), 1);
    assert_eq!(harness.store.level_callback_count(), 1);

    drop(a);
    let store = harness.store.clone();
    assert!(
        wait_for(
            || {
                let store = store.clone();
                async move { store.update_callback_count() == 0 && store.level_callback_count() == 0 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let harness = start_relay().await;
    let mut a = client(harness.port).await;
    let mut b = client(harness.port).await;
    assert_eq!(harness.relay.connection_count(), 2);

    harness.relay.shutdown();

    assert_eq!(harness.relay.connection_count(), 0);
    assert!(a.is_closed(DEFAULT_TIMEOUT).await);
    assert!(b.is_closed(DEFAULT_TIMEOUT).await);
}

#[derive(Default)]
struct RecordingTransport {
    recording: AtomicBool,
    callbacks: Mutex<Vec<StatusCallback>>,
}

impl RecordingTransport {
    fn changed(&self) {
        for callback in self.callbacks.lock().iter() {
            callback();
        }
    }
}

impl AudioTransport for RecordingTransport {
    fn play(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
    fn stop(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }
    fn record(&self, _path: &Path) -> io::Result<()> {
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn skip(&self, _seconds: f64) {}
    fn is_playing(&self) -> bool {
        false
    }
    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }
    fn on_status_change(&self, callback: StatusCallback) {
        self.callbacks.lock().push(callback);
    }
}

#[tokio::test]
async fn test_transport_feedback_to_every_client() {
    let store = Arc::new(ChannelStateStore::new(&DeviceProfile::studiolive_1602()));
    let recordings = std::env::temp_dir().join(format!("osclive-relay-{}", uuid::Uuid::new_v4()));
    let config = RelayConfig {
        recordings_dir: recordings.clone(),
        ..RelayConfig::default()
    };
    let transport = Arc::new(RecordingTransport::default());
    let harness = start_relay_with(store, config, transport.clone()).await;
    let mut a = client(harness.port).await;
    let mut b = client(harness.port).await;

    a.send_float("/transport/rec", 1.0).await.unwrap();
    let rec = b
        .wait_for_message("/transport/rec", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(rec.args, vec![OscType::String("Stop".into())]);
    assert!(transport.is_recording());
    let rec = a
        .wait_for_message("/transport/rec", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(rec.args, vec![OscType::String("Stop".into())]);

    // the recorder stopping on its own is reported too
    transport.recording.store(false, Ordering::SeqCst);
    transport.changed();
    let rec = a
        .wait_for_message("/transport/rec", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(rec.args, vec![OscType::String("Rec".into())]);
    let _ = std::fs::remove_dir_all(&recordings);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_with_simulated_mixer() {
    let profile = Arc::new(DeviceProfile::studiolive_1602());
    let mixer = SimulatedMixer::new(DeviceProfile::studiolive_1602());
    mixer.set_control("ch6", "aux3", 0.5);
    let store = Arc::new(ChannelStateStore::new(&profile));
    let backend = Arc::new(RawBackend::new(
        store.clone(),
        profile,
        Box::new(mixer.factory()),
        RawBackendConfig {
            poll_interval: Duration::from_millis(5),
            reconnect_delay: Duration::from_millis(10),
            max_connect_attempts: Some(3),
        },
    ));
    attach(&store, &backend);
    let starter = backend.clone();
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .unwrap()
        .unwrap();

    let harness = start_relay_with(store, RelayConfig::default(), Arc::new(NullTransport)).await;
    let mut a = TestClient::connect(harness.port).await.unwrap();
    let dump = a.messages_until_quiet(QUIET).await;
    let aux3 = float_arg(matching(&dump, "/channel/ch6/aux3")[0]).unwrap();
    assert!((aux3 - 0.5).abs() <= 1.0 / 255.0);

    // client write reaches the mixer
    a.send_float("/channel/ch3/mute", 1.0).await.unwrap();
    let sim = mixer.clone();
    assert!(
        wait_for(
            || {
                let sim = sim.clone();
                async move { sim.control("ch3", "mute") == 1.0 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );

    // change on the desk reaches the client
    mixer.set_control("ch5", "pan", 0.25);
    let pan = a
        .wait_for_message("/channel/ch5/pan", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert!((float_arg(&pan).unwrap() - 0.25).abs() <= 1.0 / 255.0);

    harness.relay.shutdown();
    tokio::task::spawn_blocking(move || backend.shutdown())
        .await
        .unwrap();
}
