//! Raw backend tests against the simulated mixer

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use osclive_backend::{attach, Backend, BackendError, LinkState, RawBackend, RawBackendConfig};
use osclive_core::codec::decode_control;
use osclive_core::{ChannelStateStore, DeviceProfile, Level};
use osclive_test_utils::{wait_until, SimulatedMixer, DEFAULT_TIMEOUT, ROUTE_CHANNEL};

struct Rig {
    mixer: SimulatedMixer,
    store: Arc<ChannelStateStore>,
    backend: Arc<RawBackend>,
}

fn rig_with(config: RawBackendConfig) -> Rig {
    let profile = Arc::new(DeviceProfile::studiolive_1602());
    let mixer = SimulatedMixer::new(DeviceProfile::studiolive_1602());
    let store = Arc::new(ChannelStateStore::new(&profile));
    let backend = Arc::new(RawBackend::new(
        store.clone(),
        profile,
        Box::new(mixer.factory()),
        config,
    ));
    attach(&store, &backend);
    Rig {
        mixer,
        store,
        backend,
    }
}

/// Backend connected without the poll thread; tests drive `poll_once` themselves
fn synced_rig() -> Rig {
    let rig = rig_with(fast_config());
    rig.backend.connect().unwrap();
    rig
}

fn fast_config() -> RawBackendConfig {
    RawBackendConfig {
        poll_interval: Duration::from_millis(5),
        reconnect_delay: Duration::from_millis(10),
        max_connect_attempts: Some(3),
    }
}

fn assert_store_matches_mixer(rig: &Rig) {
    for name in rig.store.channel_names() {
        let desc = rig.store.descriptor(name).unwrap();
        let payload = rig.mixer.payload(name);
        for (control, ctrl) in &desc.controls {
            let expected = decode_control(ctrl, &payload, desc.offset).unwrap().clamp(0.0, 1.0);
            let got = rig.store.get_control(name, control).unwrap();
            assert_eq!(got, expected, "{}/{}", name, control);
        }
        assert_eq!(rig.store.raw(name).unwrap(), payload, "{} raw", name);
    }
}

#[test]
fn test_cold_start_reads_every_channel() {
    let rig = rig_with(RawBackendConfig::default());
    rig.mixer.set_control("ch3", "mute", 1.0);
    rig.mixer.set_control("geq0", "1.0kHz", 0.8);

    rig.backend.start().unwrap();
    assert_eq!(rig.backend.state(), LinkState::Polling);
    rig.backend.shutdown();
    assert_eq!(rig.backend.state(), LinkState::Stopped);

    for name in rig.store.channel_names() {
        assert!(rig.mixer.read_count(name) >= 1, "{} never read", name);
    }
    assert_eq!(rig.store.get_control("ch3", "mute").unwrap(), 1.0);
    assert_store_matches_mixer(&rig);
}

#[test]
fn test_poll_rereads_only_flagged_channels() {
    let rig = synced_rig();
    rig.mixer.reset_counters();
    rig.mixer.set_control("ch5", "pan", 0.25);

    rig.backend.poll_once().unwrap();

    assert_eq!(rig.mixer.read_count("status"), 1);
    assert_eq!(rig.mixer.read_count("ch5"), 1);
    assert_eq!(rig.mixer.read_count("faders"), 0);
    assert_eq!(rig.mixer.total_reads(), 2);
    assert_eq!(
        rig.store.get_control("ch5", "pan").unwrap(),
        rig.mixer.control("ch5", "pan")
    );

    // change bits are cleared once reported
    rig.backend.poll_once().unwrap();
    assert_eq!(rig.mixer.read_count("ch5"), 1);
}

#[test]
fn test_status_groups_cover_every_kind() {
    let rig = synced_rig();
    rig.mixer.reset_counters();
    rig.mixer.set_control("fxb", "mute", 1.0);
    rig.mixer.set_control("fx1", "param2", 0.5);
    rig.mixer.set_control("geq0", "enable", 1.0);
    rig.mixer.set_control("masters", "talkback", 1.0);

    rig.backend.poll_once().unwrap();

    for name in ["fxb", "fx1", "geq0", "masters"] {
        assert_eq!(rig.mixer.read_count(name), 1, "{}", name);
    }
    assert_eq!(rig.mixer.total_reads(), 5);
    assert_eq!(rig.store.get_control("masters", "talkback").unwrap(), 1.0);
    assert_eq!(rig.store.get_control("fxb", "mute").unwrap(), 1.0);
}

#[test]
fn test_faders_flag_reads_faders_once() {
    let rig = synced_rig();
    rig.mixer.reset_counters();
    rig.mixer.move_fader("ch2", 0.6);
    rig.mixer.move_fader("main", 0.9);

    rig.backend.poll_once().unwrap();

    assert_eq!(rig.mixer.read_count("faders"), 1);
    assert_eq!(rig.mixer.read_count("ch2"), 0);
    let ch2 = rig.store.get_control("ch2", "gain").unwrap();
    let main = rig.store.get_control("main", "gain").unwrap();
    assert!((ch2 - 0.6).abs() <= 1.0 / 255.0);
    assert!((main - 0.9).abs() <= 1.0 / 255.0);
}

#[test]
fn test_levels_follow_channel_order() {
    let rig = synced_rig();
    let fired = Arc::new(Mutex::new(0));
    let counter = fired.clone();
    rig.store.add_level_callback(move || *counter.lock() += 1);

    let levels: Vec<u8> = (1..=23).collect();
    rig.mixer.set_levels(&levels);
    rig.backend.poll_once().unwrap();

    assert_eq!(*fired.lock(), 1);
    assert_eq!(rig.store.get_level("ch1", false).unwrap(), Level::Mono(1));
    assert_eq!(rig.store.get_level("ch8", false).unwrap(), Level::Mono(8));
    assert_eq!(rig.store.get_level("ch9", true).unwrap(), Level::Stereo(9, 10));
    assert_eq!(rig.store.get_level("ch12", true).unwrap(), Level::Stereo(15, 16));
    assert_eq!(rig.store.get_level("aux1", false).unwrap(), Level::Mono(17));
    assert_eq!(rig.store.get_level("main", false).unwrap(), Level::Mono(21));
    assert_eq!(rig.store.get_level("fxb", false).unwrap(), Level::Mono(23));
}

#[test]
fn test_client_write_sends_whole_frame() {
    let rig = synced_rig();
    rig.mixer.reset_counters();
    let before = rig.store.raw("ch4").unwrap();

    rig.store.set_control("ch4", "mute", 1.0).unwrap();

    let writes = rig.mixer.writes();
    assert_eq!(writes.len(), 1);
    let (channel, payload) = &writes[0];
    assert_eq!(channel, "ch4");
    assert_eq!(payload.len(), before.len());
    assert_eq!(payload, &rig.store.raw("ch4").unwrap());

    // only the mute byte differs from the previous shadow
    let changed: Vec<usize> = (0..before.len()).filter(|i| before[*i] != payload[*i]).collect();
    assert_eq!(changed, vec![114 - 2]);
    assert_eq!(rig.mixer.control("ch4", "mute"), 1.0);
}

#[test]
fn test_failed_write_keeps_optimistic_value() {
    let rig = synced_rig();
    rig.mixer.set_fail_writes(true);

    rig.store.set_control("ch1", "solo", 1.0).unwrap();

    assert_eq!(rig.store.get_control("ch1", "solo").unwrap(), 1.0);
    assert_eq!(rig.mixer.control("ch1", "solo"), 0.0);
    assert!(rig.mixer.writes().is_empty());
}

#[test]
fn test_write_without_link_is_dropped() {
    let rig = rig_with(fast_config());
    rig.store.set_control("ch2", "phase", 1.0).unwrap();
    assert_eq!(rig.store.get_control("ch2", "phase").unwrap(), 1.0);
    assert!(rig.mixer.writes().is_empty());
}

#[test]
fn test_geq_band_write() {
    let rig = synced_rig();
    rig.mixer.reset_counters();
    rig.store.set_control("geq0", "20Hz", 0.5).unwrap();
    let writes = rig.mixer.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, "geq0");
    assert!((rig.mixer.control("geq0", "20Hz") - 0.5).abs() <= 1.0 / 255.0);
}

#[test]
fn test_start_twice_rejected() {
    let rig = rig_with(fast_config());
    rig.backend.start().unwrap();
    assert!(matches!(rig.backend.start(), Err(BackendError::AlreadyRunning)));
    rig.backend.shutdown();
}

#[test]
fn test_bounded_start_gives_up() {
    let rig = rig_with(fast_config());
    rig.mixer.set_online(false);
    let err = rig.backend.start().unwrap_err();
    assert!(matches!(err, BackendError::ConnectionLost(_)));
    assert_eq!(rig.backend.state(), LinkState::Disconnected);
}

#[test]
fn test_reconnect_resyncs_after_outage() {
    let rig = rig_with(fast_config());
    rig.backend.start().unwrap();
    assert_eq!(rig.mixer.open_count(), 1);

    rig.mixer.set_online(false);
    assert!(wait_until(
        || rig.backend.state() == LinkState::Connecting,
        DEFAULT_TIMEOUT
    ));

    // changes made while the link was down never show up in the status frame
    rig.mixer.set_control_silently("aux2", "gain", 0.7);
    rig.mixer.set_control_silently("masters", "monMain", 1.0);
    rig.mixer.set_control_silently("ch3", "mute", 1.0);
    rig.mixer.set_online(true);

    assert!(wait_until(
        || rig.mixer.open_count() >= 2 && rig.backend.state() == LinkState::Polling,
        DEFAULT_TIMEOUT
    ));
    rig.backend.shutdown();

    assert_eq!(
        rig.store.get_control("aux2", "gain").unwrap(),
        rig.mixer.control("aux2", "gain")
    );
    assert_eq!(rig.store.get_control("masters", "monMain").unwrap(), 1.0);
    assert_eq!(rig.store.get_control("ch3", "mute").unwrap(), 1.0);
    assert_store_matches_mixer(&rig);
}

#[test]
fn test_unflagged_change_needs_full_read() {
    let rig = synced_rig();
    rig.mixer.set_control_silently("ch5", "mute", 1.0);
    rig.backend.poll_once().unwrap();
    assert_eq!(rig.store.get_control("ch5", "mute").unwrap(), 0.0);

    rig.backend.init_data().unwrap();
    assert_eq!(rig.store.get_control("ch5", "mute").unwrap(), 1.0);
}

#[test]
fn test_framing_error_triggers_reconnect() {
    let rig = rig_with(fast_config());
    rig.backend.start().unwrap();
    rig.mixer.corrupt_next_response();
    assert!(wait_until(|| rig.mixer.open_count() >= 2, DEFAULT_TIMEOUT));
    assert!(wait_until(
        || rig.backend.state() == LinkState::Polling,
        DEFAULT_TIMEOUT
    ));
    rig.backend.shutdown();
}

#[test]
fn test_route_source_sent_without_ack() {
    let rig = rig_with(fast_config());
    rig.backend.start().unwrap();
    rig.backend.shutdown();
    // shutdown dropped the adapter
    assert!(rig.backend.route_source_1516(true).is_err());

    let rig = rig_with(fast_config());
    rig.backend.start().unwrap();
    rig.backend.route_source_1516(false).unwrap();
    let routes: Vec<_> = rig
        .mixer
        .writes()
        .into_iter()
        .filter(|(c, _)| c == ROUTE_CHANNEL)
        .collect();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].1, vec![0x52, 0x13, 0x0e, 0x00, 0x0e, 0x00, 0x00]);
    rig.backend.shutdown();
}
