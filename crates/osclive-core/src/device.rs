//! StudioLive 16.0.2 mixer profiles
//!
//! Two profiles describe the same channel set: one addressed over the SysEx register
//! link (FireWire or MIDI), one over the Universal Control network protocol.

use std::sync::Arc;

use crate::types::{ChannelDescriptor, ChannelKind, ControlDescriptor as C};

/// Graphic EQ bands in frequency order
pub const EQ_FREQUENCIES: [&str; 31] = [
    "20Hz", "25Hz", "32Hz", "40Hz", "50Hz", "63Hz", "80Hz", "100Hz", "125Hz", "160Hz",
    "200Hz", "250Hz", "320Hz", "400Hz", "500Hz", "640Hz", "800Hz", "1.0kHz", "1.3kHz",
    "1.6kHz", "2.0kHz", "2.5kHz", "3.2kHz", "4.0kHz", "5.0kHz", "6.4kHz", "8.0kHz",
    "10kHz", "13kHz", "16kHz", "20kHz",
];

/// Status frame byte set when any fader moved
pub const STATUS_FADERS_MOVED: usize = 19;

/// Status frame byte holding the first meter level
pub const STATUS_LEVELS_START: usize = 22;

/// Universal Control message magic for the 16.0.2
pub const UC_MAGIC: [u32; 3] = [0x04ff_ffff, 0x000a_9204, 8];

/// Universal Control TCP port
pub const UC_PORT: u16 = 6969;

const INPUT_RAW: &[(&str, C)] = &[
    ("gain", C::gain(3)),
    ("pan", C::nibble(5)),
    ("linkedpan", C::nibble(7)),
    ("aux1", C::nibble(9)),
    ("aux2", C::nibble(11)),
    ("aux3", C::nibble(13)),
    ("aux4", C::nibble(15)),
    ("fxa", C::nibble(29)),
    ("fxb", C::nibble(31)),
    ("hpf", C::bit(107, 0)),
    ("hpffreq", C::nibble(45)),
    ("gate", C::bit(108, 3)),
    ("gatethresh", C::nibble(85)),
    ("phantom", C::bit(112, 0)),
    ("firewire", C::bit(112, 1)),
    ("phase", C::bit(112, 2)),
    ("post", C::bit(112, 3)),
    ("mute", C::bit(114, 0)),
    ("solo", C::bit(114, 1)),
    ("comp", C::bit(109, 1)),
    ("compauto", C::bit(109, 2)),
    ("complimit", C::bit(108, 0)),
    ("compthresh", C::nibble(71)),
    ("compratio", C::nibble(73)),
    ("compresponse", C::nibble(75)),
    ("compgain", C::nibble(79)),
    ("eqlow", C::bit(110, 1)),
    ("eqmid", C::bit(110, 3)),
    ("eqhigh", C::bit(109, 0)),
    ("eqlowshelf", C::bit(111, 0)),
    ("eqmidhiq", C::bit(111, 2)),
    ("eqhighshelf", C::bit(111, 3)),
    ("eqlowfreq", C::nibble(47)),
    ("eqmidfreq", C::nibble(51)),
    ("eqhighfreq", C::nibble(53)),
    ("eqlowgain", C::nibble(63)),
    ("eqmidgain", C::nibble(67)),
    ("eqhighgain", C::nibble(69)),
    ("toMain", C::bit(113, 3)),
];

const FX_RAW: &[(&str, C)] = &[
    ("fxtype", C::int(5)),
    ("param0", C::nibble(7)),
    ("param1", C::nibble(9)),
    ("param2", C::nibble(11)),
    ("param3", C::nibble(13)),
    ("param4", C::nibble(15)),
    ("param5", C::nibble(17)),
];

const MASTERS_RAW: &[(&str, C)] = &[
    ("monLevelMain", C::nibble(26)),
    ("monLevelPhones", C::nibble(36)),
    ("fxagain", C::gain(32)),
    ("fxbgain", C::gain(34)),
    ("monLevelSolo", C::nibble(28)),
    ("monMain", C::bit(47, 1)),
    ("monSolo", C::bit(47, 2)),
    ("monFirewire", C::bit(47, 3)),
    ("soloPFL", C::bit(46, 0)),
    ("talkback", C::bit(46, 3)),
    ("talkback->aux12", C::bit(45, 0)),
    ("talkback->aux34", C::bit(45, 1)),
    ("fxa->aux1", C::bit(52, 0)),
    ("fxa->aux2", C::bit(52, 1)),
    ("fxa->aux3", C::bit(52, 2)),
    ("fxa->aux4", C::bit(52, 3)),
    ("fxb->aux1", C::bit(50, 0)),
    ("fxb->aux2", C::bit(50, 1)),
    ("fxb->aux3", C::bit(51, 2)),
    ("fxb->aux4", C::bit(51, 3)),
];

const INPUT_UC: &[(&str, C)] = &[
    ("gain", C::param(0)),
    ("pan", C::param(1)),
    ("aux1", C::param(3)),
    ("aux2", C::param(4)),
    ("aux3", C::param(5)),
    ("aux4", C::param(6)),
    ("fxa", C::param(13)),
    ("fxb", C::param(14)),
    ("linkstereo", C::param(54)),
    ("phantom", C::param(60)),
    ("firewire", C::param(61)),
    ("phase", C::param(62)),
    ("hpf", C::param(80)),
    ("hpffreq", C::param(3021)),
    ("gatethresh", C::param(3041)),
    ("mute", C::param(3052)),
    ("solo", C::param(3053)),
    ("post", C::param(3063)),
    ("gate", C::param(3079)),
    ("compthresh", C::param(3034)),
    ("compratio", C::param(3035)),
    ("compresponse", C::param(3036)),
    ("compgain", C::param(3038)),
    ("comp", C::param(3073)),
    ("compauto", C::param(3074)),
    ("complimit", C::param(3076)),
    ("eqlowfreq", C::param(3022)),
    ("eqmidfreq", C::param(3024)),
    ("eqhighfreq", C::param(3025)),
    ("eqlowgain", C::param(3030)),
    ("eqmidgain", C::param(3032)),
    ("eqhighgain", C::param(3033)),
    ("eqlowshelf", C::param(3064)),
    ("eqmidhiq", C::param(3066)),
    ("eqhighshelf", C::param(3067)),
    ("eqlow", C::param(3069)),
    ("eqmid", C::param(3071)),
    ("eqhigh", C::param(3072)),
    ("toMain", C::param(3059)),
];

const MASTERS_UC: &[(&str, C)] = &[
    ("monLevelMain", C::param(12)),
    ("monLevelPhones", C::param(13)),
    ("fxagain", C::param(15)),
    ("fxbgain", C::param(16)),
    ("monLevelSolo", C::param(17)),
    ("monMain", C::param(29)),
    ("monSolo", C::param(30)),
    ("monFirewire", C::param(31)),
    ("soloPFL", C::param(32)),
    ("talkback", C::param(35)),
    ("talkback->aux12", C::param(36)),
    ("talkback->aux34", C::param(37)),
    ("fxa->aux1", C::param(72)),
    ("fxa->aux2", C::param(73)),
    ("fxa->aux3", C::param(74)),
    ("fxa->aux4", C::param(75)),
    ("fxb->aux1", C::param(78)),
    ("fxb->aux2", C::param(79)),
    ("fxb->aux3", C::param(80)),
    ("fxb->aux4", C::param(81)),
];

/// Universal Control connection details
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub port: u16,
    pub magic: [u32; 3],
}

/// Fixed channel set of one mixer model on one transport
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub name: &'static str,
    /// Public channels in canonical order
    channels: Vec<(String, Arc<ChannelDescriptor>)>,
    /// Status frame, raw link only
    pub status: Option<Arc<ChannelDescriptor>>,
    /// Faders frame, raw link only
    pub faders: Option<Arc<ChannelDescriptor>>,
    /// Set for the network transport
    pub network: Option<NetworkInfo>,
}

impl DeviceProfile {
    /// StudioLive 16.0.2 over the SysEx register link
    pub fn studiolive_1602() -> Self {
        let geq = geq_controls(|i| C::nibble(5 + 2 * i));
        let mut geq_raw: Vec<(&str, C)> = vec![("enable", C::bit(4, 0))];
        geq_raw.extend(geq);

        let mut channels = input_channels(|kind, n| ChannelDescriptor::build(kind, n, INPUT_RAW));
        channels.push((
            "geq0".into(),
            ChannelDescriptor::build(ChannelKind::Geq, 0, &geq_raw),
        ));
        channels.push(("fx0".into(), ChannelDescriptor::build(ChannelKind::Fx, 0, FX_RAW)));
        channels.push(("fx1".into(), ChannelDescriptor::build(ChannelKind::Fx, 1, FX_RAW)));
        channels.push((
            "masters".into(),
            ChannelDescriptor::build(ChannelKind::Masters, 0, MASTERS_RAW),
        ));

        Self {
            name: "StudioLive 16.0.2",
            channels: share(channels),
            status: Some(Arc::new(ChannelDescriptor::build(ChannelKind::Status, 0, &[]))),
            faders: Some(Arc::new(ChannelDescriptor::build(ChannelKind::Faders, 0, &[]))),
            network: None,
        }
    }

    /// StudioLive 16.0.2 through Universal Control
    pub fn studiolive_1602_network() -> Self {
        let geq = geq_controls(|i| C::param(i as u16 + 1));
        let mut geq_uc: Vec<(&str, C)> = vec![("enable", C::param(0))];
        geq_uc.extend(geq);

        let fx_uc: Vec<(String, C)> = (0..9)
            .map(|i| (format!("param{}", i), C::param(i)))
            .collect();
        let fx_uc: Vec<(&str, C)> = fx_uc.iter().map(|(n, c)| (n.as_str(), *c)).collect();

        let mut channels = input_channels(|kind, n| {
            ChannelDescriptor::keyed(kind, &format!("in{},0", n), INPUT_UC)
        });
        channels.push((
            "geq0".into(),
            ChannelDescriptor::keyed(ChannelKind::Geq, "geq0", &geq_uc),
        ));
        channels.push(("fx0".into(), ChannelDescriptor::keyed(ChannelKind::Fx, "fx a", &fx_uc)));
        channels.push(("fx1".into(), ChannelDescriptor::keyed(ChannelKind::Fx, "fx b", &fx_uc)));
        channels.push((
            "masters".into(),
            ChannelDescriptor::keyed(ChannelKind::Masters, "masters", MASTERS_UC),
        ));

        Self {
            name: "StudioLive 16.0.2",
            channels: share(channels),
            status: None,
            faders: None,
            network: Some(NetworkInfo {
                port: UC_PORT,
                magic: UC_MAGIC,
            }),
        }
    }

    /// Build a profile from an explicit channel list
    pub fn custom(name: &'static str, channels: Vec<(String, ChannelDescriptor)>) -> Self {
        Self {
            name,
            channels: share(channels),
            status: None,
            faders: None,
            network: None,
        }
    }

    pub fn channels(&self) -> &[(String, Arc<ChannelDescriptor>)] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&Arc<ChannelDescriptor>> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    /// Find a channel by its network key
    pub fn channel_by_key(&self, key: &str) -> Option<(&str, &Arc<ChannelDescriptor>)> {
        self.channels
            .iter()
            .find(|(_, d)| matches!(&d.index, crate::ChannelIndex::Key(k) if k == key))
            .map(|(n, d)| (n.as_str(), d))
    }
}

/// ch1..ch12 (9..12 stereo), aux1..aux4, main, fxa, fxb with indices 0..18
fn input_channels<F>(build: F) -> Vec<(String, ChannelDescriptor)>
where
    F: Fn(ChannelKind, u8) -> ChannelDescriptor,
{
    let mut channels = Vec::new();
    for i in 0..12u8 {
        let kind = ChannelKind::Input { stereo: i >= 8 };
        channels.push((format!("ch{}", i + 1), build(kind, i)));
    }
    for i in 0..4u8 {
        let kind = ChannelKind::Input { stereo: false };
        channels.push((format!("aux{}", i + 1), build(kind, 12 + i)));
    }
    for (i, name) in ["main", "fxa", "fxb"].iter().enumerate() {
        let kind = ChannelKind::Input { stereo: false };
        channels.push((name.to_string(), build(kind, 16 + i as u8)));
    }
    channels
}

fn geq_controls<F>(desc: F) -> Vec<(&'static str, C)>
where
    F: Fn(usize) -> C,
{
    EQ_FREQUENCIES
        .iter()
        .enumerate()
        .map(|(i, f)| (*f, desc(i)))
        .collect()
}

fn share(channels: Vec<(String, ChannelDescriptor)>) -> Vec<(String, Arc<ChannelDescriptor>)> {
    channels
        .into_iter()
        .map(|(n, d)| (n, Arc::new(d)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_1602_channel_set() {
        let p = DeviceProfile::studiolive_1602();
        let names: Vec<&str> = p.channels().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names.len(), 23);
        assert_eq!(names[0], "ch1");
        assert_eq!(names[18], "fxb");
        assert_eq!(&names[19..], &["geq0", "fx0", "fx1", "masters"]);
    }

    #[test]
    fn test_level_block_fits_status_frame() {
        let p = DeviceProfile::studiolive_1602();
        let levels: usize = p.channels().iter().map(|(_, d)| d.kind.level_count()).sum();
        assert_eq!(levels, 23);
        let status = p.status.unwrap();
        assert!(STATUS_LEVELS_START + levels < status.frame_len());
    }

    #[test]
    fn test_controls_fit_payload() {
        let p = DeviceProfile::studiolive_1602();
        for (name, ch) in p.channels() {
            for (ctrl, d) in &ch.controls {
                let b = d.byte().unwrap() - ch.offset;
                assert!(b + d.width() <= ch.length, "{}/{} out of range", name, ctrl);
            }
        }
    }

    #[test]
    fn test_network_keys() {
        let p = DeviceProfile::studiolive_1602_network();
        let (name, _) = p.channel_by_key("in16,0").unwrap();
        assert_eq!(name, "main");
        let (name, _) = p.channel_by_key("fx b").unwrap();
        assert_eq!(name, "fx1");
    }
}
