//! OSC address layout
//!
//! Which channels are exposed to clients, under which addresses, and what every
//! inbound address does.

use std::collections::{BTreeMap, HashMap};

use osclive_core::device::EQ_FREQUENCIES;
use osclive_core::ChannelStateStore;

use crate::transport::TransportCommand;

/// Graphic EQ channel exposed by band number
pub const GEQ_CHANNEL: &str = "geq0";

/// Channel whose control set is relayed for every channel
const TEMPLATE_CHANNEL: &str = "ch1";

/// What an inbound address does
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Write the message value to a control
    Control { channel: String, control: String },
    /// Center the pan of a channel
    PanReset { channel: String },
    /// Forget the peak of a channel and resend meters
    PeakReset { channel: String },
    /// Set every GEQ band to 0.5
    GeqReset,
    /// Resend the full state
    Init,
    Transport(TransportCommand),
}

/// Relayed channels and the address table, shared by every session of a server
#[derive(Debug, Clone)]
pub struct Layout {
    /// Relayed channels: inputs, auxes, fx returns, main
    pub channels: Vec<String>,
    /// Channels with meters
    pub inputs: Vec<String>,
    /// Controls relayed for every channel
    pub controls: Vec<String>,
    /// GEQ band controls in frequency order, empty without a GEQ
    pub geq_bands: Vec<String>,
    /// `(channel, label)` pairs sent with the state dump
    pub labels: Vec<(String, String)>,
    routes: HashMap<String, Route>,
}

fn numbered(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .map_or(false, |rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

fn is_fx_return(name: &str) -> bool {
    name.strip_prefix("fx")
        .map_or(false, |rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_lowercase()))
}

impl Layout {
    pub fn new(
        store: &ChannelStateStore,
        input_labels: &BTreeMap<String, String>,
        aux_labels: &BTreeMap<String, String>,
    ) -> Self {
        let names: Vec<&str> = store.channel_names().collect();
        let pick = |f: &dyn Fn(&str) -> bool| -> Vec<String> {
            names.iter().filter(|n| f(n)).map(|n| n.to_string()).collect()
        };
        let inputs = pick(&|n| numbered(n, "ch"));
        let auxs = pick(&|n| numbered(n, "aux"));
        let fxs = pick(&is_fx_return);

        let mut channels = inputs.clone();
        channels.extend(auxs);
        channels.extend(fxs);
        if names.contains(&"main") {
            channels.push("main".to_string());
        }

        let controls: Vec<String> = store
            .descriptor(TEMPLATE_CHANNEL)
            .map(|d| d.control_names().map(str::to_string).collect())
            .unwrap_or_default();

        let geq_bands: Vec<String> = store
            .descriptor(GEQ_CHANNEL)
            .map(|d| {
                EQ_FREQUENCIES
                    .iter()
                    .filter(|f| d.control(f).is_some())
                    .map(|f| f.to_string())
                    .collect()
            })
            .unwrap_or_default();

        let mut labels: Vec<(String, String)> = input_labels
            .iter()
            .chain(aux_labels.iter())
            .map(|(ch, label)| (ch.clone(), label.clone()))
            .collect();
        labels.push(("main".to_string(), "Main".to_string()));

        let mut routes = HashMap::new();
        for channel in &channels {
            for control in &controls {
                routes.insert(
                    format!("/channel/{}/{}", channel, control),
                    Route::Control {
                        channel: channel.clone(),
                        control: control.clone(),
                    },
                );
            }
            routes.insert(
                format!("/channel/{}/panreset", channel),
                Route::PanReset {
                    channel: channel.clone(),
                },
            );
            routes.insert(
                format!("/channel/{}/peak_reset", channel),
                Route::PeakReset {
                    channel: channel.clone(),
                },
            );
        }

        if store.descriptor(GEQ_CHANNEL).is_ok() {
            for (i, band) in geq_bands.iter().enumerate() {
                routes.insert(
                    format!("/channel/{}/{}", GEQ_CHANNEL, i + 1),
                    Route::Control {
                        channel: GEQ_CHANNEL.to_string(),
                        control: band.clone(),
                    },
                );
            }
            routes.insert(
                format!("/channel/{}/enable", GEQ_CHANNEL),
                Route::Control {
                    channel: GEQ_CHANNEL.to_string(),
                    control: "enable".to_string(),
                },
            );
            routes.insert(format!("/channel/{}/reset", GEQ_CHANNEL), Route::GeqReset);
        }

        routes.insert("/init".to_string(), Route::Init);
        for command in TransportCommand::ALL {
            routes.insert(command.address().to_string(), Route::Transport(command));
        }

        Self {
            channels,
            inputs,
            controls,
            geq_bands,
            labels,
            routes,
        }
    }

    /// Exact address lookup
    pub fn route(&self, addr: &str) -> Option<&Route> {
        self.routes.get(addr)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn is_relayed(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    /// 1-based band number of a GEQ control
    pub fn geq_band(&self, control: &str) -> Option<usize> {
        self.geq_bands.iter().position(|b| b == control).map(|i| i + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osclive_core::DeviceProfile;

    fn layout() -> Layout {
        let store = ChannelStateStore::new(&DeviceProfile::studiolive_1602());
        let mut inputs = BTreeMap::new();
        inputs.insert("ch1".to_string(), "Kick".to_string());
        let mut auxs = BTreeMap::new();
        auxs.insert("aux1".to_string(), "Wedge".to_string());
        Layout::new(&store, &inputs, &auxs)
    }

    #[test]
    fn test_relayed_channel_order() {
        let layout = layout();
        assert_eq!(layout.channels.len(), 12 + 4 + 2 + 1);
        assert_eq!(layout.channels[0], "ch1");
        assert_eq!(layout.channels[11], "ch12");
        assert_eq!(layout.channels[12], "aux1");
        assert_eq!(&layout.channels[16..], &["fxa", "fxb", "main"]);
        assert_eq!(layout.inputs.len(), 12);
        assert!(!layout.is_relayed("fx0"));
        assert!(!layout.is_relayed("masters"));
        assert!(!layout.is_relayed("geq0"));
    }

    #[test]
    fn test_routes() {
        let layout = layout();
        assert_eq!(
            layout.route("/channel/main/mute"),
            Some(&Route::Control {
                channel: "main".into(),
                control: "mute".into()
            })
        );
        assert_eq!(
            layout.route("/channel/geq0/1"),
            Some(&Route::Control {
                channel: "geq0".into(),
                control: "20Hz".into()
            })
        );
        assert_eq!(
            layout.route("/channel/geq0/31"),
            Some(&Route::Control {
                channel: "geq0".into(),
                control: "20kHz".into()
            })
        );
        assert_eq!(layout.route("/channel/geq0/reset"), Some(&Route::GeqReset));
        assert_eq!(
            layout.route("/channel/aux3/peak_reset"),
            Some(&Route::PeakReset {
                channel: "aux3".into()
            })
        );
        assert_eq!(
            layout.route("/transport/rec"),
            Some(&Route::Transport(TransportCommand::Record))
        );
        assert_eq!(layout.route("/init"), Some(&Route::Init));
        assert!(layout.route("/channel/geq0/32").is_none());
        assert!(layout.route("/channel/fx0/mute").is_none());
        assert!(layout.route("/channel/ch1/Mute").is_none());
    }

    #[test]
    fn test_labels_end_with_main() {
        let layout = layout();
        assert_eq!(
            layout.labels,
            vec![
                ("ch1".to_string(), "Kick".to_string()),
                ("aux1".to_string(), "Wedge".to_string()),
                ("main".to_string(), "Main".to_string()),
            ]
        );
        assert_eq!(layout.geq_band("1.0kHz"), Some(18));
        assert_eq!(layout.geq_band("enable"), None);
    }
}
