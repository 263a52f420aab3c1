//! Configuration file

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use osclive_core::DEFAULT_RELAY_PORT;

/// Service name announced when none is configured
pub const DEFAULT_NAME: &str = "OSCLive";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub relay: RelaySection,
    pub backend: BackendSection,
    pub labels: LabelsSection,
    pub transport: TransportSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub listen: String,
    /// Announced service name
    pub name: String,
    pub announce: bool,
    pub keepalive_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_RELAY_PORT),
            name: DEFAULT_NAME.to_string(),
            announce: true,
            keepalive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Firewire,
    #[default]
    Midi,
    Uc,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub mode: BackendMode,
    /// FireWire character device of the mixer
    pub firewire_device: String,
    /// Substring of the MIDI port names
    pub midi_port: String,
    /// Universal Control host, optionally `host:port`
    pub uc_host: String,
    pub poll_interval_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            mode: BackendMode::Midi,
            firewire_device: "/dev/fw1".to_string(),
            midi_port: "StudioLive".to_string(),
            uc_host: "127.0.0.1".to_string(),
            poll_interval_ms: 100,
            reconnect_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LabelsSection {
    pub input: BTreeMap<String, String>,
    pub aux: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub recordings_dir: PathBuf,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("recordings"),
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Split `host[:port]`
pub fn split_host_port(value: &str) -> Result<(String, Option<u16>)> {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in {}", value))?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((value.to_string(), None)),
    }
}
