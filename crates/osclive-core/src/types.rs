//! Channel and control descriptors
//!
//! A [`ChannelDescriptor`] tells the backend how to address one mixer channel on the
//! wire: which SysEx command reads it, which id the mixer echoes in the response, which
//! command writes it back and where each named control lives inside the payload.

use std::fmt;

/// Interpretation of an 8-bit nibble-pair value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// 0..255 normalized to 0.0..1.0
    Float,
    /// Like `Float`, used for fader and gain positions
    Gain,
    /// Raw integer, not normalized
    Int,
}

impl ValueKind {
    /// Whether values of this kind are scaled by 1/255
    pub fn is_normalized(self) -> bool {
        matches!(self, ValueKind::Float | ValueKind::Gain)
    }
}

/// Location and encoding of one named control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDescriptor {
    /// Single flag bit
    Bit { byte: usize, bit: u8 },
    /// 8-bit value split across two bytes, high nibble first
    NibblePair { byte: usize, kind: ValueKind },
    /// One whole byte
    ShortInt { byte: usize },
    /// Numeric control id of the Universal Control protocol
    Param { id: u16 },
}

impl ControlDescriptor {
    pub const fn bit(byte: usize, bit: u8) -> Self {
        ControlDescriptor::Bit { byte, bit }
    }

    pub const fn nibble(byte: usize) -> Self {
        ControlDescriptor::NibblePair {
            byte,
            kind: ValueKind::Float,
        }
    }

    pub const fn gain(byte: usize) -> Self {
        ControlDescriptor::NibblePair {
            byte,
            kind: ValueKind::Gain,
        }
    }

    pub const fn int(byte: usize) -> Self {
        ControlDescriptor::NibblePair {
            byte,
            kind: ValueKind::Int,
        }
    }

    pub const fn param(id: u16) -> Self {
        ControlDescriptor::Param { id }
    }

    /// Frame position of the first byte, if the control lives in a SysEx frame
    pub fn byte(&self) -> Option<usize> {
        match *self {
            ControlDescriptor::Bit { byte, .. }
            | ControlDescriptor::NibblePair { byte, .. }
            | ControlDescriptor::ShortInt { byte } => Some(byte),
            ControlDescriptor::Param { .. } => None,
        }
    }

    /// Number of payload bytes the control occupies
    pub fn width(&self) -> usize {
        match self {
            ControlDescriptor::NibblePair { .. } => 2,
            ControlDescriptor::Bit { .. } | ControlDescriptor::ShortInt { .. } => 1,
            ControlDescriptor::Param { .. } => 0,
        }
    }
}

/// One byte of a static command template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateByte {
    /// Literal command byte
    Byte(u8),
    /// Replaced by the channel index when the descriptor is built
    Index,
}

/// Substitute the channel index into a command template
pub fn expand_template(template: &[TemplateByte], index: u8) -> Vec<u8> {
    template
        .iter()
        .map(|b| match *b {
            TemplateByte::Byte(v) => v,
            TemplateByte::Index => index,
        })
        .collect()
}

use TemplateByte::{Byte, Index};

const INPUT_READ: &[TemplateByte] = &[Byte(0x6b), Index];
const GEQ_READ: &[TemplateByte] = &[Byte(0x6d), Byte(0x01), Index];
const FX_READ: &[TemplateByte] = &[Byte(0x6d), Byte(0x03), Index];
const MASTERS_READ: &[TemplateByte] = &[Byte(0x60)];
const STATUS_READ: &[TemplateByte] = &[Byte(0x38), Byte(0x03)];
const FADERS_READ: &[TemplateByte] = &[Byte(0x6e)];

/// Channel class
///
/// Every class-dependent decision of the raw link goes through one `match` on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Input strip, also used for aux, main and fx returns
    Input { stereo: bool },
    /// Graphic EQ
    Geq,
    /// Effect processor
    Fx,
    /// Monitor, talkback and fx routing section
    Masters,
    /// Change bitmap and meter levels
    Status,
    /// Bulk fader positions
    Faders,
}

impl ChannelKind {
    /// Read command template
    pub fn read_template(self) -> &'static [TemplateByte] {
        match self {
            ChannelKind::Input { .. } => INPUT_READ,
            ChannelKind::Geq => GEQ_READ,
            ChannelKind::Fx => FX_READ,
            ChannelKind::Masters => MASTERS_READ,
            ChannelKind::Status => STATUS_READ,
            ChannelKind::Faders => FADERS_READ,
        }
    }

    /// Id the mixer echoes after the start byte of a read response
    pub fn resp_id(self) -> &'static [u8] {
        match self {
            ChannelKind::Input { .. } => &[0x6b],
            ChannelKind::Geq | ChannelKind::Fx => &[0x6c],
            ChannelKind::Masters => &[0x60],
            ChannelKind::Status => &[0x39],
            ChannelKind::Faders => &[0x6e],
        }
    }

    /// Write command id, empty for read-only frames
    pub fn write_id(self) -> &'static [u8] {
        match self {
            ChannelKind::Input { .. } => &[0x6a],
            ChannelKind::Geq | ChannelKind::Fx => &[0x6c],
            ChannelKind::Masters => &[0x6f],
            ChannelKind::Status | ChannelKind::Faders => &[],
        }
    }

    /// Total response frame length, start and end bytes included
    pub fn frame_len(self) -> usize {
        match self {
            ChannelKind::Input { .. } => 124,
            ChannelKind::Geq => 69,
            ChannelKind::Fx => 20,
            ChannelKind::Masters => 60,
            ChannelKind::Status => 47,
            ChannelKind::Faders => 0x0b * 4,
        }
    }

    /// Frame byte carrying the change bits of this channel group
    pub fn status_group(self) -> Option<usize> {
        match self {
            ChannelKind::Input { .. } => Some(14),
            ChannelKind::Fx => Some(15),
            ChannelKind::Geq => Some(17),
            ChannelKind::Masters => Some(18),
            ChannelKind::Status | ChannelKind::Faders => None,
        }
    }

    /// Meter entries this channel takes in the level block
    pub fn level_count(self) -> usize {
        match self {
            ChannelKind::Input { stereo: true } => 2,
            ChannelKind::Input { stereo: false } => 1,
            _ => 0,
        }
    }

    pub fn is_input(self) -> bool {
        matches!(self, ChannelKind::Input { .. })
    }
}

/// Channel identity on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelIndex {
    /// Index substituted into raw-link commands
    Number(u8),
    /// Channel key of the Universal Control protocol
    Key(String),
}

impl fmt::Display for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelIndex::Number(n) => write!(f, "{}", n),
            ChannelIndex::Key(k) => f.write_str(k),
        }
    }
}

/// Immutable per-channel wire description
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub index: ChannelIndex,
    pub kind: ChannelKind,
    /// Controls in table order
    pub controls: Vec<(String, ControlDescriptor)>,
    /// Payload length in bytes
    pub length: usize,
    /// Frame position of the first payload byte
    pub offset: usize,
    pub read_id: Vec<u8>,
    pub resp_id: Vec<u8>,
    pub write_id: Vec<u8>,
}

impl ChannelDescriptor {
    /// Build a raw-link descriptor, substituting `index` into the command templates
    pub fn build(kind: ChannelKind, index: u8, controls: &[(&str, ControlDescriptor)]) -> Self {
        let resp_id = kind.resp_id().to_vec();
        let offset = 1 + resp_id.len();
        Self {
            index: ChannelIndex::Number(index),
            kind,
            controls: own_controls(controls),
            length: kind.frame_len() - offset - 1,
            offset,
            read_id: expand_template(kind.read_template(), index),
            resp_id,
            write_id: kind.write_id().to_vec(),
        }
    }

    /// Build a network descriptor addressed by key, with no frame geometry
    pub fn keyed(kind: ChannelKind, key: &str, controls: &[(&str, ControlDescriptor)]) -> Self {
        Self {
            index: ChannelIndex::Key(key.to_string()),
            kind,
            controls: own_controls(controls),
            length: 0,
            offset: 0,
            read_id: Vec::new(),
            resp_id: Vec::new(),
            write_id: Vec::new(),
        }
    }

    /// Look up a control by name
    pub fn control(&self, name: &str) -> Option<&ControlDescriptor> {
        self.controls
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    /// Look up a control name by its Universal Control id
    pub fn control_by_param(&self, id: u16) -> Option<&str> {
        self.controls.iter().find_map(|(n, d)| match d {
            ControlDescriptor::Param { id: p } if *p == id => Some(n.as_str()),
            _ => None,
        })
    }

    pub fn control_names(&self) -> impl Iterator<Item = &str> {
        self.controls.iter().map(|(n, _)| n.as_str())
    }

    /// Complete response frame length
    pub fn frame_len(&self) -> usize {
        self.offset + self.length + 1
    }

    pub fn is_writable(&self) -> bool {
        !self.write_id.is_empty()
    }
}

fn own_controls(controls: &[(&str, ControlDescriptor)]) -> Vec<(String, ControlDescriptor)> {
    controls
        .iter()
        .map(|(n, d)| (n.to_string(), *d))
        .collect()
}

/// Meter reading of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Mono(u8),
    Stereo(u8, u8),
}

impl Level {
    /// Left (or only) reading
    pub fn first(&self) -> u8 {
        match *self {
            Level::Mono(v) | Level::Stereo(v, _) => v,
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::Mono(0)
    }
}
