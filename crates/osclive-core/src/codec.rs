//! SysEx framing and packed field codec
//!
//! Frame format used by the StudioLive on both the FireWire register link and MIDI:
//! ```text
//! ┌──────┬──────────────┬───────────────────────┬──────┐
//! │ 0xF0 │ command id   │ payload               │ 0xF7 │
//! └──────┴──────────────┴───────────────────────┴──────┘
//! ```
//! Payload values are stored as single flag bits, whole bytes, or 8-bit values split
//! over two bytes ("nibble pairs", high nibble first).

use crate::types::{ChannelDescriptor, ControlDescriptor, ValueKind};
use crate::{Error, Result, SYSEX_END, SYSEX_START, WRITE_ACK};

/// Decode a nibble pair
///
/// Bytes are not masked: stray high bits in a corrupt pair push the value out of range
/// instead of folding into a plausible one.
pub fn nibble_pair_decode(bytes: [u8; 2], kind: ValueKind) -> f64 {
    let value = (u32::from(bytes[0]) << 4 | u32::from(bytes[1])) as f64;
    if kind.is_normalized() {
        value / 255.0
    } else {
        value
    }
}

/// Encode a nibble pair, clamping to the byte range
pub fn nibble_pair_encode(value: f64, kind: ValueKind) -> [u8; 2] {
    let scaled = if kind.is_normalized() {
        value * 255.0
    } else {
        value
    };
    // `as` truncates toward zero and saturates, NaN becomes 0
    let v = (scaled as i64).clamp(0, 255) as u8;
    [(v >> 4) & 0x0F, v & 0x0F]
}

pub fn bit_get(buf: &[u8], byte: usize, bit: u8) -> bool {
    buf[byte] & (1 << bit) != 0
}

pub fn bit_set(buf: &mut [u8], byte: usize, bit: u8, value: bool) {
    if value {
        buf[byte] |= 1 << bit;
    } else {
        buf[byte] &= (1u8 << bit) ^ 0xFF;
    }
}

/// Build `F0 ‖ id ‖ payload ‖ F7`
pub fn sysex_frame(id: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(id.len() + payload.len() + 2);
    frame.push(SYSEX_START);
    frame.extend_from_slice(id);
    frame.extend_from_slice(payload);
    frame.push(SYSEX_END);
    frame
}

/// Pad a frame with end bytes up to a 4-byte boundary
pub fn pad_to_word(frame: &mut Vec<u8>) {
    let rem = frame.len() % 4;
    if rem != 0 {
        frame.extend(std::iter::repeat(SYSEX_END).take(4 - rem));
    }
}

/// Validate a read response and return its payload
///
/// `frame_len` counts the start byte, the echoed id, the payload and the end byte.
/// Trailing bytes past `frame_len` (word padding) are ignored.
pub fn parse_response<'a>(frame: &'a [u8], resp_id: &[u8], frame_len: usize) -> Result<&'a [u8]> {
    if frame.len() < frame_len {
        return Err(Error::ShortFrame {
            needed: frame_len,
            have: frame.len(),
        });
    }
    if frame[0] != SYSEX_START {
        return Err(Error::BadStartByte(frame[0]));
    }
    let id_end = 1 + resp_id.len();
    if &frame[1..id_end] != resp_id {
        return Err(Error::UnexpectedResponse {
            expected: resp_id.to_vec(),
            got: frame[1..id_end].to_vec(),
        });
    }
    if frame[frame_len - 1] != SYSEX_END {
        return Err(Error::MissingTerminator {
            position: frame_len - 1,
        });
    }
    Ok(&frame[id_end..frame_len - 1])
}

/// Whether a response is the write acknowledgement `F0 10 F7`
pub fn is_ack(frame: &[u8]) -> bool {
    frame.len() >= 3 && frame[0] == SYSEX_START && frame[1] == WRITE_ACK && frame[2] == SYSEX_END
}

/// Decode one control from a channel payload
///
/// Returns `None` for controls that do not live in the payload.
pub fn decode_control(desc: &ControlDescriptor, payload: &[u8], offset: usize) -> Option<f64> {
    let b = desc.byte()?.checked_sub(offset)?;
    if b + desc.width() > payload.len() {
        return None;
    }
    let value = match *desc {
        ControlDescriptor::NibblePair { kind, .. } => {
            nibble_pair_decode([payload[b], payload[b + 1]], kind)
        }
        ControlDescriptor::ShortInt { .. } => payload[b] as f64,
        ControlDescriptor::Bit { bit, .. } => {
            if bit_get(payload, b, bit) {
                1.0
            } else {
                0.0
            }
        }
        ControlDescriptor::Param { .. } => return None,
    };
    Some(value)
}

/// Encode one control into a channel payload in place
///
/// Bits are set for values of 0.5 and above. Returns false when the control does not
/// live in the payload.
pub fn encode_control(desc: &ControlDescriptor, payload: &mut [u8], offset: usize, value: f64) -> bool {
    let Some(b) = desc.byte().and_then(|b| b.checked_sub(offset)) else {
        return false;
    };
    if b + desc.width() > payload.len() {
        return false;
    }
    match *desc {
        ControlDescriptor::NibblePair { kind, .. } => {
            payload[b..b + 2].copy_from_slice(&nibble_pair_encode(value, kind));
        }
        ControlDescriptor::ShortInt { .. } => {
            payload[b] = (value as i64).clamp(0, 255) as u8;
        }
        ControlDescriptor::Bit { bit, .. } => bit_set(payload, b, bit, value >= 0.5),
        ControlDescriptor::Param { .. } => return false,
    }
    true
}

/// Decode every control of a channel from its payload, in table order
pub fn decode_channel<'a>(
    channel: &'a ChannelDescriptor,
    payload: &'a [u8],
) -> impl Iterator<Item = (&'a str, f64)> + 'a {
    channel.controls.iter().filter_map(move |(name, desc)| {
        decode_control(desc, payload, channel.offset).map(|v| (name.as_str(), v))
    })
}

/// Bytes of `new` that differ from `old` and are not covered by any control
pub fn unexplained_changes(channel: &ChannelDescriptor, old: &[u8], new: &[u8]) -> Vec<usize> {
    let covered = |i: usize| {
        channel.controls.iter().any(|(_, d)| {
            d.byte()
                .and_then(|b| b.checked_sub(channel.offset))
                .map(|b| i >= b && i < b + d.width())
                .unwrap_or(false)
        })
    };
    old.iter()
        .zip(new)
        .enumerate()
        .filter(|(i, (o, n))| o != n && !covered(*i))
        .map(|(i, _)| i)
        .collect()
}
