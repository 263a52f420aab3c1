//! Stream framing
//!
//! Every OSC packet on the TCP stream is preceded by a 4-byte big-endian length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rosc::OscPacket;

use crate::error::{RelayError, Result};

/// Maximum frame body size (64KB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Prefix `body` with its length
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(body);
    frame.freeze()
}

/// Encode and frame an OSC packet
pub fn encode_packet(packet: &OscPacket) -> Result<Bytes> {
    let body = rosc::encoder::encode(packet)?;
    Ok(encode_frame(&body))
}

pub fn decode_packet(body: &[u8]) -> Result<OscPacket> {
    let (_, packet) = rosc::decoder::decode_udp(body)?;
    Ok(packet)
}

/// Incremental frame splitter for the read side of a connection
pub struct FrameDecoder {
    buf: BytesMut,
    max_size: usize,
}

impl FrameDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            max_size,
        }
    }

    /// Buffer to read into
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Next complete frame body, if buffered
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = (&self.buf[..4]).get_u32() as usize;
        if len > self.max_size {
            return Err(RelayError::FrameTooLarge {
                size: len,
                max: self.max_size,
            });
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}
