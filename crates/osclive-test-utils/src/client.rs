//! OSC client speaking the relay's length-framed TCP

use bytes::{Buf, BufMut, BytesMut};
use rosc::{OscMessage, OscPacket, OscType};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Test client connected to a relay
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        })
    }

    /// Send one framed packet
    pub async fn send(&mut self, packet: &OscPacket) -> std::io::Result<()> {
        let encoded = rosc::encoder::encode(packet)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{:?}", e)))?;
        self.send_raw(&encoded).await
    }

    /// Send an arbitrary frame body
    pub async fn send_raw(&mut self, body: &[u8]) -> std::io::Result<()> {
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(body);
        self.stream.write_all(&frame).await
    }

    pub async fn send_message(&mut self, addr: &str, args: Vec<OscType>) -> std::io::Result<()> {
        self.send(&OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        }))
        .await
    }

    pub async fn send_float(&mut self, addr: &str, value: f32) -> std::io::Result<()> {
        self.send_message(addr, vec![OscType::Float(value)]).await
    }

    /// Next frame, `None` on timeout or when the relay closed the connection
    pub async fn recv(&mut self, wait: Duration) -> Option<OscPacket> {
        timeout(wait, self.read_frame()).await.ok().flatten()
    }

    async fn read_frame(&mut self) -> Option<OscPacket> {
        loop {
            if self.buf.len() >= 4 {
                let len = (&self.buf[..4]).get_u32() as usize;
                if self.buf.len() >= 4 + len {
                    self.buf.advance(4);
                    let body = self.buf.split_to(len);
                    return rosc::decoder::decode_udp(&body).ok().map(|(_, p)| p);
                }
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Every frame until nothing arrives for `quiet`
    pub async fn recv_until_quiet(&mut self, quiet: Duration) -> Vec<OscPacket> {
        let mut packets = Vec::new();
        while let Some(packet) = self.recv(quiet).await {
            packets.push(packet);
        }
        packets
    }

    /// Like [`recv_until_quiet`](Self::recv_until_quiet), with bundles flattened
    pub async fn messages_until_quiet(&mut self, quiet: Duration) -> Vec<OscMessage> {
        let mut messages = Vec::new();
        for packet in self.recv_until_quiet(quiet).await {
            flatten(packet, &mut messages);
        }
        messages
    }

    /// Read until a message with `addr` arrives
    pub async fn wait_for_message(&mut self, addr: &str, wait: Duration) -> Option<OscMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let packet = self.recv(remaining).await?;
            let mut messages = Vec::new();
            flatten(packet, &mut messages);
            if let Some(m) = messages.into_iter().find(|m| m.addr == addr) {
                return Some(m);
            }
        }
    }

    /// Whether the relay closed the connection within `wait`
    pub async fn is_closed(&mut self, wait: Duration) -> bool {
        let mut scratch = [0u8; 256];
        loop {
            match timeout(wait, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Append every message of a packet, recursing into bundles
pub fn flatten(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(m) => out.push(m),
        OscPacket::Bundle(b) => {
            for p in b.content {
                flatten(p, out);
            }
        }
    }
}

/// First argument as f64, for any numeric OSC type
pub fn float_arg(message: &OscMessage) -> Option<f64> {
    match message.args.first()? {
        OscType::Float(f) => Some(*f as f64),
        OscType::Double(d) => Some(*d),
        OscType::Int(i) => Some(*i as f64),
        OscType::Long(l) => Some(*l as f64),
        _ => None,
    }
}
