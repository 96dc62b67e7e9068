//! Minimal IPv4 header parsing, just what routing needs

use crate::error::EngineError;
use std::net::Ipv4Addr;

const MIN_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(frame: &[u8]) -> Result<Self, EngineError> {
        if frame.len() < MIN_HEADER_LEN {
            return Err(EngineError::Parse(format!("frame of {} bytes is too short", frame.len())));
        }
        let version = frame[0] >> 4;
        if version != 4 {
            return Err(EngineError::Parse(format!("not an IPv4 frame (version {})", version)));
        }
        let header_len = usize::from(frame[0] & 0x0f) * 4;
        if header_len < MIN_HEADER_LEN || header_len > frame.len() {
            return Err(EngineError::Parse(format!("bad header length {}", header_len)));
        }

        Ok(Self {
            header_len,
            total_len: usize::from(u16::from_be_bytes([frame[2], frame[3]])),
            protocol: frame[9],
            src: Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]),
            dst: Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]),
        })
    }
}

/// A bare IPv4 packet from `src` to `dst` carrying `payload`
#[cfg(test)]
pub(crate) fn packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = (MIN_HEADER_LEN + payload.len()) as u16;
    let mut frame = vec![0u8; MIN_HEADER_LEN];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&total.to_be_bytes());
    frame[8] = 64;
    frame[9] = 17;
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    frame.extend_from_slice(payload);
    frame
}
