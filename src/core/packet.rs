//! Transport packet: the unit a stream transport frames and ships.
//!
//! ```text
//! [Magic(4)] [Version(1)] [Length(4)] [Payload(N)]
//! ```
//! The payload is the translator-chain output for one frame.

use crate::config::{MAGIC_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};

/// Size of the fixed packet header
pub const HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&MAGIC_BYTES);
        out.push(self.version);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse the fixed header, returning (version, payload length)
    pub fn parse_header(data: &[u8]) -> Result<(u8, usize)> {
        if data.len() < HEADER_SIZE || data[..4] != MAGIC_BYTES {
            return Err(ProtocolError::InvalidHeader);
        }
        let version = data[4];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPacket(len));
        }
        Ok((version, len))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (version, len) = Self::parse_header(data)?;
        let payload = data
            .get(HEADER_SIZE..HEADER_SIZE + len)
            .ok_or(ProtocolError::InvalidHeader)?;
        Ok(Self {
            version,
            payload: payload.to_vec(),
        })
    }
}
