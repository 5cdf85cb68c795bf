//! # Frame Envelope
//!
//! The unit a connection hands to its translator chain. Encoded with bincode.
//!
//! ```text
//! Frame { id, channel, certified, sequence, floor, origin, kind }
//!   kind: Hello { peer_id, types } | Ack { ids } | Message { tag, body }
//!       | Skip | KeepAlive | Disconnect
//! ```
//!
//! `sequence` counts certified messages per channel and is zero for anything
//! else. `floor` is the lowest sequence on the channel the sender may still
//! deliver; everything below it was acknowledged or abandoned, so a receiver
//! never waits for it. A `Skip` frame carries only a floor and is sent when a
//! certified message is abandoned. `tag` in a message frame is the sender's type tag; receivers map it
//! through the table exchanged in `Hello`.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Identifier of a message, unique among a connection's outstanding messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u32);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Hello { peer_id: u16, types: Vec<(u16, String)> },
    Ack { ids: Vec<MessageId> },
    Message { tag: u16, body: Vec<u8> },
    Skip,
    KeepAlive,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: MessageId,
    pub channel: u8,
    pub certified: bool,
    pub sequence: u32,
    pub floor: u32,
    /// Peer the message originally came from, when relayed
    pub origin: Option<u16>,
    pub kind: FrameKind,
}

impl Frame {
    /// An uncertified control frame
    pub fn control(kind: FrameKind) -> Self {
        Self {
            id: MessageId(0),
            channel: 0,
            certified: false,
            sequence: 0,
            floor: 0,
            origin: None,
            kind,
        }
    }

    /// Tells the receiver to stop waiting for sequences below `floor`
    pub fn skip(channel: u8, floor: u32) -> Self {
        Self {
            channel,
            floor,
            ..Self::control(FrameKind::Skip)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            FrameKind::Hello { .. } => "hello",
            FrameKind::Ack { .. } => "ack",
            FrameKind::Message { .. } => "message",
            FrameKind::Skip => "skip",
            FrameKind::KeepAlive => "keepalive",
            FrameKind::Disconnect => "disconnect",
        }
    }
}
