//! # Transports
//!
//! A [`Transport`] moves whole payloads between two peers. The connection
//! core is synchronous and polls it from `update()`, so every operation here
//! is non-blocking.
//!
//! - [`channel::ChannelTransport`]: in-memory pairs, and the synchronous side
//!   of every async transport
//! - [`tcp`]: TCP streams framed with [`PacketCodec`](crate::core::codec::PacketCodec)
//!   and pumped by tokio tasks

pub mod channel;
pub mod tcp;

use crate::error::Result;

pub use channel::ChannelTransport;

pub trait Transport: Send {
    /// Queue one payload for delivery. Errors are fatal for the connection.
    fn send(&mut self, payload: Vec<u8>) -> Result<()>;

    /// Next received payload, `None` if nothing is waiting. An error means the
    /// link is gone.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// Stop sending; already queued payloads are still delivered
    fn close(&mut self);

    /// Peer description for logs
    fn describe(&self) -> String {
        "transport".to_string()
    }
}
