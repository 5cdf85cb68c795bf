//! # Protocol
//!
//! What travels inside a translated packet: the [`frame::Frame`] envelope, the
//! built-in message types the services exchange, and the type-table
//! negotiation performed when a connection opens.

pub mod frame;
pub mod handshake;
pub mod message;

/// Channel for application messages that do not pick one
pub const CHANNEL_DEFAULT: u8 = 0;
/// Remote invocations, lookups and their replies
pub const CHANNEL_REMOTE: u8 = 253;
/// Shared-object replication; certified so changes keep mutation order
pub const CHANNEL_SHARED: u8 = 254;
pub const CHANNEL_PING: u8 = 255;
