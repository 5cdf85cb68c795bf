//! # peerlink
//!
//! Peer-to-peer message transport for real-time applications.
//!
//! Typed messages travel over connections with optional certified delivery.
//! Every payload passes through a pluggable translator pipeline (encryption,
//! compression). On top of the connection sit remote object proxies, shared
//! object replication and round-trip timing.
//!
//! ## Layers
//! - [`core`]: field values, the type registry and transport packet framing
//! - [`translator`]: reversible byte transforms applied to every frame
//! - [`protocol`]: frame envelope, built-in messages and type negotiation
//! - [`connection`]: state machine, certified delivery, listeners, drivers
//! - [`transport`]: in-memory and TCP links
//! - [`service`]: server hub, remote objects, shared objects, ping
//!
//! ## Example
//! ```rust
//! use peerlink::connection::{Connection, SendOptions};
//! use peerlink::core::serialization::TypeRegistry;
//! use peerlink::field_serializable;
//! use peerlink::transport::ChannelTransport;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Chat {
//!     text: String,
//! }
//!
//! field_serializable!(Chat, "demo.Chat", { text: Str });
//!
//! let registry = Arc::new(TypeRegistry::new());
//! registry.register_fields::<Chat>().unwrap();
//!
//! let (left, right) = ChannelTransport::pair();
//! let a = Connection::builder(registry.clone()).build(left).unwrap();
//! let b = Connection::builder(registry).build(right).unwrap();
//!
//! a.send(&Chat { text: "hello".into() }, SendOptions::certified()).unwrap();
//! for _ in 0..3 {
//!     a.update();
//!     b.update();
//! }
//! assert_eq!(a.pending(), 0);
//! assert_eq!(b.metrics().messages_received, 1);
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod translator;
pub mod transport;
pub mod utils;

pub use crate::config::PeerConfig;
pub use crate::connection::{Connection, ConnectionBuilder, ConnectionListener, SendOptions};
pub use crate::core::serialization::TypeRegistry;
pub use crate::core::value::{FieldType, Value};
pub use crate::error::{ProtocolError, Result};
