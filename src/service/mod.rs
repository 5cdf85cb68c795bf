//! # Services
//!
//! Layers built on top of connections through the listener interface.
//!
//! ## Components
//! - **Server**: a hub owning many connections behind one [`Endpoint`](crate::connection::Endpoint)
//! - **Remote**: hosted objects and blocking proxies
//! - **Shared**: replicated named objects
//! - **Ping**: round-trip time probes
//!
//! Each service is an explicit object; nothing here is global. Enable a
//! service on a connection or server before traffic for it arrives.

pub mod ping;
pub mod remote;
pub mod server;
pub mod shared;

pub use ping::{PingHandle, PingService};
pub use remote::{MethodSignature, RemoteCapability, RemoteObject, RemoteObjectManager, RemoteProxy};
pub use server::Server;
pub use shared::{SharedHandle, SharedObjectListener, SharedObjectManager, SharedRecord};
