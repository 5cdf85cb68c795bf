//! The surface shared by a single [`Connection`] and a server hub, so the
//! remote and shared object layers work over either.

use crate::connection::{Connection, ConnectionListener, SendOptions};
use crate::error::Result;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique identity of a connection or server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

impl EndpointId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

pub trait Endpoint: Send + Sync {
    fn endpoint_id(&self) -> EndpointId;

    /// Attach to every current connection, and for hubs every later one
    fn add_listener(&self, listener: Arc<dyn ConnectionListener>);

    fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>);

    fn connections(&self) -> Vec<Arc<Connection>>;

    /// Send to every connection except the one identified by `except`.
    /// Every connection is attempted; the first error is returned.
    fn broadcast_except(
        &self,
        value: &dyn Any,
        options: SendOptions,
        except: Option<EndpointId>,
    ) -> Result<()>;

    fn broadcast(&self, value: &dyn Any, options: SendOptions) -> Result<()> {
        self.broadcast_except(value, options, None)
    }
}
