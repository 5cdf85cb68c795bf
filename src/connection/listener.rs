//! Connection event callbacks.
//!
//! Listeners run on whichever thread drives `update()`, after the connection
//! has released its internal locks. They may send, close, or register other
//! listeners, but must not call `update()` or block waiting on a reply that
//! the same driver has to deliver.

use crate::connection::{Connection, DisconnectReason, Envelope, MessageHeader};
use crate::error::ProtocolError;
use std::sync::{Arc, RwLock};

#[allow(unused_variables)]
pub trait ConnectionListener: Send + Sync {
    /// Type tables exchanged; the connection is open
    fn connected(&self, connection: &Connection) {}

    fn message_received(&self, connection: &Connection, message: &Envelope) {}

    /// First transmission of a message left the queue
    fn message_sent(&self, connection: &Connection, header: &MessageHeader) {}

    fn message_certified(&self, connection: &Connection, header: &MessageHeader) {}

    /// A certified message will never be acknowledged
    fn message_failed(&self, connection: &Connection, header: &MessageHeader, error: &ProtocolError) {}

    fn disconnected(&self, connection: &Connection, reason: &DisconnectReason) {}
}

fn same(a: &Arc<dyn ConnectionListener>, b: &Arc<dyn ConnectionListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Registration-ordered listener list
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet").field("len", &self.len()).finish()
    }
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `listener` unless this exact instance is already present
    pub fn add(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if listeners.iter().any(|l| same(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !same(l, listener));
        listeners.len() != before
    }

    /// Current listeners; callbacks run on this copy so they may modify the set
    pub fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
