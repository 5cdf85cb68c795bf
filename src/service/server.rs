//! A hub that owns many connections.
//!
//! Listeners added to the server are attached to every connection it holds,
//! including ones added later. `update()` drives each connection once and
//! drops those that have closed.

use crate::connection::{
    Connection, ConnectionListener, ConnectionState, Drivable, Endpoint, EndpointId, ListenerSet,
    SendOptions,
};
use crate::error::Result;
use std::any::Any;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Server {
    id: EndpointId,
    connections: RwLock<Vec<Arc<Connection>>>,
    listeners: ListenerSet,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            id: EndpointId::next(),
            connections: RwLock::new(Vec::new()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn add_connection(&self, connection: Arc<Connection>) {
        for listener in self.listeners.snapshot() {
            connection.add_listener(listener);
        }
        info!(server = %self.id, connection = %connection.id(), "Connection joined");
        self.write().push(connection);
    }

    pub fn connection(&self, id: EndpointId) -> Option<Arc<Connection>> {
        self.read().iter().find(|c| c.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Update every connection once, then prune closed ones.
    /// Returns the number of connections still held.
    pub fn update(&self) -> usize {
        let connections = self.read().clone();
        let mut closed = Vec::new();
        for connection in &connections {
            if connection.update() == ConnectionState::Closed {
                closed.push(connection.id());
            }
        }
        let mut held = self.write();
        if !closed.is_empty() {
            held.retain(|c| !closed.contains(&c.id()));
            debug!(server = %self.id, pruned = closed.len(), remaining = held.len(), "Pruned closed connections");
        }
        held.len()
    }

    /// Begin a graceful close on every connection
    pub fn close_all(&self) {
        for connection in self.read().iter() {
            connection.close();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Connection>>> {
        self.connections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Connection>>> {
        self.connections.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Endpoint for Server {
    fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        if self.listeners.add(listener.clone()) {
            for connection in self.read().iter() {
                connection.add_listener(listener.clone());
            }
        }
    }

    fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
        for connection in self.read().iter() {
            connection.remove_listener(listener);
        }
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.read().clone()
    }

    fn broadcast_except(
        &self,
        value: &dyn Any,
        options: SendOptions,
        except: Option<EndpointId>,
    ) -> Result<()> {
        let mut first_error = None;
        for connection in self.connections() {
            if Some(connection.id()) == except || connection.is_closed() {
                continue;
            }
            if let Err(e) = connection.send_any(value, options) {
                debug!(connection = %connection.id(), error = %e, "Broadcast send failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drivable for Server {
    fn drive(&self) -> bool {
        self.update();
        true
    }
}
