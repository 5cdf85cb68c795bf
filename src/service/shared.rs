//! # Shared Objects
//!
//! Named field snapshots replicated to every connected peer. A value of a
//! registered type is shared under a unique name; afterwards each field
//! mutation is applied locally, reported to [`SharedObjectListener`]s, and
//! broadcast as a single-field change to every other peer.
//!
//! ## Replication Rules
//! - All traffic is certified on one channel, so a peer applies the changes
//!   to an object in the order they were made. Applying a local change and
//!   broadcasting it happen under one per-object lock, so concurrent writers
//!   cannot reorder the two.
//! - A change received from a connection is relayed to every other connection
//!   of the enabled endpoints, never back to where it came from.
//! - Conflicting writes are not merged; the last one to arrive wins per field.
//! - A connection that opens after objects exist receives a full snapshot of
//!   each one.
//!
//! Mutations are detected either explicitly with [`SharedHandle::set`] or by
//! diffing a whole value against the stored snapshot with
//! [`SharedHandle::update`].

use crate::connection::{Connection, ConnectionListener, Endpoint, EndpointId, Envelope, SendOptions};
use crate::core::serialization::TypeRegistry;
use crate::core::value::Value;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{pack_fields, unpack_fields, ObjectChange, ObjectCreate, ObjectRemove};
use crate::protocol::CHANNEL_SHARED;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, info, trace, warn};

/// Callbacks for shared-object lifecycle events, local and remote alike
#[allow(unused_variables)]
pub trait SharedObjectListener: Send + Sync {
    fn created(&self, record: &SharedRecord) {}

    fn changed(&self, name: &str, field: &str, value: &Value) {}

    fn removed(&self, name: &str) {}
}

/// Current state of one shared object
#[derive(Debug, Clone, PartialEq)]
pub struct SharedRecord {
    name: String,
    type_name: String,
    fields: Vec<(String, Value)>,
    version: u64,
    dirty: Vec<String>,
}

impl SharedRecord {
    fn new(name: String, type_name: String, fields: Vec<(String, Value)>) -> Self {
        Self {
            name,
            type_name,
            fields,
            version: 1,
            dirty: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Bumped by every applied change
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Fields changed locally whose broadcast has not succeeded yet, oldest
    /// change first
    pub fn dirty(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    fn apply(&mut self, field: &str, value: Value) {
        match self.fields.iter_mut().find(|(n, _)| n == field) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((field.to_string(), value)),
        }
        self.version += 1;
    }

    /// A re-changed field moves behind the others
    fn mark_dirty(&mut self, field: &str) {
        self.dirty.retain(|f| f != field);
        self.dirty.push(field.to_string());
    }

    fn create_message(&self) -> ObjectCreate {
        ObjectCreate {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            fields: pack_fields(self.fields.clone()),
        }
    }
}

fn options() -> SendOptions {
    SendOptions::certified().on_channel(CHANNEL_SHARED)
}

struct SharedInner {
    registry: Arc<TypeRegistry>,
    objects: Mutex<BTreeMap<String, SharedRecord>>,
    listeners: RwLock<Vec<Arc<dyn SharedObjectListener>>>,
    endpoints: Mutex<Vec<(EndpointId, Weak<dyn Endpoint>)>>,
    send_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SharedInner {
    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, SharedRecord>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Held while an object's changes are applied and broadcast
    fn send_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.send_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn forget(&self, name: &str) {
        self.send_locks.lock().unwrap_or_else(|e| e.into_inner()).remove(name);
    }

    fn notify(&self, event: impl Fn(&dyn SharedObjectListener)) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            event(listener.as_ref());
        }
    }

    fn live_endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.retain(|(_, weak)| weak.strong_count() > 0);
        endpoints.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    /// Send to every enabled endpoint; every endpoint is attempted
    fn broadcast(&self, message: &dyn Any, except: Option<EndpointId>) -> Result<()> {
        let mut first_error = None;
        for endpoint in self.live_endpoints() {
            if let Err(e) = endpoint.broadcast_except(message, options(), except) {
                warn!(endpoint = %endpoint.endpoint_id(), error = %e, "Shared object broadcast failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn send_snapshot(&self, connection: &Connection) {
        let creates: Vec<ObjectCreate> = self.objects().values().map(SharedRecord::create_message).collect();
        if !creates.is_empty() {
            debug!(connection = %connection.id(), objects = creates.len(), "Sending shared object snapshot");
        }
        for create in creates {
            if let Err(e) = connection.send(&create, options()) {
                warn!(connection = %connection.id(), object = %create.name, error = %e, "Snapshot send failed");
            }
        }
    }

    /// Check a field change against the local descriptor of the object's type.
    /// Objects of types unknown here accept any field.
    fn validate(&self, type_name: &str, field: &str, value: &Value) -> Result<()> {
        let Some(descriptor) = self.registry.descriptor_by_name(type_name) else {
            return Ok(());
        };
        match descriptor.field(field) {
            Some(f) if f.is_included() && f.ty.accepts(value) => Ok(()),
            Some(f) if f.is_included() => Err(ProtocolError::Conversion(format!(
                "{type_name}.{field} declared {}, found {}",
                f.ty.name(),
                value.type_name()
            ))),
            _ => Err(ProtocolError::Conversion(format!(
                "{type_name} has no shared field {field}"
            ))),
        }
    }

    /// Apply the changes `diff` picks from the current record, then broadcast
    /// them in the order they were applied
    fn change_local(
        &self,
        name: &str,
        diff: impl FnOnce(&SharedRecord) -> Vec<(String, Value)>,
    ) -> Result<usize> {
        let lock = self.send_lock(name);
        let sending = lock.lock().unwrap_or_else(|e| e.into_inner());
        let changes = {
            let mut objects = self.objects();
            let record = objects
                .get_mut(name)
                .ok_or_else(|| ProtocolError::NotRegistered(name.to_string()))?;
            let changes = diff(&*record);
            for (field, value) in &changes {
                self.validate(&record.type_name, field, value)?;
            }
            for (field, value) in &changes {
                record.apply(field, value.clone());
                record.mark_dirty(field);
            }
            changes
        };
        if changes.is_empty() {
            return Ok(0);
        }
        let flushed = self.flush_dirty(name);
        drop(sending);

        for (field, value) in &changes {
            trace!(object = name, field = %field, "Shared field changed");
            self.notify(|l| l.changed(name, field, value));
        }
        flushed.map(|()| changes.len())
    }

    /// Broadcast every dirty field of `name`, clearing those that went out.
    /// Callers hold the object's send lock.
    fn flush_dirty(&self, name: &str) -> Result<()> {
        let pending: Vec<ObjectChange> = {
            let objects = self.objects();
            let Some(record) = objects.get(name) else {
                return Ok(());
            };
            record
                .dirty
                .iter()
                .map(|field| ObjectChange {
                    name: name.to_string(),
                    field: field.clone(),
                    value: record.field(field).cloned().unwrap_or_default(),
                })
                .collect()
        };
        let mut first_error = None;
        for change in pending {
            match self.broadcast(&change, None) {
                Ok(()) => {
                    if let Some(record) = self.objects().get_mut(name) {
                        record.dirty.retain(|f| *f != change.field);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn apply_create(&self, connection: &Connection, create: &ObjectCreate) {
        let record = SharedRecord::new(
            create.name.clone(),
            create.type_name.clone(),
            unpack_fields(create.fields.clone()),
        );
        let record = {
            let mut objects = self.objects();
            let version = objects.get(&create.name).map_or(0, |r| r.version);
            let record = SharedRecord {
                version: version + 1,
                ..record
            };
            objects.insert(create.name.clone(), record.clone());
            record
        };
        debug!(connection = %connection.id(), object = %create.name, type_name = %create.type_name, "Shared object received");
        self.notify(|l| l.created(&record));
        self.relay(connection, create);
    }

    fn apply_change(&self, connection: &Connection, change: &ObjectChange) {
        let lock = self.send_lock(&change.name);
        let relaying = lock.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut objects = self.objects();
            let Some(record) = objects.get_mut(&change.name) else {
                warn!(connection = %connection.id(), object = %change.name, "Change for unknown shared object dropped");
                return;
            };
            if let Err(e) = self.validate(&record.type_name, &change.field, &change.value) {
                warn!(connection = %connection.id(), object = %change.name, error = %e, "Invalid shared change dropped");
                return;
            }
            record.apply(&change.field, change.value.clone());
        }
        self.relay(connection, change);
        drop(relaying);
        self.notify(|l| l.changed(&change.name, &change.field, &change.value));
    }

    fn apply_remove(&self, connection: &Connection, remove: &ObjectRemove) {
        if self.objects().remove(&remove.name).is_none() {
            trace!(object = %remove.name, "Remove for unknown shared object");
            return;
        }
        self.forget(&remove.name);
        debug!(connection = %connection.id(), object = %remove.name, "Shared object removed by peer");
        self.notify(|l| l.removed(&remove.name));
        self.relay(connection, remove);
    }

    fn relay(&self, source: &Connection, message: &dyn Any) {
        if let Err(e) = self.broadcast(message, Some(source.id())) {
            debug!(source = %source.id(), error = %e, "Relay incomplete");
        }
    }
}

/// Applies replication traffic and greets new connections with a snapshot
struct Replicator {
    inner: Arc<SharedInner>,
}

impl ConnectionListener for Replicator {
    fn connected(&self, connection: &Connection) {
        self.inner.send_snapshot(connection);
    }

    fn message_received(&self, connection: &Connection, message: &Envelope) {
        if let Some(create) = message.downcast_ref::<ObjectCreate>() {
            self.inner.apply_create(connection, create);
        } else if let Some(change) = message.downcast_ref::<ObjectChange>() {
            self.inner.apply_change(connection, change);
        } else if let Some(remove) = message.downcast_ref::<ObjectRemove>() {
            self.inner.apply_remove(connection, remove);
        }
    }
}

#[derive(Clone)]
pub struct SharedObjectManager {
    inner: Arc<SharedInner>,
    replicator: Arc<dyn ConnectionListener>,
}

impl std::fmt::Debug for SharedObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedObjectManager")
            .field("objects", &self.names())
            .finish()
    }
}

impl SharedObjectManager {
    /// Objects are snapshotted and rebuilt through `registry`
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let inner = Arc::new(SharedInner {
            registry,
            objects: Mutex::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
            send_locks: Mutex::new(HashMap::new()),
        });
        let replicator = Arc::new(Replicator {
            inner: inner.clone(),
        });
        Self { inner, replicator }
    }

    pub fn add_listener(&self, listener: Arc<dyn SharedObjectListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Replicate over `endpoint`. Its open connections get a snapshot now;
    /// connections opening later get one when they connect.
    pub fn enable(&self, endpoint: Arc<dyn Endpoint>) {
        let id = endpoint.endpoint_id();
        {
            let mut endpoints = self.inner.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            if endpoints.iter().any(|(existing, _)| *existing == id) {
                return;
            }
            endpoints.push((id, Arc::downgrade(&endpoint)));
        }
        endpoint.add_listener(self.replicator.clone());
        for connection in endpoint.connections() {
            if connection.is_open() {
                self.inner.send_snapshot(&connection);
            }
        }
        info!(endpoint = %id, "Shared objects enabled");
    }

    /// Share `value` under `name` and broadcast its snapshot.
    ///
    /// The object exists locally even if the broadcast fails; the error is
    /// still returned.
    pub fn share<T: Any>(&self, name: &str, value: &T) -> Result<SharedHandle> {
        let registry = &self.inner.registry;
        let descriptor = registry
            .tag_of::<T>()
            .and_then(|tag| registry.descriptor(tag))
            .ok_or_else(|| ProtocolError::NotRegistered(std::any::type_name::<T>().to_string()))?;
        let fields = registry.snapshot(value)?;
        let record = SharedRecord::new(name.to_string(), descriptor.type_name.clone(), fields);
        {
            let mut objects = self.inner.objects();
            if objects.contains_key(name) {
                return Err(ProtocolError::AlreadyRegistered(name.to_string()));
            }
            objects.insert(name.to_string(), record.clone());
        }
        info!(object = name, type_name = %descriptor.type_name, "Shared object created");
        self.inner.notify(|l| l.created(&record));
        self.inner.broadcast(&record.create_message(), None)?;
        Ok(self.handle_unchecked(name))
    }

    pub fn handle(&self, name: &str) -> Option<SharedHandle> {
        self.inner
            .objects()
            .contains_key(name)
            .then(|| self.handle_unchecked(name))
    }

    fn handle_unchecked(&self, name: &str) -> SharedHandle {
        SharedHandle {
            name: name.to_string(),
            inner: self.inner.clone(),
        }
    }

    /// Rebuild the object as a `T`. Fails if it was shared as another type.
    pub fn get_object<T: Any>(&self, name: &str) -> Result<Option<T>> {
        let Some(record) = self.record(name) else {
            return Ok(None);
        };
        let registry = &self.inner.registry;
        let expected = registry
            .tag_of::<T>()
            .and_then(|tag| registry.descriptor(tag))
            .ok_or_else(|| ProtocolError::NotRegistered(std::any::type_name::<T>().to_string()))?;
        if expected.type_name != record.type_name {
            return Err(ProtocolError::Conversion(constants::ERR_WRONG_TYPE.to_string()));
        }
        registry.build::<T>(&record.fields).map(Some)
    }

    pub fn get_field(&self, name: &str, field: &str) -> Option<Value> {
        self.inner.objects().get(name)?.field(field).cloned()
    }

    pub fn record(&self, name: &str) -> Option<SharedRecord> {
        self.inner.objects().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.objects().keys().cloned().collect()
    }

    /// Remove locally and on every peer. `Ok(false)` if there was no such object.
    pub fn remove(&self, name: &str) -> Result<bool> {
        if self.inner.objects().remove(name).is_none() {
            return Ok(false);
        }
        self.inner.forget(name);
        info!(object = name, "Shared object removed");
        self.inner.notify(|l| l.removed(name));
        self.inner.broadcast(
            &ObjectRemove {
                name: name.to_string(),
            },
            None,
        )?;
        Ok(true)
    }
}

/// Write access to one shared object
#[derive(Clone)]
pub struct SharedHandle {
    name: String,
    inner: Arc<SharedInner>,
}

impl std::fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHandle").field("name", &self.name).finish()
    }
}

impl SharedHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.inner.objects().get(&self.name)?.field(field).cloned()
    }

    pub fn version(&self) -> Option<u64> {
        self.inner.objects().get(&self.name).map(SharedRecord::version)
    }

    /// Change one field, notify listeners, and broadcast the change
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let change = (field.to_string(), value.into());
        self.inner.change_local(&self.name, |_| vec![change]).map(|_| ())
    }

    /// Diff `value` against the stored snapshot and replicate every field that
    /// differs, in declaration order. Returns the number of changed fields.
    pub fn update<T: Any>(&self, value: &T) -> Result<usize> {
        let fields = self.inner.registry.snapshot(value)?;
        self.inner.change_local(&self.name, |record| {
            fields
                .into_iter()
                .filter(|(field, value)| record.field(field) != Some(value))
                .collect()
        })
    }

    /// Retry broadcasting fields whose earlier broadcast failed
    pub fn flush(&self) -> Result<()> {
        let lock = self.inner.send_lock(&self.name);
        let _sending = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.flush_dirty(&self.name)
    }
}
