//! # Remote Objects
//!
//! A peer hosts named implementations of a [`RemoteCapability`]; the other
//! side obtains a [`RemoteProxy`] for it and calls methods by name. Every call
//! is a certified [`RemoteInvocation`] answered by a [`RemoteResponse`] on the
//! remote channel, and the caller blocks until the response, a timeout, or the
//! connection closing.
//!
//! ## Threading
//! Replies are delivered by whoever drives the connection. A proxy call must
//! therefore never be made from a listener callback or from the thread that
//! drives the same connection.
//!
//! ## Example
//! ```rust
//! use peerlink::core::value::FieldType;
//! use peerlink::service::remote::RemoteCapability;
//!
//! let capability = RemoteCapability::new("RemoteAction")
//!     .method("getMessage", vec![], FieldType::Str)
//!     .method("setMessage", vec![FieldType::Str], FieldType::Any);
//! assert!(capability.signature("setMessage").is_some());
//! ```

use crate::config::RemoteConfig;
use crate::connection::{
    Connection, ConnectionListener, ConnectionState, DisconnectReason, Endpoint, EndpointId,
    Envelope, SendOptions,
};
use crate::core::value::{FieldType, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{RemoteInvocation, RemoteLookup, RemoteLookupReply, RemoteResponse};
use crate::protocol::CHANNEL_REMOTE;
use crate::utils::metrics::Timer;
use crate::utils::{Pending, WaitOutcome};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// One callable method: its name, parameter types and return type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<FieldType>,
    pub returns: FieldType,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, params: Vec<FieldType>, returns: FieldType) -> Self {
        Self {
            name: name.into(),
            params,
            returns,
        }
    }

    /// Reject argument lists of the wrong length or kinds
    pub fn check_args(&self, args: &[Value]) -> Result<()> {
        if args.len() != self.params.len() {
            return Err(ProtocolError::Invocation(format!(
                "{} takes {} arguments, got {}",
                self.name,
                self.params.len(),
                args.len()
            )));
        }
        for (index, (param, arg)) in self.params.iter().zip(args).enumerate() {
            if !param.accepts(arg) {
                return Err(ProtocolError::Invocation(format!(
                    "{} argument {index}: expected {}, found {}",
                    self.name,
                    param.name(),
                    arg.type_name()
                )));
            }
        }
        Ok(())
    }

    fn to_value(&self) -> Value {
        Value::List(vec![
            Value::Str(self.name.clone()),
            Value::List(self.params.iter().map(|p| Value::from(p.name())).collect()),
            Value::from(self.returns.name()),
        ])
    }

    fn from_value(value: Value) -> Result<Self> {
        let mut parts = value.into_list()?.into_iter();
        let name = parts.next().unwrap_or_default().into_string()?;
        let params = parts
            .next()
            .unwrap_or_default()
            .into_list()?
            .into_iter()
            .map(|p| type_from_name(&p.into_string()?))
            .collect::<Result<Vec<_>>>()?;
        let returns = type_from_name(&parts.next().unwrap_or_default().into_string()?)?;
        Ok(Self::new(name, params, returns))
    }
}

fn type_from_name(name: &str) -> Result<FieldType> {
    FieldType::from_name(name)
        .ok_or_else(|| ProtocolError::Conversion(format!("unknown field type {name:?}")))
}

/// A named set of methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCapability {
    pub name: String,
    pub methods: Vec<MethodSignature>,
}

impl RemoteCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, name: impl Into<String>, params: Vec<FieldType>, returns: FieldType) -> Self {
        self.methods.push(MethodSignature::new(name, params, returns));
        self
    }

    pub fn signature(&self, method: &str) -> Option<&MethodSignature> {
        self.methods.iter().find(|m| m.name == method)
    }
}

/// An object whose methods other peers may call
pub trait RemoteObject: Send + Sync {
    fn capability(&self) -> RemoteCapability;

    /// Run `method`. Errors are sent back to the caller as their message text.
    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value>;
}

struct Hosted {
    capability: RemoteCapability,
    object: Arc<dyn RemoteObject>,
}

enum LookupOutcome {
    Found(Vec<MethodSignature>),
    Missing,
    Disconnected,
}

enum CallOutcome {
    Returned(Value),
    Failed(String),
    Disconnected,
}

struct Waiting<T> {
    connection: EndpointId,
    result: Arc<Pending<T>>,
}

struct RemoteInner {
    hosted: RwLock<HashMap<String, Hosted>>,
    lookups: Mutex<HashMap<i64, Waiting<LookupOutcome>>>,
    calls: Mutex<HashMap<i64, Waiting<CallOutcome>>>,
    enabled: Mutex<HashSet<EndpointId>>,
    next_id: AtomicI64,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn options() -> SendOptions {
    SendOptions::certified().on_channel(CHANNEL_REMOTE)
}

impl RemoteInner {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn answer_lookup(&self, connection: &Connection, lookup: &RemoteLookup) {
        let hosted = self.hosted.read().unwrap_or_else(|e| e.into_inner());
        let reply = match hosted.get(&lookup.capability) {
            Some(entry) => RemoteLookupReply {
                lookup_id: lookup.lookup_id,
                found: true,
                methods: entry.capability.methods.iter().map(MethodSignature::to_value).collect(),
            },
            None => RemoteLookupReply {
                lookup_id: lookup.lookup_id,
                found: false,
                methods: Vec::new(),
            },
        };
        drop(hosted);
        debug!(connection = %connection.id(), capability = %lookup.capability, found = reply.found, "Lookup answered");
        if let Err(e) = connection.send(&reply, options()) {
            warn!(connection = %connection.id(), error = %e, "Failed to answer lookup");
        }
    }

    fn run_invocation(&self, invocation: &RemoteInvocation) -> std::result::Result<Value, String> {
        let (object, returns) = {
            let hosted = self.hosted.read().unwrap_or_else(|e| e.into_inner());
            let entry = hosted
                .get(&invocation.capability)
                .ok_or_else(|| format!("no remote object named {}", invocation.capability))?;
            let signature = entry
                .capability
                .signature(&invocation.method)
                .ok_or_else(|| format!("{} has no method {}", invocation.capability, invocation.method))?;
            signature.check_args(&invocation.args).map_err(failure_text)?;
            (entry.object.clone(), signature.returns)
        };
        let value = object
            .invoke(&invocation.method, invocation.args.clone())
            .map_err(failure_text)?;
        if !returns.accepts(&value) {
            return Err(format!(
                "{} returned {}, declared {}",
                invocation.method,
                value.type_name(),
                returns.name()
            ));
        }
        Ok(value)
    }

    fn answer_invocation(&self, connection: &Connection, invocation: &RemoteInvocation) {
        let response = match self.run_invocation(invocation) {
            Ok(value) => RemoteResponse {
                invocation_id: invocation.invocation_id,
                success: true,
                value,
                failure: String::new(),
            },
            Err(failure) => {
                debug!(capability = %invocation.capability, method = %invocation.method, failure = %failure, "Invocation failed");
                RemoteResponse {
                    invocation_id: invocation.invocation_id,
                    success: false,
                    value: Value::Null,
                    failure,
                }
            }
        };
        if let Err(e) = connection.send(&response, options()) {
            warn!(connection = %connection.id(), error = %e, "Failed to send invocation response");
        }
    }

    fn fail_connection(&self, id: EndpointId) {
        let lookups: Vec<_> = {
            let mut lookups = guard(&self.lookups);
            let ids: Vec<i64> = lookups.iter().filter(|(_, w)| w.connection == id).map(|(k, _)| *k).collect();
            ids.into_iter().filter_map(|k| lookups.remove(&k)).collect()
        };
        let calls: Vec<_> = {
            let mut calls = guard(&self.calls);
            let ids: Vec<i64> = calls.iter().filter(|(_, w)| w.connection == id).map(|(k, _)| *k).collect();
            ids.into_iter().filter_map(|k| calls.remove(&k)).collect()
        };
        if !lookups.is_empty() || !calls.is_empty() {
            debug!(connection = %id, lookups = lookups.len(), calls = calls.len(), "Failing pending remote work");
        }
        for waiting in lookups {
            waiting.result.resolve(LookupOutcome::Disconnected);
        }
        for waiting in calls {
            waiting.result.resolve(CallOutcome::Disconnected);
        }
    }
}

fn failure_text(error: ProtocolError) -> String {
    match error {
        ProtocolError::Invocation(message) => message,
        other => other.to_string(),
    }
}

/// Routes remote-channel messages for one manager
struct RemoteListener {
    inner: Arc<RemoteInner>,
}

impl ConnectionListener for RemoteListener {
    fn message_received(&self, connection: &Connection, message: &Envelope) {
        if let Some(lookup) = message.downcast_ref::<RemoteLookup>() {
            self.inner.answer_lookup(connection, lookup);
        } else if let Some(reply) = message.downcast_ref::<RemoteLookupReply>() {
            let Some(waiting) = guard(&self.inner.lookups).remove(&reply.lookup_id) else {
                debug!(lookup = reply.lookup_id, "Late lookup reply");
                return;
            };
            let outcome = if reply.found {
                match reply
                    .methods
                    .iter()
                    .cloned()
                    .map(MethodSignature::from_value)
                    .collect::<Result<Vec<_>>>()
                {
                    Ok(methods) => LookupOutcome::Found(methods),
                    Err(e) => {
                        warn!(error = %e, "Malformed capability in lookup reply");
                        LookupOutcome::Missing
                    }
                }
            } else {
                LookupOutcome::Missing
            };
            waiting.result.resolve(outcome);
        } else if let Some(invocation) = message.downcast_ref::<RemoteInvocation>() {
            self.inner.answer_invocation(connection, invocation);
        } else if let Some(response) = message.downcast_ref::<RemoteResponse>() {
            let Some(waiting) = guard(&self.inner.calls).remove(&response.invocation_id) else {
                debug!(invocation = response.invocation_id, "Late invocation response");
                return;
            };
            let outcome = if response.success {
                CallOutcome::Returned(response.value.clone())
            } else {
                CallOutcome::Failed(response.failure.clone())
            };
            waiting.result.resolve(outcome);
        }
    }

    fn disconnected(&self, connection: &Connection, _reason: &DisconnectReason) {
        self.inner.fail_connection(connection.id());
    }
}

/// Hosts local remote objects and creates proxies to remote ones
#[derive(Clone)]
pub struct RemoteObjectManager {
    inner: Arc<RemoteInner>,
    listener: Arc<dyn ConnectionListener>,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObjectManager")
            .field("hosted", &self.hosted())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for RemoteObjectManager {
    fn default() -> Self {
        Self::new(&RemoteConfig::default())
    }
}

impl RemoteObjectManager {
    pub fn new(config: &RemoteConfig) -> Self {
        let inner = Arc::new(RemoteInner {
            hosted: RwLock::new(HashMap::new()),
            lookups: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            enabled: Mutex::new(HashSet::new()),
            next_id: AtomicI64::new(1),
        });
        let listener = Arc::new(RemoteListener {
            inner: inner.clone(),
        });
        Self {
            inner,
            listener,
            timeout: config.invocation_timeout,
        }
    }

    /// Serve lookups and invocations arriving on `endpoint`. Idempotent.
    pub fn enable(&self, endpoint: &dyn Endpoint) {
        if guard(&self.inner.enabled).insert(endpoint.endpoint_id()) {
            debug!(endpoint = %endpoint.endpoint_id(), "Remote objects enabled");
        }
        endpoint.add_listener(self.listener.clone());
    }

    /// Host `object` under its capability name and serve it on `endpoint`
    pub fn register(&self, object: Arc<dyn RemoteObject>, endpoint: &dyn Endpoint) -> Result<()> {
        let capability = object.capability();
        {
            let mut hosted = self.inner.hosted.write().unwrap_or_else(|e| e.into_inner());
            if hosted.contains_key(&capability.name) {
                return Err(ProtocolError::AlreadyRegistered(capability.name));
            }
            info!(capability = %capability.name, methods = capability.methods.len(), "Remote object registered");
            hosted.insert(capability.name.clone(), Hosted { capability, object });
        }
        self.enable(endpoint);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner
            .hosted
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Names of locally hosted objects, sorted
    pub fn hosted(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .hosted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Ask the peer on `connection` for `capability` and wait up to `timeout`.
    ///
    /// `Ok(None)` means the peer did not answer in time. A peer that answers
    /// without the capability yields `NotRegistered`.
    #[instrument(skip(self, connection), fields(connection = %connection.id()))]
    pub fn create_proxy(
        &self,
        capability: &str,
        connection: &Arc<Connection>,
        timeout: Duration,
    ) -> Result<Option<RemoteProxy>> {
        ensure_usable(connection)?;
        self.enable(connection.as_ref());
        let lookup_id = self.inner.next_id();
        let result = Arc::new(Pending::new());
        guard(&self.inner.lookups).insert(
            lookup_id,
            Waiting {
                connection: connection.id(),
                result: result.clone(),
            },
        );
        let lookup = RemoteLookup {
            lookup_id,
            capability: capability.to_string(),
        };
        if let Err(e) = connection.send(&lookup, options()) {
            guard(&self.inner.lookups).remove(&lookup_id);
            return Err(e);
        }

        match result.wait_take(timeout) {
            WaitOutcome::Resolved(LookupOutcome::Found(methods)) => {
                debug!(methods = methods.len(), "Proxy created");
                Ok(Some(RemoteProxy {
                    inner: self.inner.clone(),
                    connection: connection.clone(),
                    capability: RemoteCapability {
                        name: capability.to_string(),
                        methods,
                    },
                    timeout: self.timeout,
                }))
            }
            WaitOutcome::Resolved(LookupOutcome::Missing) => {
                Err(ProtocolError::NotRegistered(capability.to_string()))
            }
            WaitOutcome::Resolved(LookupOutcome::Disconnected) => Err(ProtocolError::Disconnected),
            WaitOutcome::Pending => {
                guard(&self.inner.lookups).remove(&lookup_id);
                debug!("Lookup timed out");
                Ok(None)
            }
        }
    }

    /// Calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        guard(&self.inner.calls).len()
    }
}

fn ensure_usable(connection: &Connection) -> Result<()> {
    match connection.state() {
        ConnectionState::Closing | ConnectionState::Closed => Err(ProtocolError::Disconnected),
        ConnectionState::Negotiating | ConnectionState::Open => Ok(()),
    }
}

/// Caller-side stand-in for an object hosted by the peer
#[derive(Clone)]
pub struct RemoteProxy {
    inner: Arc<RemoteInner>,
    connection: Arc<Connection>,
    capability: RemoteCapability,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("capability", &self.capability.name)
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl RemoteProxy {
    pub fn capability(&self) -> &RemoteCapability {
        &self.capability
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether calls can still reach the peer
    pub fn is_valid(&self) -> bool {
        ensure_usable(&self.connection).is_ok()
    }

    /// Call `method` and block for its result.
    ///
    /// Fails with `Invocation` for signature mismatches and remote failures,
    /// `Timeout` when no response arrives in time, and `Disconnected` when the
    /// connection closes first.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let _timer = Timer::start("remote_invoke");
        ensure_usable(&self.connection)?;
        let signature = self.capability.signature(method).ok_or_else(|| {
            ProtocolError::Invocation(format!("{} has no method {method}", self.capability.name))
        })?;
        signature.check_args(&args)?;

        let invocation_id = self.inner.next_id();
        let result = Arc::new(Pending::new());
        guard(&self.inner.calls).insert(
            invocation_id,
            Waiting {
                connection: self.connection.id(),
                result: result.clone(),
            },
        );
        let invocation = RemoteInvocation {
            invocation_id,
            capability: self.capability.name.clone(),
            method: method.to_string(),
            args,
        };
        if let Err(e) = self.connection.send(&invocation, options()) {
            guard(&self.inner.calls).remove(&invocation_id);
            return Err(e);
        }

        match result.wait_take(self.timeout) {
            WaitOutcome::Resolved(CallOutcome::Returned(value)) => Ok(value),
            WaitOutcome::Resolved(CallOutcome::Failed(failure)) => Err(ProtocolError::Invocation(failure)),
            WaitOutcome::Resolved(CallOutcome::Disconnected) => Err(ProtocolError::Disconnected),
            WaitOutcome::Pending => {
                guard(&self.inner.calls).remove(&invocation_id);
                warn!(capability = %self.capability.name, method, timeout_ms = self.timeout.as_millis() as u64, "Invocation timed out");
                Err(ProtocolError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    struct Echo;

    impl RemoteObject for Echo {
        fn capability(&self) -> RemoteCapability {
            RemoteCapability::new("Echo")
                .method("echo", vec![FieldType::Str], FieldType::Str)
                .method("broken", vec![], FieldType::I32)
        }

        fn invoke(&self, method: &str, mut args: Vec<Value>) -> Result<Value> {
            match method {
                "echo" => Ok(args.remove(0)),
                "broken" => Ok(Value::from("not a number")),
                other => Err(ProtocolError::Invocation(format!("unexpected {other}"))),
            }
        }
    }

    fn host() -> RemoteInner {
        let inner = RemoteInner {
            hosted: RwLock::new(HashMap::new()),
            lookups: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            enabled: Mutex::new(HashSet::new()),
            next_id: AtomicI64::new(1),
        };
        let object: Arc<dyn RemoteObject> = Arc::new(Echo);
        inner.hosted.write().unwrap().insert(
            "Echo".to_string(),
            Hosted {
                capability: object.capability(),
                object,
            },
        );
        inner
    }

    fn call(method: &str, args: Vec<Value>) -> RemoteInvocation {
        RemoteInvocation {
            invocation_id: 1,
            capability: "Echo".to_string(),
            method: method.to_string(),
            args,
        }
    }

    #[test]
    fn test_signature_survives_value_form() {
        let signature = MethodSignature::new("set", vec![FieldType::Str, FieldType::I64], FieldType::Any);
        assert_eq!(MethodSignature::from_value(signature.to_value()).unwrap(), signature);
    }

    #[test]
    fn test_argument_checks() {
        let signature = MethodSignature::new("set", vec![FieldType::Str], FieldType::Any);
        assert!(signature.check_args(&[Value::from("x")]).is_ok());
        assert!(signature.check_args(&[Value::Null]).is_ok());
        assert!(matches!(
            signature.check_args(&[Value::I32(1)]),
            Err(ProtocolError::Invocation(_))
        ));
        assert!(matches!(signature.check_args(&[]), Err(ProtocolError::Invocation(_))));
    }

    #[test]
    fn test_host_runs_and_validates_calls() {
        let inner = host();
        assert_eq!(
            inner.run_invocation(&call("echo", vec![Value::from("hi")])),
            Ok(Value::from("hi"))
        );
        assert!(inner.run_invocation(&call("missing", vec![])).is_err());
        assert!(inner.run_invocation(&call("echo", vec![Value::Bool(true)])).is_err());
        let err = inner.run_invocation(&call("broken", vec![])).unwrap_err();
        assert!(err.contains("declared i32"), "{err}");
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let manager = RemoteObjectManager::default();
        let server = crate::service::server::Server::new();
        manager.register(Arc::new(Echo), &server).unwrap();
        assert!(matches!(
            manager.register(Arc::new(Echo), &server),
            Err(ProtocolError::AlreadyRegistered(name)) if name == "Echo"
        ));
        assert_eq!(manager.hosted(), vec!["Echo".to_string()]);
        assert!(manager.unregister("Echo"));
        assert!(manager.hosted().is_empty());
    }

    #[test]
    fn test_disconnect_resolves_waiters() {
        let inner = host();
        let id = crate::connection::EndpointId::next();
        let result = Arc::new(Pending::new());
        guard(&inner.calls).insert(
            7,
            Waiting {
                connection: id,
                result: result.clone(),
            },
        );
        inner.fail_connection(id);
        assert!(matches!(
            result.wait_take(Duration::from_millis(1)),
            WaitOutcome::Resolved(CallOutcome::Disconnected)
        ));
        assert!(guard(&inner.calls).is_empty());
    }
}
