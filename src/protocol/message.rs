//! Built-in message types.
//!
//! Every [`TypeRegistry`](crate::core::serialization::TypeRegistry) created
//! with `new()` registers these first, so both peers agree on them before any
//! application type is added.

use crate::core::serialization::TypeRegistry;
use crate::core::value::Value;
use crate::field_serializable;
use tracing::warn;

/// Round-trip probe
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Ping {
    pub probe_id: i64,
    /// Sender's clock in milliseconds
    pub sent_at: i64,
}

field_serializable!(Ping, "peerlink.Ping", { probe_id: I64, sent_at: I64 });

/// Echo of a [`Ping`], fields unchanged
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Pong {
    pub probe_id: i64,
    pub sent_at: i64,
}

field_serializable!(Pong, "peerlink.Pong", { probe_id: I64, sent_at: I64 });

/// Asks the peer whether it hosts a capability
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RemoteLookup {
    pub lookup_id: i64,
    pub capability: String,
}

field_serializable!(RemoteLookup, "peerlink.RemoteLookup", { lookup_id: I64, capability: Str });

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RemoteLookupReply {
    pub lookup_id: i64,
    pub found: bool,
    /// One `[name, [param types], return type]` list per method
    pub methods: Vec<Value>,
}

field_serializable!(RemoteLookupReply, "peerlink.RemoteLookupReply", {
    lookup_id: I64,
    found: Bool,
    methods: List,
});

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RemoteInvocation {
    pub invocation_id: i64,
    pub capability: String,
    pub method: String,
    pub args: Vec<Value>,
}

field_serializable!(RemoteInvocation, "peerlink.RemoteInvocation", {
    invocation_id: I64,
    capability: Str,
    method: Str,
    args: List,
});

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RemoteResponse {
    pub invocation_id: i64,
    pub success: bool,
    pub value: Value,
    pub failure: String,
}

field_serializable!(RemoteResponse, "peerlink.RemoteResponse", {
    invocation_id: I64,
    success: Bool,
    value: Any,
    failure: Str,
});

/// Full snapshot of a newly shared object
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ObjectCreate {
    pub name: String,
    pub type_name: String,
    /// One `[field name, value]` list per included field
    pub fields: Vec<Value>,
}

field_serializable!(ObjectCreate, "peerlink.ObjectCreate", {
    name: Str,
    type_name: Str,
    fields: List,
});

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ObjectChange {
    pub name: String,
    pub field: String,
    pub value: Value,
}

field_serializable!(ObjectChange, "peerlink.ObjectChange", { name: Str, field: Str, value: Any });

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ObjectRemove {
    pub name: String,
}

field_serializable!(ObjectRemove, "peerlink.ObjectRemove", { name: Str });

pub(crate) fn register_builtins(registry: &TypeRegistry) {
    let results = [
        registry.register_fields::<Ping>(),
        registry.register_fields::<Pong>(),
        registry.register_fields::<RemoteLookup>(),
        registry.register_fields::<RemoteLookupReply>(),
        registry.register_fields::<RemoteInvocation>(),
        registry.register_fields::<RemoteResponse>(),
        registry.register_fields::<ObjectCreate>(),
        registry.register_fields::<ObjectChange>(),
        registry.register_fields::<ObjectRemove>(),
    ];
    for result in results {
        if let Err(e) = result {
            warn!(error = %e, "Built-in type registration failed");
        }
    }
}

/// Pack `(name, value)` pairs as a list of two-element lists
pub(crate) fn pack_fields(fields: Vec<(String, Value)>) -> Vec<Value> {
    fields
        .into_iter()
        .map(|(name, value)| Value::List(vec![Value::Str(name), value]))
        .collect()
}

/// Inverse of [`pack_fields`]; malformed entries are dropped
pub(crate) fn unpack_fields(packed: Vec<Value>) -> Vec<(String, Value)> {
    packed
        .into_iter()
        .filter_map(|entry| {
            let mut pair = entry.into_list().ok()?.into_iter();
            let name = pair.next()?.into_string().ok()?;
            Some((name, pair.next().unwrap_or_default()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_builtins_registered_in_fixed_order() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.tag_of::<Ping>(), Some(0));
        assert_eq!(registry.tag_of::<ObjectRemove>(), Some(8));
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn test_response_carries_any_value() {
        let registry = TypeRegistry::new();
        let response = RemoteResponse {
            invocation_id: 7,
            success: true,
            value: Value::List(vec![Value::I32(1), "two".into()]),
            failure: String::new(),
        };
        let bytes = registry.encode(&response).unwrap();
        assert_eq!(registry.decode_as::<RemoteResponse>(&bytes).unwrap(), response);
    }

    #[test]
    fn test_field_packing() {
        let fields = vec![("value".to_string(), Value::I32(5)), ("label".to_string(), Value::Null)];
        let packed = pack_fields(fields.clone());
        let mut with_junk = packed;
        with_junk.push(Value::I8(1));
        assert_eq!(unpack_fields(with_junk), fields);
    }
}
