//! # Serialization Engine
//!
//! Maps typed values to and from bytes through an explicit descriptor table.
//! Nothing is discovered at runtime: each type is registered once, under one
//! of three capability variants, and the registry records its ordered field
//! list.
//!
//! ## Capability Variants
//! - **Fields** ([`FieldSerializable`]): declared fields are read and written
//!   through `get_field` / `set_field`
//! - **Externalizable** ([`Externalizable`]): field encoding followed by a
//!   self-describing extra pass the type writes itself
//! - **Bean** ([`Property`] accessor pairs): fields are reached through getter
//!   and setter functions supplied at registration
//!
//! ## Wire Format
//! ```text
//! [Tag(2)] [FieldCount(2)] [Value]* [External(N)]
//! ```
//! Fields are written in descriptor order, skipping excluded ones. On decode a
//! missing trailing field or an explicit null leaves the type's default value
//! in place; surplus trailing fields are skipped.
//!
//! ## Usage
//! ```rust
//! use peerlink::core::serialization::TypeRegistry;
//! use peerlink::field_serializable;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Chat {
//!     sender: String,
//!     text: String,
//! }
//!
//! field_serializable!(Chat, "example.Chat", { sender: Str, text: Str });
//!
//! let registry = TypeRegistry::new();
//! registry.register_fields::<Chat>().unwrap();
//!
//! let chat = Chat { sender: "ann".into(), text: "hi".into() };
//! let bytes = registry.encode(&chat).unwrap();
//! let back: Chat = registry.decode_as(&bytes).unwrap();
//! assert_eq!(back, chat);
//! ```

use crate::core::value::{FieldType, Value, WireReader, WireWriter};
use crate::error::{constants, ProtocolError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Type-erased decoded value, shareable between listeners
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Whether a declared field takes part in encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    Include,
    /// Declared but never written; decodes to its zero value
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub inclusion: Inclusion,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            inclusion: Inclusion::Include,
        }
    }

    /// A field that is declared but never serialized
    pub fn transient(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            inclusion: Inclusion::Exclude,
        }
    }

    pub fn is_included(&self) -> bool {
        self.inclusion == Inclusion::Include
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Fields,
    Externalizable,
    Bean,
}

/// Immutable per-type field contract
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub tag: u16,
    pub type_name: String,
    pub capability: Capability,
    pub fields: Vec<FieldDescriptor>,
}

impl Descriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn included_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_included())
    }
}

/// A type whose declared fields are encoded in order.
///
/// `get_field` returns [`Value::Null`] for unknown names; `set_field` is only
/// called with values that already satisfy the declared [`FieldType`].
pub trait FieldSerializable: Default + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    fn fields() -> Vec<FieldDescriptor>;

    fn get_field(&self, name: &str) -> Value;

    fn set_field(&mut self, name: &str, value: Value) -> Result<()>;
}

/// A field-serializable type that appends extra self-described state
pub trait Externalizable: FieldSerializable {
    fn write_external(&self, out: &mut WireWriter) -> Result<()>;

    fn read_external(&mut self, input: &mut WireReader<'_>) -> Result<()>;
}

type Getter<T> = fn(&T) -> Value;
type Setter<T> = fn(&mut T, Value) -> Result<()>;

/// One accessor pair of a bean-style type
pub struct Property<T> {
    descriptor: FieldDescriptor,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> Property<T> {
    pub fn new(name: &str, ty: FieldType, get: Getter<T>, set: Setter<T>) -> Self {
        Self {
            descriptor: FieldDescriptor::new(name, ty),
            get,
            set,
        }
    }
}

/// Implements [`FieldSerializable`] for a struct whose fields convert to and
/// from [`Value`](crate::core::value::Value).
///
/// ```rust
/// # use peerlink::field_serializable;
/// #[derive(Default)]
/// struct Position { x: f32, y: f32 }
/// field_serializable!(Position, "game.Position", { x: F32, y: F32 });
/// ```
#[macro_export]
macro_rules! field_serializable {
    ($ty:ty, $name:expr, { $($field:ident : $ft:ident),* $(,)? }) => {
        impl $crate::core::serialization::FieldSerializable for $ty {
            const TYPE_NAME: &'static str = $name;

            fn fields() -> ::std::vec::Vec<$crate::core::serialization::FieldDescriptor> {
                ::std::vec![
                    $($crate::core::serialization::FieldDescriptor::new(
                        stringify!($field),
                        $crate::core::value::FieldType::$ft,
                    )),*
                ]
            }

            fn get_field(&self, name: &str) -> $crate::core::value::Value {
                match name {
                    $(stringify!($field) => $crate::core::value::Value::from(self.$field.clone()),)*
                    _ => $crate::core::value::Value::Null,
                }
            }

            #[allow(unused_variables)]
            fn set_field(
                &mut self,
                name: &str,
                value: $crate::core::value::Value,
            ) -> $crate::error::Result<()> {
                match name {
                    $(stringify!($field) => {
                        self.$field = ::std::convert::TryFrom::try_from(value)?;
                        Ok(())
                    })*
                    other => Err($crate::error::ProtocolError::Conversion(
                        ::std::format!("unknown field {other}"),
                    )),
                }
            }
        }
    };
}

/// Field access strategy, fixed at registration time
trait Accessor: Send + Sync {
    fn create(&self) -> Box<dyn Any + Send + Sync>;

    fn get(&self, obj: &dyn Any, index: usize, field: &FieldDescriptor) -> Result<Value>;

    fn set(&self, obj: &mut dyn Any, index: usize, field: &FieldDescriptor, value: Value)
        -> Result<()>;

    fn write_external(&self, _obj: &dyn Any, _out: &mut WireWriter) -> Result<()> {
        Ok(())
    }

    fn read_external(&self, _obj: &mut dyn Any, _input: &mut WireReader<'_>) -> Result<()> {
        Ok(())
    }
}

fn downcast<T: 'static>(obj: &dyn Any) -> Result<&T> {
    obj.downcast_ref::<T>()
        .ok_or_else(|| ProtocolError::conversion(constants::ERR_WRONG_TYPE))
}

fn downcast_mut<T: 'static>(obj: &mut dyn Any) -> Result<&mut T> {
    obj.downcast_mut::<T>()
        .ok_or_else(|| ProtocolError::conversion(constants::ERR_WRONG_TYPE))
}

struct FieldAccessor<T>(PhantomData<fn() -> T>);

impl<T: FieldSerializable> Accessor for FieldAccessor<T> {
    fn create(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(T::default())
    }

    fn get(&self, obj: &dyn Any, _index: usize, field: &FieldDescriptor) -> Result<Value> {
        Ok(downcast::<T>(obj)?.get_field(&field.name))
    }

    fn set(
        &self,
        obj: &mut dyn Any,
        _index: usize,
        field: &FieldDescriptor,
        value: Value,
    ) -> Result<()> {
        downcast_mut::<T>(obj)?.set_field(&field.name, value)
    }
}

struct ExternalAccessor<T>(PhantomData<fn() -> T>);

impl<T: Externalizable> Accessor for ExternalAccessor<T> {
    fn create(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(T::default())
    }

    fn get(&self, obj: &dyn Any, _index: usize, field: &FieldDescriptor) -> Result<Value> {
        Ok(downcast::<T>(obj)?.get_field(&field.name))
    }

    fn set(
        &self,
        obj: &mut dyn Any,
        _index: usize,
        field: &FieldDescriptor,
        value: Value,
    ) -> Result<()> {
        downcast_mut::<T>(obj)?.set_field(&field.name, value)
    }

    fn write_external(&self, obj: &dyn Any, out: &mut WireWriter) -> Result<()> {
        downcast::<T>(obj)?.write_external(out)
    }

    fn read_external(&self, obj: &mut dyn Any, input: &mut WireReader<'_>) -> Result<()> {
        downcast_mut::<T>(obj)?.read_external(input)
    }
}

struct BeanAccessor<T> {
    getters: Vec<Getter<T>>,
    setters: Vec<Setter<T>>,
}

impl<T: Default + Send + Sync + 'static> Accessor for BeanAccessor<T> {
    fn create(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(T::default())
    }

    fn get(&self, obj: &dyn Any, index: usize, _field: &FieldDescriptor) -> Result<Value> {
        let obj = downcast::<T>(obj)?;
        Ok(self.getters.get(index).map(|get| get(obj)).unwrap_or_default())
    }

    fn set(
        &self,
        obj: &mut dyn Any,
        index: usize,
        field: &FieldDescriptor,
        value: Value,
    ) -> Result<()> {
        let setter = self.setters.get(index).ok_or_else(|| {
            ProtocolError::conversion(format!("no setter for property {}", field.name))
        })?;
        setter(downcast_mut::<T>(obj)?, value)
    }
}

struct Entry {
    descriptor: Arc<Descriptor>,
    accessor: Box<dyn Accessor>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Vec<Entry>,
    by_type: HashMap<TypeId, u16>,
    by_name: HashMap<String, u16>,
}

/// The descriptor table shared by every connection of an application.
///
/// Registration assigns tags in order. The first connection built on a
/// registry freezes it; registering afterwards fails, so a descriptor never
/// changes once a connection has used it.
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
    frozen: AtomicBool,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_table())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl TypeRegistry {
    /// A registry preloaded with the built-in protocol messages
    pub fn new() -> Self {
        let registry = Self::empty();
        crate::protocol::message::register_builtins(&registry);
        registry
    }

    /// A registry with no types at all
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            debug!(types = self.len(), "Type registry frozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register_fields<T: FieldSerializable>(&self) -> Result<u16> {
        self.insert(
            TypeId::of::<T>(),
            T::TYPE_NAME,
            Capability::Fields,
            T::fields(),
            Box::new(FieldAccessor::<T>(PhantomData)),
        )
    }

    pub fn register_externalizable<T: Externalizable>(&self) -> Result<u16> {
        self.insert(
            TypeId::of::<T>(),
            T::TYPE_NAME,
            Capability::Externalizable,
            T::fields(),
            Box::new(ExternalAccessor::<T>(PhantomData)),
        )
    }

    pub fn register_bean<T: Default + Send + Sync + 'static>(
        &self,
        type_name: &str,
        properties: Vec<Property<T>>,
    ) -> Result<u16> {
        let mut fields = Vec::with_capacity(properties.len());
        let mut getters = Vec::with_capacity(properties.len());
        let mut setters = Vec::with_capacity(properties.len());
        for p in properties {
            fields.push(p.descriptor);
            getters.push(p.get);
            setters.push(p.set);
        }
        self.insert(
            TypeId::of::<T>(),
            type_name,
            Capability::Bean,
            fields,
            Box::new(BeanAccessor { getters, setters }),
        )
    }

    fn insert(
        &self,
        type_id: TypeId,
        type_name: &str,
        capability: Capability,
        fields: Vec<FieldDescriptor>,
        accessor: Box<dyn Accessor>,
    ) -> Result<u16> {
        if self.is_frozen() {
            return Err(ProtocolError::ConfigError(
                constants::ERR_REGISTRY_FROZEN.to_string(),
            ));
        }
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.to_string()))?;

        if inner.by_type.contains_key(&type_id) || inner.by_name.contains_key(type_name) {
            return Err(ProtocolError::AlreadyRegistered(type_name.to_string()));
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(ProtocolError::ConfigError(format!(
                    "duplicate field {} on {type_name}",
                    field.name
                )));
            }
        }
        if fields.iter().filter(|f| f.is_included()).count() > usize::from(u16::MAX) {
            return Err(ProtocolError::ConfigError(format!(
                "too many fields on {type_name}"
            )));
        }
        let tag = u16::try_from(inner.entries.len())
            .map_err(|_| ProtocolError::ConfigError("type table full".to_string()))?;

        debug!(tag, type_name, ?capability, fields = fields.len(), "Registered type");
        inner.entries.push(Entry {
            descriptor: Arc::new(Descriptor {
                tag,
                type_name: type_name.to_string(),
                capability,
                fields,
            }),
            accessor,
        });
        inner.by_type.insert(type_id, tag);
        inner.by_name.insert(type_name.to_string(), tag);
        Ok(tag)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, RegistryInner>> {
        self.inner
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.to_string()))
    }

    pub fn tag_of<T: 'static>(&self) -> Option<u16> {
        self.read().ok()?.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn tag_by_name(&self, type_name: &str) -> Option<u16> {
        self.read().ok()?.by_name.get(type_name).copied()
    }

    pub fn descriptor(&self, tag: u16) -> Option<Arc<Descriptor>> {
        self.read()
            .ok()?
            .entries
            .get(usize::from(tag))
            .map(|e| e.descriptor.clone())
    }

    pub fn descriptor_by_name(&self, type_name: &str) -> Option<Arc<Descriptor>> {
        self.tag_by_name(type_name).and_then(|tag| self.descriptor(tag))
    }

    /// (tag, type name) pairs in tag order, exchanged during negotiation
    pub fn type_table(&self) -> Vec<(u16, String)> {
        self.read()
            .map(|inner| {
                inner
                    .entries
                    .iter()
                    .map(|e| (e.descriptor.tag, e.descriptor.type_name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Encode a registered value, tag included
    pub fn encode<T: Any>(&self, value: &T) -> Result<Vec<u8>> {
        self.encode_any(value)
    }

    pub fn encode_any(&self, value: &dyn Any) -> Result<Vec<u8>> {
        let inner = self.read()?;
        let tag = *inner.by_type.get(&value.type_id()).ok_or_else(|| {
            ProtocolError::conversion("value type has no registered descriptor")
        })?;
        let entry = &inner.entries[usize::from(tag)];
        let mut out = WireWriter::new();
        out.put_u16(tag);
        encode_fields(entry, value, &mut out)?;
        Ok(out.into_vec())
    }

    /// Split the leading tag off an encoded value
    pub fn split_tag(bytes: &[u8]) -> Result<(u16, &[u8])> {
        let mut reader = WireReader::new(bytes);
        let tag = reader.get_u16()?;
        Ok((tag, reader.rest()))
    }

    /// Decode a value whose tag has been resolved already
    pub fn decode_body(&self, tag: u16, body: &[u8]) -> Result<(Arc<Descriptor>, AnyValue)> {
        let inner = self.read()?;
        let entry = inner.entries.get(usize::from(tag)).ok_or_else(|| {
            ProtocolError::conversion(format!("no descriptor for type tag {tag}"))
        })?;
        let mut reader = WireReader::new(body);
        let mut obj = entry.accessor.create();
        decode_fields(entry, obj.as_mut(), &mut reader)?;
        if !reader.is_exhausted() {
            return Err(ProtocolError::conversion(format!(
                "{} trailing bytes after {}",
                reader.remaining(),
                entry.descriptor.type_name
            )));
        }
        Ok((entry.descriptor.clone(), Arc::from(obj)))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<(Arc<Descriptor>, AnyValue)> {
        let (tag, body) = Self::split_tag(bytes)?;
        self.decode_body(tag, body)
    }

    /// Decode and take ownership of a value of a known type
    pub fn decode_as<T: Any>(&self, bytes: &[u8]) -> Result<T> {
        let (tag, body) = Self::split_tag(bytes)?;
        if self.tag_of::<T>() != Some(tag) {
            return Err(ProtocolError::conversion(constants::ERR_WRONG_TYPE));
        }
        let inner = self.read()?;
        let entry = &inner.entries[usize::from(tag)];
        let mut reader = WireReader::new(body);
        let mut obj = entry.accessor.create();
        decode_fields(entry, obj.as_mut(), &mut reader)?;
        if !reader.is_exhausted() {
            return Err(ProtocolError::conversion(format!(
                "{} trailing bytes after {}",
                reader.remaining(),
                entry.descriptor.type_name
            )));
        }
        obj.downcast::<T>()
            .map(|b| *b)
            .map_err(|_| ProtocolError::conversion(constants::ERR_WRONG_TYPE))
    }

    /// Included fields of a registered value, in descriptor order
    pub fn snapshot(&self, value: &dyn Any) -> Result<Vec<(String, Value)>> {
        let inner = self.read()?;
        let tag = *inner.by_type.get(&value.type_id()).ok_or_else(|| {
            ProtocolError::conversion("value type has no registered descriptor")
        })?;
        let entry = &inner.entries[usize::from(tag)];
        entry
            .descriptor
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_included())
            .map(|(i, f)| Ok((f.name.clone(), entry.accessor.get(value, i, f)?)))
            .collect()
    }

    /// Build a value of type `T` from named fields; unnamed fields keep defaults
    pub fn build<T: Any>(&self, fields: &[(String, Value)]) -> Result<T> {
        let tag = self
            .tag_of::<T>()
            .ok_or_else(|| ProtocolError::conversion("type has no registered descriptor"))?;
        let inner = self.read()?;
        let entry = &inner.entries[usize::from(tag)];
        let mut obj = entry.accessor.create();
        for (name, value) in fields {
            let Some((index, field)) = entry
                .descriptor
                .fields
                .iter()
                .enumerate()
                .find(|(_, f)| &f.name == name)
            else {
                continue;
            };
            if value.is_null() || !field.is_included() {
                continue;
            }
            check_type(&entry.descriptor, field, value)?;
            entry.accessor.set(obj.as_mut(), index, field, value.clone())?;
        }
        obj.downcast::<T>()
            .map(|b| *b)
            .map_err(|_| ProtocolError::conversion(constants::ERR_WRONG_TYPE))
    }
}

fn check_type(descriptor: &Descriptor, field: &FieldDescriptor, value: &Value) -> Result<()> {
    if field.ty.accepts(value) {
        Ok(())
    } else {
        Err(ProtocolError::conversion(format!(
            "{}.{} declared {:?}, found {}",
            descriptor.type_name,
            field.name,
            field.ty,
            value.type_name()
        )))
    }
}

fn encode_fields(entry: &Entry, value: &dyn Any, out: &mut WireWriter) -> Result<()> {
    let descriptor = &entry.descriptor;
    let count = descriptor.included_fields().count();
    out.put_u16(count as u16);
    for (index, field) in descriptor.fields.iter().enumerate() {
        if !field.is_included() {
            continue;
        }
        let v = entry.accessor.get(value, index, field)?;
        check_type(descriptor, field, &v)?;
        out.put_value(&v)?;
    }
    if descriptor.capability == Capability::Externalizable {
        entry.accessor.write_external(value, out)?;
    }
    Ok(())
}

fn decode_fields(entry: &Entry, obj: &mut dyn Any, input: &mut WireReader<'_>) -> Result<()> {
    let descriptor = &entry.descriptor;
    let count = usize::from(input.get_u16()?);
    let mut included = descriptor
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_included());

    for _ in 0..count {
        let value = input.get_value()?;
        match included.next() {
            Some((index, field)) => {
                if value.is_null() {
                    continue;
                }
                check_type(descriptor, field, &value)?;
                entry.accessor.set(obj, index, field, value)?;
            }
            // Sender declared more fields than we know; skip them.
            None => continue,
        }
    }
    if descriptor.capability == Capability::Externalizable {
        entry.accessor.read_external(obj, input)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Player {
        name: String,
        score: i32,
        alive: bool,
    }

    crate::field_serializable!(Player, "test.Player", { name: Str, score: I32, alive: Bool });

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Session {
        token: String,
        cache: i64,
    }

    impl FieldSerializable for Session {
        const TYPE_NAME: &'static str = "test.Session";

        fn fields() -> Vec<FieldDescriptor> {
            vec![
                FieldDescriptor::new("token", FieldType::Str),
                FieldDescriptor::transient("cache", FieldType::I64),
            ]
        }

        fn get_field(&self, name: &str) -> Value {
            match name {
                "token" => self.token.clone().into(),
                "cache" => self.cache.into(),
                _ => Value::Null,
            }
        }

        fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
            match name {
                "token" => self.token = value.try_into()?,
                "cache" => self.cache = value.try_into()?,
                _ => {}
            }
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Snapshot {
        frame: i32,
        blob: Vec<u8>,
    }

    crate::field_serializable!(Snapshot, "test.Snapshot", { frame: I32 });

    impl Externalizable for Snapshot {
        fn write_external(&self, out: &mut WireWriter) -> Result<()> {
            out.put_bytes(&self.blob)
        }

        fn read_external(&mut self, input: &mut WireReader<'_>) -> Result<()> {
            self.blob = input.get_bytes()?;
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Account {
        balance: i64,
    }

    impl Account {
        fn balance(&self) -> i64 {
            self.balance
        }

        fn set_balance(&mut self, v: i64) {
            self.balance = v;
        }
    }

    fn registry() -> TypeRegistry {
        let r = TypeRegistry::empty();
        r.register_fields::<Player>().unwrap();
        r.register_fields::<Session>().unwrap();
        r.register_externalizable::<Snapshot>().unwrap();
        r.register_bean::<Account>(
            "test.Account",
            vec![Property::new(
                "balance",
                FieldType::I64,
                |a| a.balance().into(),
                |a, v| {
                    a.set_balance(v.try_into()?);
                    Ok(())
                },
            )],
        )
        .unwrap();
        r
    }

    #[test]
    fn test_field_roundtrip() {
        let r = registry();
        let p = Player {
            name: "ann".into(),
            score: 42,
            alive: true,
        };
        let bytes = r.encode(&p).unwrap();
        assert_eq!(r.decode_as::<Player>(&bytes).unwrap(), p);
    }

    #[test]
    fn test_transient_field_not_written() {
        let r = registry();
        let s = Session {
            token: "t".into(),
            cache: 99,
        };
        let back: Session = r.decode_as(&r.encode(&s).unwrap()).unwrap();
        assert_eq!(back.token, "t");
        assert_eq!(back.cache, 0);
    }

    #[test]
    fn test_externalizable_appends_extra_pass() {
        let r = registry();
        let s = Snapshot {
            frame: 3,
            blob: vec![9, 8, 7],
        };
        let bytes = r.encode(&s).unwrap();
        assert_eq!(r.decode_as::<Snapshot>(&bytes).unwrap(), s);
        let (desc, _) = r.decode(&bytes).unwrap();
        assert_eq!(desc.capability, Capability::Externalizable);
    }

    #[test]
    fn test_bean_accessors() {
        let r = registry();
        let a = Account { balance: -12 };
        let bytes = r.encode(&a).unwrap();
        assert_eq!(r.decode_as::<Account>(&bytes).unwrap(), a);
    }

    #[test]
    fn test_absent_fields_default() {
        let r = registry();
        let tag = r.tag_of::<Player>().unwrap();
        let mut w = WireWriter::new();
        w.put_u16(tag);
        w.put_u16(1);
        w.put_value(&Value::Str("bob".into())).unwrap();
        let p: Player = r.decode_as(&w.into_vec()).unwrap();
        assert_eq!(p.name, "bob");
        assert_eq!(p.score, 0);
        assert!(!p.alive);
    }

    #[test]
    fn test_unknown_tag_is_conversion_error() {
        let r = registry();
        let result = r.decode(&[0x7F, 0x00, 0x00, 0x00]);
        assert!(matches!(result, Err(ProtocolError::Conversion(_))));
    }

    #[test]
    fn test_truncated_buffer_is_conversion_error() {
        let r = registry();
        let bytes = r
            .encode(&Player {
                name: "a long enough name".into(),
                score: 1,
                alive: false,
            })
            .unwrap();
        let result = r.decode(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(ProtocolError::Conversion(_))));
    }

    #[test]
    fn test_field_contract_mismatch() {
        let r = registry();
        let tag = r.tag_of::<Player>().unwrap();
        let mut w = WireWriter::new();
        w.put_u16(tag);
        w.put_u16(2);
        w.put_value(&Value::Str("x".into())).unwrap();
        w.put_value(&Value::Str("not a number".into())).unwrap();
        assert!(matches!(r.decode(&w.into_vec()), Err(ProtocolError::Conversion(_))));
    }

    #[test]
    fn test_frozen_registry_rejects_registration() {
        let r = TypeRegistry::empty();
        r.freeze();
        assert!(matches!(
            r.register_fields::<Player>(),
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let r = registry();
        assert!(matches!(
            r.register_fields::<Player>(),
            Err(ProtocolError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_snapshot_and_build() {
        let r = registry();
        let p = Player {
            name: "cy".into(),
            score: 5,
            alive: true,
        };
        let fields = r.snapshot(&p).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(r.build::<Player>(&fields).unwrap(), p);
    }

    #[test]
    fn test_unregistered_type_cannot_encode() {
        let r = registry();
        assert!(matches!(r.encode(&17u8), Err(ProtocolError::Conversion(_))));
    }
}
