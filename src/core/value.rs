//! # Field Values
//!
//! The closed set of field types the serialization engine understands, their
//! dynamic [`Value`] form, and the binary reader/writer used on the wire.
//!
//! ## Wire Format
//! ```text
//! [Kind(1)] [Body]
//!   Null, Bool(1), I8(1), I16(2), I32(4), I64(8), F32(4), F64(8), Char(4)
//!   Str/Bytes: [Len(4)] [Data(Len)]
//!   List:      [Count(4)] [Value]*
//! ```
//! Multi-byte integers are big-endian.

use crate::error::{constants, ProtocolError, Result};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Char,
    Str,
    Bytes,
    List,
    /// Accepts any value kind
    Any,
}

impl FieldType {
    fn kind(self) -> Option<u8> {
        match self {
            FieldType::Bool => Some(1),
            FieldType::I8 => Some(2),
            FieldType::I16 => Some(3),
            FieldType::I32 => Some(4),
            FieldType::I64 => Some(5),
            FieldType::F32 => Some(6),
            FieldType::F64 => Some(7),
            FieldType::Char => Some(8),
            FieldType::Str => Some(9),
            FieldType::Bytes => Some(10),
            FieldType::List => Some(11),
            FieldType::Any => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::I8 => "i8",
            FieldType::I16 => "i16",
            FieldType::I32 => "i32",
            FieldType::I64 => "i64",
            FieldType::F32 => "f32",
            FieldType::F64 => "f64",
            FieldType::Char => "char",
            FieldType::Str => "string",
            FieldType::Bytes => "bytes",
            FieldType::List => "list",
            FieldType::Any => "any",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [FieldType; 12] = [
            FieldType::Bool,
            FieldType::I8,
            FieldType::I16,
            FieldType::I32,
            FieldType::I64,
            FieldType::F32,
            FieldType::F64,
            FieldType::Char,
            FieldType::Str,
            FieldType::Bytes,
            FieldType::List,
            FieldType::Any,
        ];
        ALL.into_iter().find(|t| t.name() == name)
    }

    /// The zero value an absent field decodes to
    pub fn zero(self) -> Value {
        match self {
            FieldType::Bool => Value::Bool(false),
            FieldType::I8 => Value::I8(0),
            FieldType::I16 => Value::I16(0),
            FieldType::I32 => Value::I32(0),
            FieldType::I64 => Value::I64(0),
            FieldType::F32 => Value::F32(0.0),
            FieldType::F64 => Value::F64(0.0),
            FieldType::Char => Value::Char('\0'),
            FieldType::Str => Value::Str(String::new()),
            FieldType::Bytes => Value::Bytes(Vec::new()),
            FieldType::List => Value::List(Vec::new()),
            FieldType::Any => Value::Null,
        }
    }

    /// Whether `value` satisfies this declared type. Null satisfies every type.
    pub fn accepts(self, value: &Value) -> bool {
        match (self.kind(), value) {
            (_, Value::Null) | (None, _) => true,
            (Some(kind), v) => v.kind() == kind,
        }
    }
}

/// A dynamically typed field value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    fn kind(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::I8(_) => 2,
            Value::I16(_) => 3,
            Value::I32(_) => 4,
            Value::I64(_) => 5,
            Value::F32(_) => 6,
            Value::F64(_) => 7,
            Value::Char(_) => 8,
            Value::Str(_) => 9,
            Value::Bytes(_) => 10,
            Value::List(_) => 11,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Char(_) => "char",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer kind widened to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(i64::from(*v)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Take a string out of the value, failing with a conversion error otherwise
    pub fn into_string(self) -> Result<String> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }

    pub fn into_list(self) -> Result<Vec<Value>> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(mismatch("list", &other)),
        }
    }
}

pub(crate) fn mismatch(expected: &str, got: &Value) -> ProtocolError {
    ProtocolError::conversion(format!("expected {expected}, found {}", got.type_name()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "{v:?}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }

            impl TryFrom<Value> for $ty {
                type Error = ProtocolError;

                fn try_from(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(mismatch(stringify!($ty), &other)),
                    }
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    char => Char,
    String => Str,
    Vec<u8> => Bytes,
    Vec<Value> => List,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl TryFrom<Value> for () {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(()),
            other => Err(mismatch("null", &other)),
        }
    }
}

/// Deepest list nesting either side will encode or decode
pub const MAX_NESTING: usize = 64;

/// Appends values to a growable buffer
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    fn put_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| ProtocolError::conversion(format!("length {len} exceeds u32")))?;
        self.buf.put_u32(len);
        Ok(())
    }

    /// Length-prefixed raw bytes
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.put_len(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn put_str(&mut self, s: &str) -> Result<()> {
        self.put_bytes(s.as_bytes())
    }

    pub fn put_value(&mut self, value: &Value) -> Result<()> {
        self.put_nested(value, 0)
    }

    fn put_nested(&mut self, value: &Value, depth: usize) -> Result<()> {
        if depth > MAX_NESTING {
            return Err(ProtocolError::conversion(constants::ERR_NESTING));
        }
        self.buf.put_u8(value.kind());
        match value {
            Value::Null => {}
            Value::Bool(v) => self.buf.put_u8(u8::from(*v)),
            Value::I8(v) => self.buf.put_i8(*v),
            Value::I16(v) => self.buf.put_i16(*v),
            Value::I32(v) => self.buf.put_i32(*v),
            Value::I64(v) => self.buf.put_i64(*v),
            Value::F32(v) => self.buf.put_f32(*v),
            Value::F64(v) => self.buf.put_f64(*v),
            Value::Char(v) => self.buf.put_u32(u32::from(*v)),
            Value::Str(v) => self.put_str(v)?,
            Value::Bytes(v) => self.put_bytes(v)?,
            Value::List(items) => {
                self.put_len(items.len())?;
                for item in items {
                    self.put_nested(item, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Consumes values from a byte slice, never reading past its end
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::conversion(format!(
                "{}: need {n} bytes, {} available",
                constants::ERR_TRUNCATED,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::conversion(constants::ERR_INVALID_UTF8))
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub fn get_value(&mut self) -> Result<Value> {
        self.get_nested(0)
    }

    fn get_nested(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_NESTING {
            return Err(ProtocolError::conversion(constants::ERR_NESTING));
        }
        let kind = self.get_u8()?;
        let value = match kind {
            0 => Value::Null,
            1 => Value::Bool(self.get_u8()? != 0),
            2 => Value::I8(i8::from_be_bytes(self.take_array()?)),
            3 => Value::I16(i16::from_be_bytes(self.take_array()?)),
            4 => Value::I32(i32::from_be_bytes(self.take_array()?)),
            5 => Value::I64(i64::from_be_bytes(self.take_array()?)),
            6 => Value::F32(f32::from_be_bytes(self.take_array()?)),
            7 => Value::F64(f64::from_be_bytes(self.take_array()?)),
            8 => {
                let raw = self.get_u32()?;
                Value::Char(
                    char::from_u32(raw)
                        .ok_or_else(|| ProtocolError::conversion(constants::ERR_INVALID_CHAR))?,
                )
            }
            9 => Value::Str(self.get_str()?),
            10 => Value::Bytes(self.get_bytes()?),
            11 => {
                let count = self.get_u32()? as usize;
                // Each element needs at least its kind byte.
                if count > self.remaining() {
                    return Err(ProtocolError::conversion(constants::ERR_TRUNCATED));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.get_nested(depth + 1)?);
                }
                Value::List(items)
            }
            other => {
                return Err(ProtocolError::conversion(format!(
                    "{}: {other}",
                    constants::ERR_UNKNOWN_KIND
                )))
            }
        };
        Ok(value)
    }
}
