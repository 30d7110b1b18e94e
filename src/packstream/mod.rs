//! PackStream value codec.
//!
//! PackStream is the self-describing binary format carried inside every protocol message.
//! Each value starts with a marker byte that identifies its type and, for small values,
//! encodes the length (or the value itself) in the low nibble.
//!
//! # Overview
//!
//! - [`PackstreamReader`]: cursor over a borrowed byte buffer that decodes values.
//! - [`PackstreamWriter`]: growable buffer that encodes values using the smallest encoding.
//! - [`Value`]: dynamically typed value tree produced by the reader.
//! - [`StructHeader`]: `{tag, size}` pair prefixing every struct, including messages.
//!
//! All multi-byte integers are big-endian.
//!
//! The codec knows nothing about message semantics; see [`protocol`](crate::protocol)
//! for the message layer built on top of it.
use std::{collections::BTreeMap, fmt};

use thiserror::Error;

mod reader;
mod writer;

pub use reader::PackstreamReader;
pub use writer::PackstreamWriter;

pub(crate) mod marker {
    pub const TINY_STRING: u8 = 0x80;
    pub const TINY_LIST: u8 = 0x90;
    pub const TINY_MAP: u8 = 0xA0;
    pub const TINY_STRUCT: u8 = 0xB0;

    pub const NULL: u8 = 0xC0;
    pub const FLOAT_64: u8 = 0xC1;
    pub const FALSE: u8 = 0xC2;
    pub const TRUE: u8 = 0xC3;

    pub const INT_8: u8 = 0xC8;
    pub const INT_16: u8 = 0xC9;
    pub const INT_32: u8 = 0xCA;
    pub const INT_64: u8 = 0xCB;

    pub const BYTES_8: u8 = 0xCC;
    pub const BYTES_16: u8 = 0xCD;
    pub const BYTES_32: u8 = 0xCE;

    pub const STRING_8: u8 = 0xD0;
    pub const STRING_16: u8 = 0xD1;
    pub const STRING_32: u8 = 0xD2;

    pub const LIST_8: u8 = 0xD4;
    pub const LIST_16: u8 = 0xD5;
    pub const LIST_32: u8 = 0xD6;

    pub const MAP_8: u8 = 0xD8;
    pub const MAP_16: u8 = 0xD9;
    pub const MAP_32: u8 = 0xDA;

    pub const STRUCT_8: u8 = 0xDC;
    pub const STRUCT_16: u8 = 0xDD;

    pub const TINY_INT_MIN: i64 = -16;
    pub const TINY_INT_MAX: i64 = 127;
}

/// Deepest nesting of lists, maps and structs a reader accepts.
pub const MAX_DEPTH: usize = 64;

/// String keyed map of values.
pub type ValueMap = BTreeMap<String, Value>;

/// Dynamically typed PackStream value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Value>),
    Map(ValueMap),
    Struct(Structure),
}

/// Tagged struct nested inside a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub tag: u8,
    pub fields: Vec<Value>,
}

/// Value type families, as identified by a marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Null,
    Boolean,
    Integer,
    Float,
    Bytes,
    String,
    List,
    Map,
    Struct,
}

/// Header prefixing every struct: a signature tag and the number of fields following it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructHeader {
    pub tag: u8,
    pub size: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PackstreamError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },

    #[error("malformed value: {0}")]
    MalformedValue(String),

    #[error("unexpected type: expected {expected}, found {actual}")]
    UnexpectedType { expected: Type, actual: Type },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} exceeds the maximum encodable size")]
    Oversized(&'static str),
}

impl Type {
    /// Classify a marker byte, or `None` when the marker is reserved.
    pub fn of_marker(m: u8) -> Option<Type> {
        use marker::*;

        match m {
            0x00..=0x7F | 0xF0..=0xFF | INT_8 | INT_16 | INT_32 | INT_64 => Some(Type::Integer),
            0x80..=0x8F | STRING_8 | STRING_16 | STRING_32 => Some(Type::String),
            0x90..=0x9F | LIST_8 | LIST_16 | LIST_32 => Some(Type::List),
            0xA0..=0xAF | MAP_8 | MAP_16 | MAP_32 => Some(Type::Map),
            0xB0..=0xBF | STRUCT_8 | STRUCT_16 => Some(Type::Struct),
            NULL => Some(Type::Null),
            FLOAT_64 => Some(Type::Float),
            FALSE | TRUE => Some(Type::Boolean),
            BYTES_8 | BYTES_16 | BYTES_32 => Some(Type::Bytes),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Null => "null",
            Type::Boolean => "boolean",
            Type::Integer => "integer",
            Type::Float => "float",
            Type::Bytes => "bytes",
            Type::String => "string",
            Type::List => "list",
            Type::Map => "map",
            Type::Struct => "struct",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn value_type(&self) -> Type {
        match self {
            Value::Null => Type::Null,
            Value::Boolean(_) => Type::Boolean,
            Value::Integer(_) => Type::Integer,
            Value::Float(_) => Type::Float,
            Value::Bytes(_) => Type::Bytes,
            Value::String(_) => Type::String,
            Value::List(_) => Type::List,
            Value::Map(_) => Type::Map,
            Value::Struct(_) => Type::Struct,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<ValueMap> for Value {
    fn from(value: ValueMap) -> Self {
        Value::Map(value)
    }
}
