use bytes::Bytes;
use std::collections::BTreeMap;

/// One bencode term. The format has four shapes: integers, byte strings,
/// lists, and dictionaries keyed by byte strings.
///
/// Byte strings are raw bytes; plenty of real-world fields are not UTF-8.
/// Dictionaries live in a `BTreeMap` so iteration, and therefore
/// re-encoding, is always in sorted key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Byte-string value from UTF-8 text.
    pub fn text(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The byte string as text, when it happens to be valid UTF-8.
    pub fn as_utf8(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` when this is not a dictionary or the key
    /// is absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    // Typed lookups for the `get(..).and_then(..)` chains the wire code
    // would otherwise repeat everywhere.

    pub fn int_at(&self, key: &[u8]) -> Option<i64> {
        self.get(key)?.as_int()
    }

    pub fn bytes_at(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key)?.as_bytes()
    }

    pub fn utf8_at(&self, key: &[u8]) -> Option<&str> {
        self.get(key)?.as_utf8()
    }

    pub fn list_at(&self, key: &[u8]) -> Option<&[Value]> {
        self.get(key)?.as_list()
    }
}
