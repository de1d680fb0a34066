//! Canonical bencode serialisation.
//!
//! Writing into a byte vector cannot fail, so unlike decoding there is no
//! error path. Dictionaries serialise in `BTreeMap` iteration order, which
//! is exactly the sorted-key order the format requires, and integers come
//! out minimal because they are stored as `i64`.

use super::value::Value;

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    push_value(&mut out, value);
    out
}

fn push_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => push_string(out, bytes),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                push_value(out, item);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                push_string(out, key);
                push_value(out, item);
            }
            out.push(b'e');
        }
    }
}

fn push_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
