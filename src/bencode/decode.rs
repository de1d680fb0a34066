//! Bencode parsing.
//!
//! The parser is a cursor over the raw buffer producing an owned [`Value`]
//! tree. It is built for hostile input: every length is bounds-checked
//! before use, numbers are accumulated digit by digit with overflow checks
//! instead of going through intermediate strings, and errors carry the
//! offending byte offset.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

/// Nesting bound; DHT traffic is never legitimately this deep.
const DEPTH_LIMIT: usize = 64;

/// Decodes exactly one value spanning the whole buffer.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(data)?;
    if used != data.len() {
        return Err(BencodeError::TrailingBytes(data.len() - used));
    }
    Ok(value)
}

/// Decodes one value from the front of the buffer and reports how many
/// bytes it spanned. ut_metadata data messages append raw piece bytes after
/// the bencoded header, so that caller needs the split point.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut parser = Parser { data, at: 0 };
    let value = parser.value(0)?;
    Ok((value, parser.at))
}

struct Parser<'a> {
    data: &'a [u8],
    at: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.at)
            .copied()
            .ok_or(BencodeError::Truncated(self.at))
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth >= DEPTH_LIMIT {
            return Err(BencodeError::TooDeep(DEPTH_LIMIT));
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.string().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte { byte, at: self.at }),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.at += 1; // 'i'
        let negative = self.peek()? == b'-';
        if negative {
            self.at += 1;
        }

        let first = self.at;
        let mut magnitude: i64 = 0;
        while let Some(byte) = self.data.get(self.at).copied() {
            if !byte.is_ascii_digit() {
                break;
            }
            magnitude = magnitude
                .checked_mul(10)
                .and_then(|m| m.checked_add((byte - b'0') as i64))
                .ok_or(BencodeError::BadInteger)?;
            self.at += 1;
        }

        // No digits at all, a redundant leading zero, and negative zero are
        // all outside the canonical form.
        if self.at == first
            || (self.at - first > 1 && self.data[first] == b'0')
            || (negative && magnitude == 0)
        {
            return Err(BencodeError::BadInteger);
        }
        if self.peek()? != b'e' {
            return Err(BencodeError::BadInteger);
        }
        self.at += 1;
        Ok(Value::Int(if negative { -magnitude } else { magnitude }))
    }

    fn string(&mut self) -> Result<Bytes, BencodeError> {
        let len = self.length()?;
        if self.peek()? != b':' {
            return Err(BencodeError::BadLength);
        }
        self.at += 1;

        let end = self
            .at
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(BencodeError::Truncated(self.data.len()))?;
        let bytes = Bytes::copy_from_slice(&self.data[self.at..end]);
        self.at = end;
        Ok(bytes)
    }

    fn length(&mut self) -> Result<usize, BencodeError> {
        let first = self.at;
        let mut len: usize = 0;
        while let Some(byte) = self.data.get(self.at).copied() {
            if !byte.is_ascii_digit() {
                break;
            }
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add((byte - b'0') as usize))
                .ok_or(BencodeError::BadLength)?;
            self.at += 1;
        }
        if self.at == first {
            return Err(BencodeError::BadLength);
        }
        Ok(len)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.at += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.at += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.at += 1; // 'd'
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey);
            }
            let key = self.string()?;
            let value = self.value(depth + 1)?;
            // First occurrence wins; hostile encoders repeat keys.
            entries.entry(key).or_insert(value);
        }
        self.at += 1;
        Ok(Value::Dict(entries))
    }
}
