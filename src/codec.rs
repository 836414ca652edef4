//! Value codec — a thin adapter over the self-describing MsgPack serializer.
//!
//! The protocol core never interprets payload bytes itself; it packs
//! [`rmpv::Value`] trees with a [`Packer`] and decodes them back with an
//! [`Unpacker`].  Each protocol instance owns exactly one of each.
//!
//! The bottom of the module carries the value construction and extraction
//! helpers used by handlers and call sites (`val_*`, `get_*`,
//! [`make_kwargs`]), plus a serde bridge ([`to_value`] / [`from_value`])
//! for callers that prefer typed structs over raw values.

use bytes::Bytes;
use rmpv::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::Result;

// ---------------------------------------------------------------------------
// Packer / Unpacker
// ---------------------------------------------------------------------------

/// Serializes [`Value`] trees into MsgPack blobs.
#[derive(Debug, Default)]
pub struct Packer;

impl Packer {
    pub fn new() -> Self {
        Self
    }

    pub fn pack(&mut self, value: &Value) -> Result<Bytes> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value)?;
        Ok(buf.into())
    }
}

/// Buffers one payload blob at a time and decodes it into a [`Value`].
///
/// `feed` discards any residue a previous malformed payload may have left
/// behind, so one bad frame cannot poison the next.
#[derive(Debug, Default)]
pub struct Unpacker {
    buf: Vec<u8>,
}

impl Unpacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
    }

    pub fn unpack(&mut self) -> Result<Value> {
        let mut rd: &[u8] = &self.buf;
        let value = rmpv::decode::read_value(&mut rd)?;
        self.buf.clear();
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Serde bridge
// ---------------------------------------------------------------------------

/// Convert any serializable type into a [`Value`].
pub fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(rmpv::ext::to_value(value)?)
}

/// Convert a [`Value`] into a typed struct.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(rmpv::ext::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Value construction helpers
// ---------------------------------------------------------------------------

/// Build a keyword-argument map from key-value pairs.
pub fn make_kwargs(entries: Vec<(&str, Value)>) -> Vec<(Value, Value)> {
    entries
        .into_iter()
        .map(|(k, v)| (Value::String(k.into()), v))
        .collect()
}

pub fn val_str(s: &str) -> Value {
    Value::String(s.into())
}

pub fn val_bin(data: &[u8]) -> Value {
    Value::Binary(data.to_vec())
}

pub fn val_bool(b: bool) -> Value {
    Value::Boolean(b)
}

pub fn val_u64(n: u64) -> Value {
    Value::Integer(n.into())
}

pub fn val_i64(n: i64) -> Value {
    Value::Integer(n.into())
}

pub fn val_f64(n: f64) -> Value {
    Value::F64(n)
}

// ---------------------------------------------------------------------------
// Value extraction helpers
// ---------------------------------------------------------------------------

/// Extract a string field from a MsgPack map.
pub fn get_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_str())
}

/// Extract a u64 field from a MsgPack map.
pub fn get_u64(map: &[(Value, Value)], key: &str) -> Option<u64> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_u64())
}

/// Extract an i64 field from a MsgPack map.
pub fn get_i64(map: &[(Value, Value)], key: &str) -> Option<i64> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_i64())
}

/// Extract a boolean field from a MsgPack map.
pub fn get_bool(map: &[(Value, Value)], key: &str) -> Option<bool> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_bool())
}

/// Extract a binary field from a MsgPack map.
pub fn get_bin<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [u8]> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_slice())
}

/// Extract an array field from a MsgPack map.
pub fn get_array<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [Value]> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_array())
        .map(|a| a.as_slice())
}

/// Extract a nested map field from a MsgPack map.
pub fn get_map<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [(Value, Value)]> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_map())
        .map(|m| m.as_slice())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let mut packer = Packer::new();
        let mut unpacker = Unpacker::new();

        let value = Value::Map(vec![
            (val_str("name"), val_str("zrpc")),
            (val_str("args"), Value::Array(vec![val_u64(1), val_i64(-2)])),
            (val_str("blob"), val_bin(&[0xde, 0xad])),
            (val_str("pi"), val_f64(3.25)),
        ]);

        let blob = packer.pack(&value).unwrap();
        unpacker.feed(&blob);
        assert_eq!(unpacker.unpack().unwrap(), value);
    }

    #[test]
    fn feed_resets_residue_from_malformed_payload() {
        let mut packer = Packer::new();
        let mut unpacker = Unpacker::new();

        // Truncated blob: a map header claiming entries that never arrive.
        unpacker.feed(&[0x81]);
        assert!(unpacker.unpack().is_err());

        // A fresh feed must decode cleanly despite the failure above.
        let blob = packer.pack(&val_str("ok")).unwrap();
        unpacker.feed(&blob);
        assert_eq!(unpacker.unpack().unwrap(), val_str("ok"));
    }

    #[test]
    fn extraction_helpers() {
        let map = make_kwargs(vec![
            ("name", val_str("foo")),
            ("size", val_u64(42)),
            ("data", val_bin(&[1, 2, 3])),
            ("ok", val_bool(true)),
        ]);

        assert_eq!(get_str(&map, "name"), Some("foo"));
        assert_eq!(get_u64(&map, "size"), Some(42));
        assert_eq!(get_bin(&map, "data"), Some([1u8, 2, 3].as_slice()));
        assert_eq!(get_bool(&map, "ok"), Some(true));
        assert_eq!(get_str(&map, "missing"), None);
    }

    #[test]
    fn serde_bridge_round_trip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let value = to_value(Point { x: 3, y: -4 }).unwrap();
        let back: Point = from_value(value).unwrap();
        assert_eq!(back, Point { x: 3, y: -4 });
    }
}
