//! Cache Entry Types
//!
//! Defines cache keys, cached values, and the framing used to store values
//! on the remote tier.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used when joining composite key parts
pub const KEY_PART_SEPARATOR: char = ':';

/// Remote frame tag for the cached null marker
const TAG_NULL: u8 = 0x00;
/// Remote frame tag for a present value
const TAG_VALUE: u8 = 0x01;

// =============================================================================
// Cache Key
// =============================================================================

/// Canonical string form of an application-level cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key from its canonical form
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Create a composite key by joining parts with `:`
    pub fn from_parts<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: fmt::Display,
    {
        let joined = parts
            .into_iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(&KEY_PART_SEPARATOR.to_string());
        Self(joined)
    }

    /// Get the canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&String> for CacheKey {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

// =============================================================================
// Cache Value
// =============================================================================

/// A value held by either tier
///
/// `Null` is the cached "no value" marker and is only ever stored when the
/// cache allows null values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Value(Bytes),
    Null,
}

impl CacheValue {
    /// Wrap an optional payload, `None` becoming the null marker
    pub fn from_option(value: Option<Bytes>) -> Self {
        match value {
            Some(bytes) => CacheValue::Value(bytes),
            None => CacheValue::Null,
        }
    }

    /// Check if this is the null marker
    pub fn is_null(&self) -> bool {
        matches!(self, CacheValue::Null)
    }

    /// Get the payload, if any
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            CacheValue::Value(bytes) => Some(bytes),
            CacheValue::Null => None,
        }
    }

    /// Convert into the payload, the null marker becoming `None`
    pub fn into_option(self) -> Option<Bytes> {
        match self {
            CacheValue::Value(bytes) => Some(bytes),
            CacheValue::Null => None,
        }
    }

    /// Encode for the remote tier: one tag byte then the payload
    pub fn encode(&self) -> Bytes {
        match self {
            CacheValue::Null => Bytes::from_static(&[TAG_NULL]),
            CacheValue::Value(bytes) => {
                let mut buf = BytesMut::with_capacity(bytes.len() + 1);
                buf.put_u8(TAG_VALUE);
                buf.put_slice(bytes);
                buf.freeze()
            }
        }
    }

    /// Decode a remote frame
    pub fn decode(frame: Bytes) -> Result<Self> {
        match frame.first() {
            Some(&TAG_NULL) if frame.len() == 1 => Ok(CacheValue::Null),
            Some(&TAG_VALUE) => Ok(CacheValue::Value(frame.slice(1..))),
            Some(tag) => Err(Error::Decode(format!(
                "unknown frame tag {:#04x} ({} bytes)",
                tag,
                frame.len()
            ))),
            None => Err(Error::Decode("empty frame".into())),
        }
    }
}

impl From<Bytes> for CacheValue {
    fn from(bytes: Bytes) -> Self {
        CacheValue::Value(bytes)
    }
}

impl From<&'static str> for CacheValue {
    fn from(s: &'static str) -> Self {
        CacheValue::Value(Bytes::from_static(s.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_forms() {
        let key = CacheKey::from("order:1");
        assert_eq!(key.as_str(), "order:1");
        assert_eq!(key.to_string(), "order:1");

        let composite = CacheKey::from_parts(["order", "42", "v2"]);
        assert_eq!(composite.as_str(), "order:42:v2");

        let numeric = CacheKey::from_parts([1, 2, 3]);
        assert_eq!(numeric.as_str(), "1:2:3");
    }

    #[test]
    fn test_value_frames() {
        let value = CacheValue::from(Bytes::from("hello"));
        let frame = value.encode();
        assert_eq!(&frame[..], b"\x01hello");
        assert_eq!(CacheValue::decode(frame).unwrap(), value);

        let null = CacheValue::Null;
        assert_eq!(CacheValue::decode(null.encode()).unwrap(), CacheValue::Null);

        // An empty payload is still a value, not the null marker
        let empty = CacheValue::Value(Bytes::new());
        assert_eq!(CacheValue::decode(empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(CacheValue::decode(Bytes::new()).is_err());
        assert!(CacheValue::decode(Bytes::from_static(b"\x07abc")).is_err());
        assert!(CacheValue::decode(Bytes::from_static(b"\x00trailing")).is_err());
    }

    #[test]
    fn test_value_accessors() {
        let value = CacheValue::from("data");
        assert!(!value.is_null());
        assert_eq!(value.as_bytes(), Some(&Bytes::from("data")));
        assert_eq!(value.into_option(), Some(Bytes::from("data")));

        assert!(CacheValue::from_option(None).is_null());
        assert_eq!(CacheValue::Null.into_option(), None);
    }
}
