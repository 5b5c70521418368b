//! Invalidation Events
//!
//! Messages broadcast on the shared topic whenever a coordinator evicts,
//! clears, or invalidates. Wire shape is JSON:
//!
//! ```text
//! {"cacheName":"orders","entryKey":"order:1"}   drop one entry
//! {"cacheName":"orders"}                        drop the whole cache
//! ```

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Eviction broadcast for one named cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEvictMessage {
    pub cache_name: String,
    /// Absent means the whole cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_key: Option<String>,
}

/// What a received message asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictScope<'a> {
    Entry(&'a str),
    WholeCache,
}

impl CacheEvictMessage {
    /// Create a single-entry eviction
    pub fn evict(cache_name: impl Into<String>, entry_key: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            entry_key: Some(entry_key.into()),
        }
    }

    /// Create a whole-cache eviction
    pub fn clear(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            entry_key: None,
        }
    }

    pub fn scope(&self) -> EvictScope<'_> {
        match &self.entry_key {
            Some(key) => EvictScope::Entry(key),
            None => EvictScope::WholeCache,
        }
    }

    /// Serialize for publishing
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a received payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

impl std::fmt::Display for CacheEvictMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entry_key {
            Some(key) => write!(f, "evict {}::{}", self.cache_name, key),
            None => write!(f, "clear {}", self.cache_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let evict = CacheEvictMessage::evict("orders", "order:1");
        let json = evict.encode().unwrap();
        assert_eq!(&json[..], br#"{"cacheName":"orders","entryKey":"order:1"}"#);

        let clear = CacheEvictMessage::clear("orders");
        assert_eq!(&clear.encode().unwrap()[..], br#"{"cacheName":"orders"}"#);
    }

    #[test]
    fn test_decode_accepts_null_and_missing_key() {
        let missing = CacheEvictMessage::decode(br#"{"cacheName":"orders"}"#).unwrap();
        assert_eq!(missing.scope(), EvictScope::WholeCache);

        let null = CacheEvictMessage::decode(br#"{"cacheName":"orders","entryKey":null}"#).unwrap();
        assert_eq!(null, missing);

        let entry = CacheEvictMessage::decode(br#"{"cacheName":"orders","entryKey":"k"}"#).unwrap();
        assert_eq!(entry.scope(), EvictScope::Entry("k"));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            CacheEvictMessage::decode(b"not json"),
            Err(Error::MalformedMessage(_))
        ));
        assert!(CacheEvictMessage::decode(br#"{"entryKey":"k"}"#).is_err());
        assert!(CacheEvictMessage::decode(br#"{"cacheName":42}"#).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            CacheEvictMessage::evict("orders", "order:1").to_string(),
            "evict orders::order:1"
        );
        assert_eq!(CacheEvictMessage::clear("orders").to_string(), "clear orders");
    }
}
