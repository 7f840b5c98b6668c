//! Cache entries and their persisted form.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// A cached value: structured JSON or opaque bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum CacheValue {
    Json(serde_json::Value),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl CacheValue {
    /// Length of the value as it is persisted, used for budget accounting.
    pub fn encoded_len(&self) -> u64 {
        match self {
            CacheValue::Json(value) => serde_json::to_vec(value)
                .map(|v| v.len() as u64)
                .unwrap_or(0),
            // Persisted as padded base64
            CacheValue::Bytes(bytes) => base64::encoded_len(bytes.len(), true)
                .map(|len| len as u64)
                .unwrap_or(u64::MAX),
        }
    }

    /// Borrow the JSON value, if this is a JSON entry.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            CacheValue::Json(value) => Some(value),
            CacheValue::Bytes(_) => None,
        }
    }

    /// Borrow the raw bytes, if this is a bytes entry.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CacheValue::Bytes(bytes) => Some(bytes),
            CacheValue::Json(_) => None,
        }
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        CacheValue::Json(value)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(bytes: Vec<u8>) -> Self {
        CacheValue::Bytes(bytes)
    }
}

/// A single cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: CacheValue,
    pub created_at: DateTime<Utc>,
    /// Time-to-live in milliseconds; `None` never expires.
    pub ttl_ms: Option<u64>,
    pub size_bytes: u64,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(key: impl Into<String>, value: CacheValue, ttl_ms: Option<u64>) -> Self {
        let key = key.into();
        let size_bytes = key.len() as u64 + value.encoded_len();
        Self {
            key,
            value,
            created_at: Utc::now(),
            ttl_ms,
            size_bytes,
        }
    }

    /// When the entry stops being readable, if it has a TTL.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl_ms.map(|ttl| {
            let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
            self.created_at
                .checked_add_signed(ChronoDuration::milliseconds(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    /// Whether the entry has expired at `now`. A zero TTL is expired at once.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires| expires <= now)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size_counts_key_and_value() {
        // 10 raw bytes persist as 16 base64 characters
        let entry = CacheEntry::new("ab", CacheValue::Bytes(vec![0; 10]), None);
        assert_eq!(entry.size_bytes, 2 + 16);

        let entry = CacheEntry::new("k", json!({"x": 1}).into(), None);
        assert_eq!(entry.size_bytes, 1 + br#"{"x":1}"#.len() as u64);
    }

    #[test]
    fn test_bytes_size_matches_persisted_encoding() {
        let value = CacheValue::Bytes(vec![7; 3]);
        assert_eq!(value.encoded_len(), 4);

        let persisted = serde_json::to_value(&value).unwrap();
        let encoded = persisted["data"].as_str().unwrap();
        assert_eq!(value.encoded_len(), encoded.len() as u64);
    }

    #[test]
    fn test_expiry() {
        let entry = CacheEntry::new("k", json!(1).into(), Some(50));
        assert!(!entry.is_expired(entry.created_at));
        assert!(entry.is_expired(entry.created_at + ChronoDuration::milliseconds(50)));

        let zero = CacheEntry::new("k", json!(1).into(), Some(0));
        assert!(zero.is_expired(zero.created_at));

        let forever = CacheEntry::new("k", json!(1).into(), None);
        assert!(!forever.is_expired(DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn test_bytes_persist_as_base64() {
        let entry = CacheEntry::new("blob", CacheValue::Bytes(b"hi".to_vec()), Some(10));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["value"], json!({"kind": "bytes", "data": "aGk="}));

        let restored: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let entry = CacheEntry::new("k", json!(1).into(), Some(u64::MAX));
        assert!(!entry.is_expired(Utc::now()));
    }
}
