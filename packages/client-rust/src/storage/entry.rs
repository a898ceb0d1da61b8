//! Persisted entry layout.
//!
//! Every on-disk entry is the JSON object `{data, metadata}`. Encrypted
//! entries replace `data` with an envelope carrying the ciphertext; compressed
//! entries replace it with the base64 of the gzipped JSON. The metadata flags
//! record which transformations were applied so reads can undo them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::CipherEnvelope;

/// Schema version written into every entry.
pub const ENTRY_SCHEMA_VERSION: &str = "1.0.0";

/// Metadata stored alongside every value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Full namespaced key, duplicated into the entry for recovery scans.
    pub key: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub encrypted: bool,
    pub compressed: bool,
    pub version: String,
}

impl EntryMetadata {
    /// True once `now` has reached the expiry instant.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A decoded storage entry: plaintext, decompressed `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    pub data: Value,
    pub metadata: EntryMetadata,
}

/// The `data` field of an encrypted entry as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedData {
    /// Always true; distinguishes the envelope from plain object payloads.
    pub encrypted: bool,
    pub data: CipherEnvelope,
    pub version: String,
    pub timestamp: i64,
}

/// Options for a single `set` call.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Time-to-live from now, milliseconds.
    pub ttl_ms: Option<i64>,
    /// Encrypt the payload at rest. Requires an encryption service.
    pub encrypt: bool,
    /// Compress when the serialized payload crosses the configured threshold.
    pub compress: bool,
    /// Entry schema version override.
    pub version: Option<String>,
}

/// Sort key for [`QueryOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Key,
    CreatedAt,
    UpdatedAt,
}

/// Sort direction for [`QueryOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filters for bulk reads.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Key prefix, applied after namespacing.
    pub prefix: Option<String>,
    /// Restrict to one namespace.
    pub namespace: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    /// Include entries whose TTL elapsed instead of treating them as absent.
    pub include_expired: bool,
}

/// Counters reported by `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub expired_swept: u64,
    pub corrupted_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_expiry() {
        let meta = EntryMetadata {
            key: "ns:k".into(),
            created_at: 0,
            updated_at: 0,
            expires_at: Some(100),
            encrypted: false,
            compressed: false,
            version: ENTRY_SCHEMA_VERSION.into(),
        };
        assert!(!meta.is_expired(99));
        assert!(meta.is_expired(100));

        let no_ttl = EntryMetadata { expires_at: None, ..meta };
        assert!(!no_ttl.is_expired(i64::MAX));
    }

    #[test]
    fn entry_json_layout() {
        let entry = StorageEntry {
            data: serde_json::json!({"v": 1}),
            metadata: EntryMetadata {
                key: "app:counter".into(),
                created_at: 10,
                updated_at: 20,
                expires_at: None,
                encrypted: false,
                compressed: true,
                version: ENTRY_SCHEMA_VERSION.into(),
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["metadata"]["key"], "app:counter");
        assert_eq!(json["metadata"]["createdAt"], 10);
        assert_eq!(json["metadata"]["compressed"], true);
        assert_eq!(json["metadata"]["version"], "1.0.0");
        assert!(json["metadata"].get("expiresAt").is_none());
    }
}
