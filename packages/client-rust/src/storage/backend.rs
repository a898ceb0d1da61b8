//! Storage backend trait.
//!
//! The innermost storage layer: a flat byte-oriented key-value store. The
//! substrate above it owns namespacing, TTL, caching, encryption, and
//! compression; backends only promise atomic single-key writes, coherent
//! read-after-write within the process, and (except for the in-memory
//! backend) durability across restarts.
//!
//! Used as `Arc<dyn StorageBackend>`.

use async_trait::async_trait;

use crate::error::StorageError;

/// Flat byte-oriented key-value store.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Identifier for logs and stats (e.g. `"memory"`, `"file"`).
    fn name(&self) -> &'static str;

    /// Insert or replace the value at `key`. Must be atomic per key.
    async fn put(&self, key: &str, raw: Vec<u8>) -> Result<(), StorageError>;

    /// Read the value at `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove the value at `key`. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys currently stored, in no particular order.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Total stored payload bytes, best-effort.
    async fn estimated_bytes(&self) -> Result<u64, StorageError>;
}
