//! In-memory [`StorageBackend`] backed by [`DashMap`].
//!
//! Non-durable by design: data lives for the process lifetime. Suitable for
//! tests, headless tools, and as the explicit opt-out of persistence. An
//! optional byte quota makes the backend useful for exercising the
//! quota-exceeded recovery path.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StorageError;
use crate::storage::backend::StorageBackend;

/// In-memory storage with an optional total-bytes quota.
pub struct MemoryBackend {
    entries: DashMap<String, Vec<u8>>,
    total_bytes: AtomicU64,
    quota_bytes: Option<u64>,
}

impl MemoryBackend {
    /// Creates an unbounded in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            quota_bytes: None,
        }
    }

    /// Creates a backend that rejects writes once `quota_bytes` of payload
    /// would be stored.
    #[must_use]
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            quota_bytes: Some(quota_bytes),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, raw: Vec<u8>) -> Result<(), StorageError> {
        let new_len = raw.len() as u64;
        let old_len = self.entries.get(key).map_or(0, |e| e.value().len() as u64);

        if let Some(quota) = self.quota_bytes {
            let projected = self.total_bytes.load(Ordering::SeqCst) - old_len + new_len;
            if projected > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }

        self.entries.insert(key.to_string(), raw);
        self.total_bytes.fetch_add(new_len, Ordering::SeqCst);
        self.total_bytes.fetch_sub(old_len, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match self.entries.remove(key) {
            Some((_, raw)) => {
                self.total_bytes.fetch_sub(raw.len() as u64, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn estimated_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.total_bytes.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let backend = MemoryBackend::new();

        backend.put("k1", b"value".to_vec()).await.unwrap();
        assert_eq!(backend.get("k1").await.unwrap(), Some(b"value".to_vec()));

        assert!(backend.delete("k1").await.unwrap());
        assert_eq!(backend.get("k1").await.unwrap(), None);
        assert!(!backend.delete("k1").await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_keeps_latest() {
        let backend = MemoryBackend::new();
        backend.put("k", b"one".to_vec()).await.unwrap();
        backend.put("k", b"two".to_vec()).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn keys_and_clear() {
        let backend = MemoryBackend::new();
        backend.put("a", vec![1]).await.unwrap();
        backend.put("b", vec![2]).await.unwrap();

        let mut keys = backend.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        backend.clear().await.unwrap();
        assert!(backend.keys().await.unwrap().is_empty());
        assert_eq!(backend.estimated_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn quota_rejects_oversized_writes() {
        let backend = MemoryBackend::with_quota(10);
        backend.put("a", vec![0; 8]).await.unwrap();

        let err = backend.put("b", vec![0; 8]).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded));

        // Replacing an existing key only counts the delta.
        backend.put("a", vec![0; 10]).await.unwrap();
        assert_eq!(backend.estimated_bytes().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn quota_frees_space_on_delete() {
        let backend = MemoryBackend::with_quota(10);
        backend.put("a", vec![0; 10]).await.unwrap();
        assert!(matches!(
            backend.put("b", vec![0; 1]).await.unwrap_err(),
            StorageError::QuotaExceeded
        ));

        backend.delete("a").await.unwrap();
        backend.put("b", vec![0; 1]).await.unwrap();
    }
}
