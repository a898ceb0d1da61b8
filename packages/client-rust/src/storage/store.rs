//! The unified storage facade.
//!
//! `UnifiedStorage` turns the flat byte backend into a namespaced, typed
//! store: JSON envelopes with metadata, TTL honoured on read with lazy
//! deletion, optional AES-GCM encryption, gzip compression above a size
//! threshold, an LRU read cache, coalesced writes, and a background sweeper.
//!
//! Keys are namespaced strings of the form `namespace:rest`; everything up to
//! the first `:` is the namespace. Keys starting with `_` are reserved for
//! internal records (the wrapped encryption key lives there) and survive a
//! full `clear`.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acube_core::clock::ClockSource;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::crypto::EncryptionService;
use crate::error::{SdkError, StorageError};
use crate::events::{EventBus, SdkEvent};
use crate::storage::backend::StorageBackend;
use crate::storage::cache::LruTtlCache;
use crate::storage::coalescer::{WriteCoalescer, WriteSink};
use crate::storage::entry::{
    EncryptedData, EntryMetadata, QueryOptions, SetOptions, SortBy, SortOrder, StorageEntry,
    StorageStats, ENTRY_SCHEMA_VERSION,
};

/// Shared state between the facade, the coalescer sink, and the sweeper.
struct StorageCore {
    backend: Arc<dyn StorageBackend>,
    encryption: Option<Arc<EncryptionService>>,
    clock: Arc<dyn ClockSource>,
    events: EventBus,
    reads: AtomicU64,
    writes: AtomicU64,
    expired_swept: AtomicU64,
    corrupted_removed: AtomicU64,
}

impl StorageCore {
    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    fn report_error(&self, key: Option<&str>, err: &SdkError) {
        self.events.emit(SdkEvent::StorageError {
            key: key.map(str::to_string),
            error: err.report(self.now()),
        });
    }

    /// Removes a corrupted entry and accounts for it.
    async fn drop_corrupted(&self, key: &str) {
        warn!(key, "removing corrupted storage entry");
        self.corrupted_removed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("storage_corrupted_removed_total").increment(1);
        let _ = self.backend.delete(key).await;
        let err = SdkError::Storage(StorageError::Corrupted { key: key.to_string() });
        self.report_error(Some(key), &err);
    }

    /// Deletes entries whose TTL elapsed. Returns how many were removed.
    async fn sweep_expired(&self) -> u64 {
        let now = self.now();
        let Ok(keys) = self.backend.keys().await else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if key.starts_with('_') {
                continue;
            }
            let Ok(Some(raw)) = self.backend.get(&key).await else {
                continue;
            };
            match serde_json::from_slice::<Value>(&raw) {
                Ok(value) => {
                    let expired = value["metadata"]["expiresAt"]
                        .as_i64()
                        .is_some_and(|at| now >= at);
                    if expired && self.backend.delete(&key).await.unwrap_or(false) {
                        removed += 1;
                    }
                }
                Err(_) => self.drop_corrupted(&key).await,
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired storage entries");
            self.expired_swept.fetch_add(removed, Ordering::Relaxed);
            metrics::counter!("storage_expired_swept_total").increment(removed);
        }
        removed
    }
}

#[async_trait]
impl WriteSink for StorageCore {
    async fn write_many(&self, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        for (key, raw) in writes {
            match self.backend.put(&key, raw.clone()).await {
                Ok(()) => {}
                Err(StorageError::QuotaExceeded) => {
                    // One forced sweep, one retry; a second failure surfaces.
                    warn!(key, "storage quota exceeded, sweeping and retrying");
                    self.sweep_expired().await;
                    if let Err(err) = self.backend.put(&key, raw).await {
                        self.report_error(Some(&key), &SdkError::Storage(err));
                        return Err(StorageError::QuotaExceeded);
                    }
                }
                Err(err) => {
                    self.report_error(Some(&key), &SdkError::Storage(err));
                    return Err(StorageError::BackendUnavailable {
                        reason: format!("write to {key} failed"),
                    });
                }
            }
            self.writes.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("storage_writes_total").increment(1);
        }
        Ok(())
    }
}

/// Namespaced, typed key-value store. See the module docs.
pub struct UnifiedStorage {
    core: Arc<StorageCore>,
    coalescer: WriteCoalescer,
    cache: LruTtlCache<StorageEntry>,
    config: StorageConfig,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UnifiedStorage {
    /// Builds the substrate and starts its background sweeper.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        encryption: Option<Arc<EncryptionService>>,
        clock: Arc<dyn ClockSource>,
        events: EventBus,
        config: StorageConfig,
        cache_size: usize,
        cache_ttl_ms: i64,
    ) -> Arc<Self> {
        let core = Arc::new(StorageCore {
            backend,
            encryption,
            clock,
            events,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            expired_swept: AtomicU64::new(0),
            corrupted_removed: AtomicU64::new(0),
        });
        let coalescer = WriteCoalescer::new(
            core.clone(),
            config.coalesce_window_ms,
            config.coalesce_max_batch,
        );

        let storage = Arc::new(Self {
            core: core.clone(),
            coalescer,
            cache: LruTtlCache::new(cache_size, cache_ttl_ms),
            config,
            sweeper: Mutex::new(None),
        });

        let interval = storage.config.sweep_interval_ms.max(1_000);
        let sweeper_core = core;
        *storage.sweeper.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(interval)).await;
                sweeper_core.sweep_expired().await;
            }
        }));

        storage
    }

    /// Namespace portion of a key (up to the first `:`), or the whole key.
    #[must_use]
    pub fn namespace_of(key: &str) -> &str {
        key.split_once(':').map_or(key, |(ns, _)| ns)
    }

    // -- single-key operations ---------------------------------------------

    /// Serializes and stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// - [`SdkError::EncryptionUnavailable`] when `opts.encrypt` is set but
    ///   no encryption service was supplied.
    /// - [`SdkError::Storage`] when the backend write fails (after the quota
    ///   sweep-and-retry).
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        opts: SetOptions,
    ) -> Result<(), SdkError> {
        let now = self.core.now();
        let data = serde_json::to_value(value)
            .map_err(|err| SdkError::Validation { message: format!("unserializable value: {err}") })?;

        // Overwrites keep the original creation time.
        let created_at = match self.get_entry(key).await? {
            Some(existing) => existing.metadata.created_at,
            None => now,
        };

        let serialized = serde_json::to_vec(&data).map_err(StorageError::from)?;
        let compress =
            opts.compress && serialized.len() > self.config.compression_threshold_bytes;
        let mut stored_data = if compress {
            Value::String(BASE64.encode(gzip(&serialized)?))
        } else {
            data.clone()
        };

        let encrypt = opts.encrypt;
        if encrypt {
            let Some(encryption) = &self.core.encryption else {
                return Err(SdkError::EncryptionUnavailable {
                    reason: "storage encryption requested but not configured".to_string(),
                });
            };
            let plaintext = serde_json::to_vec(&stored_data).map_err(StorageError::from)?;
            let envelope = encryption.encrypt(&plaintext, key)?;
            stored_data = serde_json::to_value(EncryptedData {
                encrypted: true,
                data: envelope,
                version: ENTRY_SCHEMA_VERSION.to_string(),
                timestamp: now,
            })
            .map_err(StorageError::from)?;
        }

        let metadata = EntryMetadata {
            key: key.to_string(),
            created_at,
            updated_at: now,
            expires_at: opts.ttl_ms.map(|ttl| now + ttl),
            encrypted: encrypt,
            compressed: compress,
            version: opts.version.unwrap_or_else(|| ENTRY_SCHEMA_VERSION.to_string()),
        };

        let stored = StorageEntry { data: stored_data, metadata: metadata.clone() };
        let raw = serde_json::to_vec(&stored).map_err(StorageError::from)?;

        // The cache holds the decoded view.
        self.cache
            .insert(key.to_string(), StorageEntry { data, metadata }, now);

        let rx = self
            .coalescer
            .enqueue(key.to_string(), raw)
            .map_err(|_| SdkError::Destroyed)?;
        match rx.await {
            Ok(result) => result.map_err(SdkError::from),
            Err(_) => Err(SdkError::Destroyed),
        }
    }

    /// Reads and deserializes the value at `key`. Expired entries read as
    /// `None` and are lazily deleted.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures and
    /// [`SdkError::Validation`] when the stored value does not match `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SdkError> {
        match self.get_entry(key).await? {
            Some(entry) => serde_json::from_value(entry.data)
                .map(Some)
                .map_err(|err| SdkError::Validation {
                    message: format!("stored value has unexpected shape: {err}"),
                }),
            None => Ok(None),
        }
    }

    /// Reads the full decoded entry at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn get_entry(&self, key: &str) -> Result<Option<StorageEntry>, SdkError> {
        let now = self.core.now();
        self.core.reads.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("storage_reads_total").increment(1);

        if let Some(entry) = self.cache.get(key, now) {
            if entry.metadata.is_expired(now) {
                self.cache.invalidate(key);
                let _ = self.core.backend.delete(key).await;
                return Ok(None);
            }
            return Ok(Some(entry));
        }

        // Reads stay coherent with writes still sitting in the coalescer.
        let raw = match self.coalescer.pending_raw(key) {
            Some(raw) => raw,
            None => match self.core.backend.get(key).await? {
                Some(raw) => raw,
                None => return Ok(None),
            },
        };

        match self.decode(key, &raw) {
            Ok(entry) => {
                if entry.metadata.is_expired(now) {
                    let _ = self.core.backend.delete(key).await;
                    return Ok(None);
                }
                self.cache.insert(key.to_string(), entry.clone(), now);
                Ok(Some(entry))
            }
            Err(err) => {
                debug!(key, %err, "failed to decode entry");
                self.core.drop_corrupted(key).await;
                Ok(None)
            }
        }
    }

    /// Removes `key`. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn delete(&self, key: &str) -> Result<bool, SdkError> {
        // Make sure a pending write cannot resurrect the key after us.
        self.coalescer.flush().await;
        self.cache.invalidate(key);
        Ok(self.core.backend.delete(key).await?)
    }

    /// Whether a live (non-expired) entry exists at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn exists(&self, key: &str) -> Result<bool, SdkError> {
        Ok(self.get_entry(key).await?.is_some())
    }

    // -- bulk operations ---------------------------------------------------

    /// Stores several values. Writes share the coalescer batch.
    ///
    /// # Errors
    ///
    /// Fails on the first failing write.
    pub async fn set_many<T: Serialize>(
        &self,
        items: Vec<(String, T, SetOptions)>,
    ) -> Result<(), SdkError> {
        for (key, value, opts) in items {
            self.set(&key, &value, opts).await?;
        }
        Ok(())
    }

    /// Reads several keys; absent or expired entries come back as `None`.
    ///
    /// # Errors
    ///
    /// Fails on the first backend failure.
    pub async fn get_many<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<T>>, SdkError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Deletes several keys, returning how many existed.
    ///
    /// # Errors
    ///
    /// Fails on the first backend failure.
    pub async fn delete_many(&self, keys: &[String]) -> Result<usize, SdkError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes every entry, or every entry of one namespace. Reserved `_`
    /// keys survive a full clear.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn clear(&self, namespace: Option<&str>) -> Result<usize, SdkError> {
        self.coalescer.flush().await;
        self.cache.clear();

        let keys = self.core.backend.keys().await?;
        let mut removed = 0;
        for key in keys {
            let matches = match namespace {
                Some(ns) => Self::namespace_of(&key) == ns,
                None => !key.starts_with('_'),
            };
            if matches && self.core.backend.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // -- queries -----------------------------------------------------------

    /// Bulk read with filtering, sorting, and pagination.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn query(&self, opts: &QueryOptions) -> Result<Vec<StorageEntry>, SdkError> {
        self.coalescer.flush().await;
        let now = self.core.now();

        let mut entries = Vec::new();
        for key in self.core.backend.keys().await? {
            if key.starts_with('_') {
                continue;
            }
            if let Some(ns) = &opts.namespace {
                if Self::namespace_of(&key) != ns {
                    continue;
                }
            }
            if let Some(prefix) = &opts.prefix {
                if !key.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            let Some(raw) = self.core.backend.get(&key).await? else {
                continue;
            };
            match self.decode(&key, &raw) {
                Ok(entry) => {
                    if !opts.include_expired && entry.metadata.is_expired(now) {
                        let _ = self.core.backend.delete(&key).await;
                        continue;
                    }
                    entries.push(entry);
                }
                Err(_) => self.core.drop_corrupted(&key).await,
            }
        }

        entries.sort_by(|a, b| {
            let ord = match opts.sort_by {
                SortBy::Key => a.metadata.key.cmp(&b.metadata.key),
                SortBy::CreatedAt => a.metadata.created_at.cmp(&b.metadata.created_at),
                SortBy::UpdatedAt => a.metadata.updated_at.cmp(&b.metadata.updated_at),
            };
            match opts.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let end = opts
            .limit
            .map_or(entries.len(), |limit| (opts.offset + limit).min(entries.len()));
        let start = opts.offset.min(entries.len());
        Ok(entries[start..end].to_vec())
    }

    /// Keys of all live entries matching `opts`.
    ///
    /// # Errors
    ///
    /// See [`UnifiedStorage::query`].
    pub async fn keys(&self, opts: &QueryOptions) -> Result<Vec<String>, SdkError> {
        Ok(self.query(opts).await?.into_iter().map(|e| e.metadata.key).collect())
    }

    /// Values of all live entries matching `opts`.
    ///
    /// # Errors
    ///
    /// See [`UnifiedStorage::query`].
    pub async fn values(&self, opts: &QueryOptions) -> Result<Vec<Value>, SdkError> {
        Ok(self.query(opts).await?.into_iter().map(|e| e.data).collect())
    }

    /// `(key, value)` pairs of all live entries matching `opts`.
    ///
    /// # Errors
    ///
    /// See [`UnifiedStorage::query`].
    pub async fn entries(&self, opts: &QueryOptions) -> Result<Vec<(String, Value)>, SdkError> {
        Ok(self
            .query(opts)
            .await?
            .into_iter()
            .map(|e| (e.metadata.key, e.data))
            .collect())
    }

    /// Number of live entries matching `opts`.
    ///
    /// # Errors
    ///
    /// See [`UnifiedStorage::query`].
    pub async fn count(&self, opts: &QueryOptions) -> Result<usize, SdkError> {
        Ok(self.query(opts).await?.len())
    }

    // -- maintenance -------------------------------------------------------

    /// Current counters plus a backend size estimate.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn stats(&self) -> Result<StorageStats, SdkError> {
        let keys = self.core.backend.keys().await?;
        Ok(StorageStats {
            entry_count: keys.iter().filter(|k| !k.starts_with('_')).count(),
            total_bytes: self.core.backend.estimated_bytes().await?,
            reads: self.core.reads.load(Ordering::Relaxed),
            writes: self.core.writes.load(Ordering::Relaxed),
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
            expired_swept: self.core.expired_swept.load(Ordering::Relaxed),
            corrupted_removed: self.core.corrupted_removed.load(Ordering::Relaxed),
        })
    }

    /// Cache hit rate in `[0, 1]`.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        self.cache.hit_rate()
    }

    /// Flush pending writes, sweep expired entries, drop the read cache.
    pub async fn optimize(&self) {
        self.coalescer.flush().await;
        self.core.sweep_expired().await;
        self.cache.clear();
    }

    /// Pushes pending coalesced writes to the backend.
    pub async fn flush(&self) {
        self.coalescer.flush().await;
    }

    /// Stops background work and rejects further writes.
    pub async fn destroy(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        self.coalescer.destroy().await;
        self.cache.clear();
    }

    // -- codec -------------------------------------------------------------

    /// Decodes raw bytes into the plaintext entry view.
    fn decode(&self, key: &str, raw: &[u8]) -> Result<StorageEntry, SdkError> {
        let stored: StorageEntry = serde_json::from_slice(raw).map_err(StorageError::from)?;
        let mut data = stored.data;

        if stored.metadata.encrypted {
            let Some(encryption) = &self.core.encryption else {
                return Err(SdkError::EncryptionUnavailable {
                    reason: "entry is encrypted but no encryption service is configured"
                        .to_string(),
                });
            };
            let envelope: EncryptedData =
                serde_json::from_value(data).map_err(StorageError::from)?;
            let plaintext = encryption.decrypt(&envelope.data, key)?;
            data = serde_json::from_slice(&plaintext).map_err(StorageError::from)?;
        }

        if stored.metadata.compressed {
            let encoded = data.as_str().ok_or_else(|| SdkError::Validation {
                message: "compressed entry is not a base64 string".to_string(),
            })?;
            let packed = BASE64.decode(encoded).map_err(|_| SdkError::Validation {
                message: "compressed entry is not valid base64".to_string(),
            })?;
            data = serde_json::from_slice(&gunzip(&packed)?).map_err(StorageError::from)?;
        }

        Ok(StorageEntry { data, metadata: stored.metadata })
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, SdkError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(StorageError::from)?;
    Ok(encoder.finish().map_err(StorageError::from)?)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, SdkError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(StorageError::from)?;
    Ok(out)
}
