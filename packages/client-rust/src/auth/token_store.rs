//! Encrypted persistence of the active token record.
//!
//! Exactly one [`TokenRecord`] lives under the configured storage key
//! (`acube_auth` by default), encrypted at rest when storage encryption is
//! on. The latest record is also cached in process memory for fast reads and
//! invalidated on every mutation.
//!
//! A platform may additionally mirror the raw tokens into a secure enclave
//! (OS keychain, secure keystore) through [`SecureEnclaveHook`]; that path is
//! best-effort and never fails the primary one.

use std::collections::BTreeSet;
use std::sync::Arc;

use acube_core::clock::ClockSource;
use acube_core::roles::Role;
use acube_core::types::{TokenRecord, UserRecord};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::auth::jwt;
use crate::error::SdkError;
use crate::storage::backend::StorageBackend;
use crate::storage::entry::SetOptions;
use crate::storage::UnifiedStorage;

/// Key used by the previous SDK generation for its token blob.
pub const LEGACY_TOKEN_KEY: &str = "ereceipt_auth_token";

/// Optional platform hardening: mirror tokens into an OS-level secure store.
#[async_trait]
pub trait SecureEnclaveHook: Send + Sync + 'static {
    /// Store or replace the mirrored tokens.
    async fn store(&self, access_token: &str, refresh_token: &str) -> anyhow::Result<()>;

    /// Remove the mirrored tokens.
    async fn clear(&self) -> anyhow::Result<()>;
}

/// Partial update applied by [`TokenStore::update`].
#[derive(Debug, Clone, Default)]
pub struct TokenPatch {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub user: Option<UserRecord>,
}

/// Summary returned by [`TokenStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStoreStats {
    pub present: bool,
    pub expires_at: Option<i64>,
    pub encrypted: bool,
}

/// Legacy on-disk blob: `{token, refreshToken?, expiresAt?}` with the user
/// only recoverable from the JWT itself.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

/// Storage for the single active token record.
pub struct TokenStore {
    storage: Arc<UnifiedStorage>,
    /// Raw backend handle, used only for legacy migration.
    backend: Arc<dyn StorageBackend>,
    key: String,
    encrypt: bool,
    cache: RwLock<Option<TokenRecord>>,
    enclave: Option<Arc<dyn SecureEnclaveHook>>,
    clock: Arc<dyn ClockSource>,
}

impl TokenStore {
    #[must_use]
    pub fn new(
        storage: Arc<UnifiedStorage>,
        backend: Arc<dyn StorageBackend>,
        key: String,
        encrypt: bool,
        enclave: Option<Arc<dyn SecureEnclaveHook>>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            storage,
            backend,
            key,
            encrypt,
            cache: RwLock::new(None),
            enclave,
            clock,
        }
    }

    /// Runs the legacy migration: a blob under [`LEGACY_TOKEN_KEY`] in the
    /// raw backend is re-stored in the current format and removed.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures. An unreadable
    /// legacy blob is dropped, not surfaced.
    pub async fn init(&self) -> Result<(), SdkError> {
        let Some(raw) = self.backend.get(LEGACY_TOKEN_KEY).await? else {
            return Ok(());
        };

        match serde_json::from_slice::<LegacyRecord>(&raw)
            .ok()
            .and_then(|legacy| self.record_from_legacy(&legacy))
        {
            Some(record) => {
                info!("migrating legacy token record to current layout");
                self.store(record).await?;
            }
            None => warn!("legacy token record unreadable, dropping it"),
        }
        self.backend.delete(LEGACY_TOKEN_KEY).await?;
        Ok(())
    }

    /// Rebuilds a full record from the legacy blob, recovering the user from
    /// the JWT claims.
    fn record_from_legacy(&self, legacy: &LegacyRecord) -> Option<TokenRecord> {
        let claims = jwt::parse_unverified(&legacy.token).ok()?;
        let roles = jwt::normalize_roles(claims.roles.as_ref());
        let roles = if roles.is_empty() {
            BTreeSet::from([Role::Cashier])
        } else {
            roles
        };
        let now = self.clock.now_ms();

        Some(TokenRecord {
            access_token: legacy.token.clone(),
            refresh_token: legacy.refresh_token.clone(),
            expires_at: legacy
                .expires_at
                .or_else(|| claims.expires_at_ms())
                .unwrap_or(now),
            token_type: "Bearer".to_string(),
            user: UserRecord {
                id: claims.sub.clone().unwrap_or_default(),
                email: claims.email.clone().unwrap_or_default(),
                name: String::new(),
                roles,
                permissions: Vec::new(),
                merchant_id: claims.merchant_id.clone(),
                cashier_id: claims.cashier_id.clone(),
                point_of_sale_id: claims.point_of_sale_id.clone(),
                session_id: uuid::Uuid::new_v4().to_string(),
                last_login: now,
                attributes: Value::Null,
            },
            device_id: uuid::Uuid::new_v4().to_string(),
            encrypted_at: 0,
            version: TokenRecord::SCHEMA_VERSION.to_string(),
        })
    }

    /// Persists `record` (encrypted when enabled), refreshes the memory
    /// cache, and mirrors the tokens into the enclave best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] / [`SdkError::EncryptionUnavailable`]
    /// from the substrate. Enclave failures are logged, never surfaced.
    pub async fn store(&self, mut record: TokenRecord) -> Result<(), SdkError> {
        record.encrypted_at = self.clock.now_ms();
        record.version = TokenRecord::SCHEMA_VERSION.to_string();

        self.storage
            .set(
                &self.key,
                &record,
                SetOptions { encrypt: self.encrypt, ..SetOptions::default() },
            )
            .await?;

        if let Some(enclave) = &self.enclave {
            if let Err(err) = enclave.store(&record.access_token, &record.refresh_token).await {
                warn!(%err, "secure enclave store failed, continuing with primary storage");
            }
        }

        *self.cache.write() = Some(record);
        Ok(())
    }

    /// The active record, or `None` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn retrieve(&self) -> Result<Option<TokenRecord>, SdkError> {
        let now = self.clock.now_ms();
        Ok(self.retrieve_stale().await?.filter(|record| !record.is_expired(now)))
    }

    /// The active record even when the access token already expired. Used by
    /// session restoration to reach the refresh token.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn retrieve_stale(&self) -> Result<Option<TokenRecord>, SdkError> {
        if let Some(record) = self.cache.read().clone() {
            return Ok(Some(record));
        }

        let record: Option<TokenRecord> = self.storage.get(&self.key).await?;
        if let Some(record) = &record {
            *self.cache.write() = Some(record.clone());
        }
        Ok(record)
    }

    /// Applies a partial update to the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::NotFound`] when no record exists, otherwise the
    /// substrate errors of [`TokenStore::store`].
    pub async fn update(&self, patch: TokenPatch) -> Result<TokenRecord, SdkError> {
        let Some(mut record) = self.retrieve_stale().await? else {
            return Err(SdkError::NotFound { what: "token record".to_string() });
        };

        if let Some(access_token) = patch.access_token {
            record.access_token = access_token;
        }
        if let Some(refresh_token) = patch.refresh_token {
            record.refresh_token = refresh_token;
        }
        if let Some(expires_at) = patch.expires_at {
            record.expires_at = expires_at;
        }
        if let Some(user) = patch.user {
            record.user = user;
        }

        self.store(record.clone()).await?;
        Ok(record)
    }

    /// Removes the record from storage, the memory cache, and the enclave.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn clear(&self) -> Result<(), SdkError> {
        *self.cache.write() = None;
        self.storage.delete(&self.key).await?;
        if let Some(enclave) = &self.enclave {
            if let Err(err) = enclave.clear().await {
                warn!(%err, "secure enclave clear failed");
            }
        }
        Ok(())
    }

    /// Whether a live (non-expired) record exists.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn exists(&self) -> Result<bool, SdkError> {
        Ok(self.retrieve().await?.is_some())
    }

    /// Presence and expiry summary.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn stats(&self) -> Result<TokenStoreStats, SdkError> {
        let record = self.retrieve_stale().await?;
        Ok(TokenStoreStats {
            present: record.is_some(),
            expires_at: record.map(|r| r.expires_at),
            encrypted: self.encrypt,
        })
    }
}
