//! SDK configuration: one object, nested sections, environment presets.

use std::collections::HashMap;

use acube_core::conflict::ConflictStrategy;
use serde::{Deserialize, Serialize};

use crate::error::SdkError;

/// Deployment environment, selecting default base URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Sandbox,
    Development,
}

impl Environment {
    /// Default API base URL for this environment.
    #[must_use]
    pub fn api_base_url(self) -> &'static str {
        match self {
            Environment::Production => "https://ereceipts-it.api.acubeapi.com",
            Environment::Sandbox => "https://ereceipts-it-sandbox.api.acubeapi.com",
            Environment::Development => "http://localhost:3000",
        }
    }

    /// Default auth base URL for this environment.
    #[must_use]
    pub fn auth_base_url(self) -> &'static str {
        match self {
            Environment::Production => "https://common.api.acubeapi.com",
            Environment::Sandbox => "https://common-sandbox.api.acubeapi.com",
            Environment::Development => "http://localhost:3001",
        }
    }
}

/// Queue and replay behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_factor: f64,
    /// Upper bound on items pulled per processing tick.
    pub batch_size: usize,
    /// Maximum lifetime of a dispatched batch.
    pub batch_timeout_ms: u64,
    pub processing_interval_ms: u64,
    pub default_conflict_resolution: ConflictStrategy,
    pub persist_queue: bool,
    /// Local data older than the server by more than this is stale.
    pub stale_threshold_ms: i64,
    /// How long a manual conflict waits for user input before the default
    /// resolution is committed.
    pub manual_resolution_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            retry_backoff_factor: 2.0,
            batch_size: 25,
            batch_timeout_ms: 60_000,
            processing_interval_ms: 5_000,
            default_conflict_resolution: ConflictStrategy::ServerWins,
            persist_queue: true,
            stale_threshold_ms: 300_000,
            manual_resolution_timeout_ms: 30_000,
        }
    }
}

/// Per-resource circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_ms: u64,
    /// Width of the rolling window analytics uses to count trips.
    pub monitoring_window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_ms: 30_000,
            monitoring_window_ms: 60_000,
        }
    }
}

/// Authentication and token lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    /// Overrides `<auth_base>/login`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    /// Overrides `<auth_base>/token/refresh`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,
    /// Refresh fires this long before the access token expires.
    pub token_refresh_buffer_ms: i64,
    pub max_refresh_attempts: u32,
    pub session_timeout_ms: u64,
    /// Encrypt the persisted token record.
    pub storage_encryption: bool,
    /// Storage key of the token record.
    pub storage_key: String,
    /// Warn when a refresh response reuses the previous refresh token.
    pub enable_token_rotation: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_url: None,
            refresh_url: None,
            token_refresh_buffer_ms: 300_000,
            max_refresh_attempts: 3,
            session_timeout_ms: 28_800_000,
            storage_encryption: true,
            storage_key: "acube_auth".to_string(),
            enable_token_rotation: true,
        }
    }
}

/// Cache sizing and permission batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    pub permission_cache_size: usize,
    pub permission_cache_ttl_ms: i64,
    pub storage_cache_size: usize,
    pub storage_cache_ttl_ms: i64,
    /// Permission checks for the same user within this window coalesce into
    /// one batch.
    pub batch_timeout_ms: u64,
    pub max_batch_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            permission_cache_size: 500,
            permission_cache_ttl_ms: 300_000,
            storage_cache_size: 256,
            storage_cache_ttl_ms: 60_000,
            batch_timeout_ms: 50,
            max_batch_size: 10,
        }
    }
}

/// Storage substrate tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Payloads above this many serialized bytes are compressed.
    pub compression_threshold_bytes: usize,
    /// Window within which writes to the same key coalesce.
    pub coalesce_window_ms: u64,
    /// Pending-write count that forces an early flush.
    pub coalesce_max_batch: usize,
    pub sweep_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: 4_096,
            coalesce_window_ms: 50,
            coalesce_max_batch: 32,
            sweep_interval_ms: 60_000,
        }
    }
}

/// The single configuration object accepted by the SDK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SdkConfig {
    pub environment: Option<Environment>,
    /// Overrides the environment's API base URL.
    pub api_url: Option<String>,
    /// Overrides the environment's auth base URL.
    pub auth_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub debug: bool,
    pub custom_headers: HashMap<String, String>,
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
    pub auth: AuthConfig,
    pub performance: PerformanceConfig,
    pub storage: StorageConfig,
}

impl SdkConfig {
    /// Default request timeout when `timeout_ms` is unset.
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment.unwrap_or(Environment::Production)
    }

    /// Resolved API base URL.
    #[must_use]
    pub fn api_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| self.environment().api_base_url().to_string())
    }

    /// Resolved auth base URL.
    #[must_use]
    pub fn auth_url(&self) -> String {
        self.auth_url
            .clone()
            .unwrap_or_else(|| self.environment().auth_base_url().to_string())
    }

    /// Resolved login endpoint.
    #[must_use]
    pub fn login_url(&self) -> String {
        self.auth
            .login_url
            .clone()
            .unwrap_or_else(|| format!("{}/login", self.auth_url()))
    }

    /// Resolved refresh endpoint.
    #[must_use]
    pub fn refresh_url(&self) -> String {
        self.auth
            .refresh_url
            .clone()
            .unwrap_or_else(|| format!("{}/token/refresh", self.auth_url()))
    }

    /// Resolved logout endpoint.
    #[must_use]
    pub fn logout_url(&self) -> String {
        format!("{}/logout", self.auth_url())
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(Self::DEFAULT_TIMEOUT_MS)
    }

    /// Rejects configurations that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Validation`] naming the offending option.
    pub fn validate(&self) -> Result<(), SdkError> {
        fn fail(message: impl Into<String>) -> Result<(), SdkError> {
            Err(SdkError::Validation { message: message.into() })
        }

        if self.queue.max_size == 0 {
            return fail("queue.maxSize must be greater than zero");
        }
        if self.queue.batch_size == 0 {
            return fail("queue.batchSize must be greater than zero");
        }
        if self.queue.retry_base_delay_ms > self.queue.retry_max_delay_ms {
            return fail("queue.retryBaseDelayMs exceeds queue.retryMaxDelayMs");
        }
        if self.queue.retry_backoff_factor < 1.0 {
            return fail("queue.retryBackoffFactor must be at least 1.0");
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return fail("breaker thresholds must be greater than zero");
        }
        if self.auth.token_refresh_buffer_ms < 0 {
            return fail("auth.tokenRefreshBufferMs must not be negative");
        }
        if self.auth.storage_key.is_empty() {
            return fail("auth.storageKey must not be empty");
        }
        if self.performance.max_batch_size == 0 {
            return fail("performance.maxBatchSize must be greater than zero");
        }
        if let Some(url) = &self.api_url {
            if url.is_empty() {
                return fail("apiUrl must not be empty when set");
            }
        }
        if let Some(url) = &self.auth_url {
            if url.is_empty() {
                return fail("authUrl must not be empty when set");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SdkConfig::default().validate().unwrap();
    }

    #[test]
    fn environment_presets_resolve_urls() {
        let config = SdkConfig {
            environment: Some(Environment::Sandbox),
            ..SdkConfig::default()
        };
        assert!(config.api_url().contains("sandbox"));
        assert!(config.auth_url().contains("sandbox"));
        assert!(config.login_url().ends_with("/login"));
        assert!(config.refresh_url().ends_with("/token/refresh"));
    }

    #[test]
    fn explicit_urls_override_presets() {
        let config = SdkConfig {
            environment: Some(Environment::Production),
            api_url: Some("https://api.example.test".into()),
            auth_url: Some("https://auth.example.test".into()),
            ..SdkConfig::default()
        };
        assert_eq!(config.api_url(), "https://api.example.test");
        assert_eq!(config.login_url(), "https://auth.example.test/login");
    }

    #[test]
    fn auth_url_overrides_within_section_win() {
        let config = SdkConfig {
            auth: AuthConfig {
                login_url: Some("https://login.example.test/v2/session".into()),
                ..AuthConfig::default()
            },
            ..SdkConfig::default()
        };
        assert_eq!(config.login_url(), "https://login.example.test/v2/session");
    }

    #[test]
    fn validation_rejects_zero_queue_size() {
        let config = SdkConfig {
            queue: QueueConfig { max_size: 0, ..QueueConfig::default() },
            ..SdkConfig::default()
        };
        assert!(matches!(config.validate(), Err(SdkError::Validation { .. })));
    }

    #[test]
    fn validation_rejects_inverted_retry_delays() {
        let config = SdkConfig {
            queue: QueueConfig {
                retry_base_delay_ms: 60_000,
                retry_max_delay_ms: 1_000,
                ..QueueConfig::default()
            },
            ..SdkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_storage_key() {
        let config = SdkConfig {
            auth: AuthConfig { storage_key: String::new(), ..AuthConfig::default() },
            ..SdkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_json_round_trip() {
        let config = SdkConfig {
            environment: Some(Environment::Development),
            debug: true,
            ..SdkConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: SdkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let back: SdkConfig = serde_json::from_str(r#"{"environment":"sandbox"}"#).unwrap();
        assert_eq!(back.environment, Some(Environment::Sandbox));
        assert_eq!(back.queue.max_size, QueueConfig::default().max_size);
    }
}
