//! SDK facade: builds and owns the whole component graph.
//!
//! Construction follows dependency injection: the embedder may supply the
//! storage backend, network transport, access-control collaborator, secure
//! enclave hook, and clock; everything left unset falls back to the built-in
//! implementation (in-memory storage, `reqwest` transport, allow-all local
//! access control, system clock).

use std::sync::Arc;

use acube_core::clock::{ClockSource, SystemClock};
use acube_core::planner::{BatchPlanner, PlannerConfig};
use acube_core::types::UserRecord;
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::auth::permissions::{
    AccessControl, PermissionDecision, PermissionEngine, PermissionEngineConfig, PermissionRequest,
};
use crate::auth::token_manager::{TokenManager, TokenManagerConfig};
use crate::auth::token_store::{SecureEnclaveHook, TokenStore};
use crate::auth::{AuthDeps, AuthService, AuthServiceConfig};
use crate::config::SdkConfig;
use crate::crypto::EncryptionService;
use crate::error::SdkError;
use crate::events::{EventBus, SdkEvent};
use crate::http::{AuthTransport, ReqwestTransport};
use crate::storage::backend::StorageBackend;
use crate::storage::backends::memory::MemoryBackend;
use crate::storage::UnifiedStorage;
use crate::sync::analytics::{Analytics, CacheHitRates};
use crate::sync::breaker::CircuitBreakerRegistry;
use crate::sync::conflicts::ConflictResolverRuntime;
use crate::sync::orchestrator::{OrchestratorDeps, QueueOrchestrator};
use crate::sync::queue::PersistentQueue;

/// Default [`AccessControl`]: grants everything and mints local session ids.
/// Suitable for headless tools and tests; production embedders supply their
/// own collaborator.
pub struct LocalAccessControl;

#[async_trait]
impl AccessControl for LocalAccessControl {
    async fn check(&self, _request: &PermissionRequest) -> anyhow::Result<PermissionDecision> {
        Ok(PermissionDecision {
            granted: true,
            reason: "local access control grants all".to_string(),
            requires_approval: false,
        })
    }

    async fn create_session(&self, _user: &UserRecord) -> anyhow::Result<String> {
        Ok(format!("local-{}", Uuid::new_v4()))
    }

    async fn end_session(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Step-wise construction of an [`AcubeSdk`].
pub struct SdkBuilder {
    config: SdkConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    transport: Option<Arc<dyn AuthTransport>>,
    access: Option<Arc<dyn AccessControl>>,
    enclave: Option<Arc<dyn SecureEnclaveHook>>,
    clock: Option<Arc<dyn ClockSource>>,
    encryption_secret: Option<String>,
}

impl SdkBuilder {
    #[must_use]
    pub fn new(config: SdkConfig) -> Self {
        Self {
            config,
            backend: None,
            transport: None,
            access: None,
            enclave: None,
            clock: None,
            encryption_secret: None,
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn AuthTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = Some(access);
        self
    }

    #[must_use]
    pub fn with_enclave(mut self, enclave: Arc<dyn SecureEnclaveHook>) -> Self {
        self.enclave = Some(enclave);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Secret the storage encryption key is derived from. Required when
    /// `auth.storage_encryption` is on.
    #[must_use]
    pub fn with_encryption_secret(mut self, secret: impl Into<String>) -> Self {
        self.encryption_secret = Some(secret.into());
        self
    }

    /// Validates the configuration and assembles the component graph.
    ///
    /// # Errors
    ///
    /// - [`SdkError::Validation`] for a rejected configuration.
    /// - [`SdkError::EncryptionUnavailable`] when encryption is on but no
    ///   secret was provided.
    /// - [`SdkError::Storage`] when startup recovery fails.
    pub async fn build(self) -> Result<AcubeSdk, SdkError> {
        self.config.validate()?;
        let config = self.config;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let backend = self.backend.unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let events = EventBus::new();

        let encryption = if config.auth.storage_encryption {
            let Some(secret) = &self.encryption_secret else {
                return Err(SdkError::EncryptionUnavailable {
                    reason: "storage encryption enabled but no secret provided".to_string(),
                });
            };
            Some(Arc::new(EncryptionService::init(secret, backend.as_ref()).await?))
        } else {
            None
        };

        let storage = UnifiedStorage::new(
            backend.clone(),
            encryption,
            clock.clone(),
            events.clone(),
            config.storage.clone(),
            config.performance.storage_cache_size,
            config.performance.storage_cache_ttl_ms,
        );

        let transport: Arc<dyn AuthTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(
                config.timeout_ms(),
                config.custom_headers.clone(),
                config.retry_attempts.unwrap_or(0),
            )?),
        };
        let access: Arc<dyn AccessControl> =
            self.access.unwrap_or_else(|| Arc::new(LocalAccessControl));

        let token_store = Arc::new(TokenStore::new(
            storage.clone(),
            backend,
            config.auth.storage_key.clone(),
            config.auth.storage_encryption,
            self.enclave,
            clock.clone(),
        ));
        let token_manager = TokenManager::new(
            transport.clone(),
            Some(token_store.clone()),
            TokenManagerConfig {
                refresh_url: config.refresh_url(),
                refresh_buffer_ms: config.auth.token_refresh_buffer_ms,
                max_refresh_attempts: config.auth.max_refresh_attempts,
                base_delay_ms: config.queue.retry_base_delay_ms,
                max_delay_ms: config.queue.retry_max_delay_ms,
                rotation_warning: config.auth.enable_token_rotation,
            },
            events.clone(),
            clock.clone(),
        );
        let permissions = PermissionEngine::new(
            access.clone(),
            PermissionEngineConfig {
                cache_size: config.performance.permission_cache_size,
                cache_ttl_ms: config.performance.permission_cache_ttl_ms,
                max_batch_size: config.performance.max_batch_size,
                batch_timeout_ms: config.performance.batch_timeout_ms,
            },
            clock.clone(),
        );
        let auth = AuthService::new(
            AuthDeps {
                transport,
                token_manager: token_manager.clone(),
                token_store,
                permissions: permissions.clone(),
                access,
                storage: storage.clone(),
                events: events.clone(),
                clock: clock.clone(),
            },
            AuthServiceConfig {
                login_url: config.login_url(),
                logout_url: config.logout_url(),
            },
        );

        let queue = Arc::new(PersistentQueue::new(
            storage.clone(),
            config.queue.max_size,
            config.queue.max_retries,
            config.queue.persist_queue,
            clock.clone(),
            events.clone(),
        ));
        let breaker = Arc::new(CircuitBreakerRegistry::new(
            config.breaker.clone(),
            clock.clone(),
            events.clone(),
        ));
        let conflicts = ConflictResolverRuntime::new(
            config.queue.default_conflict_resolution,
            config.queue.stale_threshold_ms,
            config.queue.manual_resolution_timeout_ms,
            clock.clone(),
            events.clone(),
        );
        let analytics = Arc::new(Analytics::new(
            clock.clone(),
            i64::try_from(config.breaker.monitoring_window_ms).unwrap_or(60_000),
        ));
        let orchestrator = QueueOrchestrator::new(
            OrchestratorDeps {
                queue: queue.clone(),
                breaker,
                conflicts: conflicts.clone(),
                analytics,
                events: events.clone(),
                clock,
            },
            BatchPlanner::new(PlannerConfig {
                max_items_per_batch: config.queue.batch_size,
                ..PlannerConfig::default()
            }),
            config.queue.clone(),
        );
        {
            let storage = storage.clone();
            let permissions = permissions.clone();
            orchestrator.set_hit_rate_source(Box::new(move || CacheHitRates {
                permissions: permissions.cache_hit_rate(),
                storage: storage.cache_hit_rate(),
            }));
        }

        // Startup recovery: reload persisted items, demote crashed ones.
        queue.init().await?;
        orchestrator.start();
        if config.debug {
            info!(
                environment = ?config.environment(),
                api_url = %config.api_url(),
                auth_url = %config.auth_url(),
                "SDK assembled"
            );
        }

        Ok(AcubeSdk {
            config,
            events,
            storage,
            auth,
            token_manager,
            permissions,
            conflicts,
            orchestrator,
        })
    }
}

/// The assembled SDK. Cheap to share behind an `Arc`.
pub struct AcubeSdk {
    config: SdkConfig,
    events: EventBus,
    storage: Arc<UnifiedStorage>,
    auth: Arc<AuthService>,
    token_manager: Arc<TokenManager>,
    permissions: Arc<PermissionEngine>,
    conflicts: Arc<ConflictResolverRuntime>,
    orchestrator: Arc<QueueOrchestrator>,
}

impl AcubeSdk {
    #[must_use]
    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<UnifiedStorage> {
        &self.storage
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<QueueOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    #[must_use]
    pub fn conflicts(&self) -> &Arc<ConflictResolverRuntime> {
        &self.conflicts
    }

    /// Opens an event subscription covering every component.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SdkEvent> {
        self.events.subscribe()
    }

    /// The bearer token processors should attach, refreshing it first when
    /// needed.
    pub async fn bearer_token(&self) -> Option<String> {
        self.token_manager.get_access_token().await
    }

    /// Tears the SDK down: stops background tasks and flushes storage.
    pub async fn destroy(&self) {
        self.orchestrator.destroy();
        self.token_manager.destroy();
        self.storage.destroy().await;
    }
}
