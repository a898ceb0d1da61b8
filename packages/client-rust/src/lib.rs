//! A-Cube e-receipt SDK client -- offline-first operation queue, auth
//! lifecycle, and unified storage over pluggable backends.
//!
//! Assemble an [`AcubeSdk`] through [`SdkBuilder`], register a
//! [`Processor`](sync::Processor) per resource/operation pair, and hand
//! operations to the queue; they dispatch immediately while online and are
//! persisted and replayed otherwise.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod http;
pub mod sdk;
pub mod storage;
pub mod sync;

pub use auth::{
    AccessControl, AuthService, AuthState, Credentials, LogoutOptions, PermissionDecision,
    PermissionEngine, PermissionRequest, SecureEnclaveHook, TokenManager, TokenStore,
};
pub use config::{
    AuthConfig, BreakerConfig, Environment, PerformanceConfig, QueueConfig, SdkConfig,
    StorageConfig,
};
pub use error::{ErrorCode, ErrorReport, SdkError, StorageError};
pub use events::{EventBus, SdkEvent};
pub use http::{AuthTransport, HttpResponse, ReqwestTransport};
pub use sdk::{AcubeSdk, LocalAccessControl, SdkBuilder};
pub use storage::{
    FileBackend, MemoryBackend, QueryOptions, SetOptions, StorageBackend, StorageEntry,
    UnifiedStorage,
};
pub use sync::{
    MetricsReport, NewItem, Processor, ProcessorError, QueueOrchestrator, QueueStatsSnapshot,
};


/// Integration tests for the assembled SDK.
///
/// These drive the public facade end-to-end: offline capture and online
/// replay, encrypted token persistence across a restart, and permission
/// cache invalidation on role switches.
#[cfg(test)]
mod integration_tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use acube_core::clock::ManualClock;
    use acube_core::roles::Role;
    use acube_core::types::{ItemStatus, OperationKind, Priority, QueueItem, Resource, UserRecord};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use crate::auth::{AccessControl, Credentials, PermissionDecision, PermissionRequest};
    use crate::config::{AuthConfig, SdkConfig};
    use crate::error::SdkError;
    use crate::http::{AuthTransport, HttpResponse};
    use crate::sdk::{AcubeSdk, SdkBuilder};
    use crate::storage::backend::StorageBackend;
    use crate::storage::backends::memory::MemoryBackend;
    use crate::sync::{NewItem, Processor, ProcessorError};

    /// Opt-in log output for debugging test failures: `RUST_LOG=debug`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    struct ScriptedTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
            Arc::new(Self { responses: Mutex::new(responses.into()) })
        }
    }

    #[async_trait]
    impl AuthTransport for ScriptedTransport {
        async fn post_json(
            &self,
            _url: &str,
            _body: &Value,
            _bearer: Option<&str>,
        ) -> Result<HttpResponse, SdkError> {
            Ok(self
                .responses
                .lock()
                .pop_front()
                .unwrap_or(HttpResponse { status: 204, body: Value::Null }))
        }
    }

    struct RecordingProcessor {
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Processor for RecordingProcessor {
        async fn process(&self, item: &QueueItem) -> Result<Value, ProcessorError> {
            self.order.lock().push(item.id.clone());
            Ok(json!({"ok": true}))
        }
    }

    fn mint_token(exp_seconds: i64) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &json!({
                "sub": "user-1",
                "email": "merchant@example.it",
                "exp": exp_seconds,
                "roles": ["ROLE_MERCHANT"],
                "merchant_id": "m-1",
                "cashier_id": "c-1",
                "point_of_sale_id": "pos-1",
            }),
            &jsonwebtoken::EncodingKey::from_secret(b"integration"),
        )
        .unwrap()
    }

    fn login_response() -> HttpResponse {
        HttpResponse {
            status: 200,
            body: json!({"token": mint_token(10_000), "refresh_token": "refresh-1"}),
        }
    }

    fn plain_config() -> SdkConfig {
        SdkConfig {
            auth: AuthConfig { storage_encryption: false, ..AuthConfig::default() },
            ..SdkConfig::default()
        }
    }

    async fn build_sdk(
        config: SdkConfig,
        backend: Arc<MemoryBackend>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
        secret: Option<&str>,
    ) -> AcubeSdk {
        let mut builder = SdkBuilder::new(config)
            .with_backend(backend)
            .with_transport(transport)
            .with_clock(clock);
        if let Some(secret) = secret {
            builder = builder.with_encryption_secret(secret);
        }
        builder.build().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn offline_capture_and_online_replay() {
        init_tracing();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let sdk = build_sdk(
            plain_config(),
            Arc::new(MemoryBackend::new()),
            ScriptedTransport::new(vec![]),
            clock.clone(),
            None,
        )
        .await;

        let processor = Arc::new(RecordingProcessor { order: Mutex::new(Vec::new()) });
        sdk.queue()
            .register_processor(Resource::Receipt, OperationKind::Create, processor.clone());
        sdk.queue()
            .register_processor(Resource::Receipt, OperationKind::Delete, processor.clone());

        sdk.queue().set_online(false);
        let a = sdk
            .queue()
            .enqueue(NewItem::new(
                OperationKind::Create,
                Resource::Receipt,
                json!({"n": "a"}),
                Priority::High,
            ))
            .await
            .unwrap();
        clock.advance(1);
        let b = sdk
            .queue()
            .enqueue(NewItem::new(
                OperationKind::Create,
                Resource::Receipt,
                json!({"n": "b"}),
                Priority::Normal,
            ))
            .await
            .unwrap();
        clock.advance(1);
        let c = sdk
            .queue()
            .enqueue(NewItem::new(
                OperationKind::Delete,
                Resource::Receipt,
                json!({"n": "c"}),
                Priority::Critical,
            ))
            .await
            .unwrap();

        // Nothing ran while offline.
        assert!(processor.order.lock().is_empty());

        sdk.queue().set_online(true);
        let processed = sdk.queue().drain().await.unwrap();
        assert_eq!(processed, 3);
        assert_eq!(*processor.order.lock(), vec![c.id.clone(), a.id.clone(), b.id.clone()]);
        for id in [&a.id, &b.id, &c.id] {
            assert_eq!(sdk.queue().get(id).unwrap().status, ItemStatus::Completed);
        }

        sdk.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_items_survive_a_restart() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(1_000_000));

        let item_id = {
            let sdk = build_sdk(
                plain_config(),
                backend.clone(),
                ScriptedTransport::new(vec![]),
                clock.clone(),
                None,
            )
            .await;
            sdk.queue().set_online(false);
            let item = sdk
                .queue()
                .enqueue(NewItem::new(
                    OperationKind::Create,
                    Resource::Receipt,
                    json!({"receipt": 1}),
                    Priority::Normal,
                ))
                .await
                .unwrap();
            sdk.destroy().await;
            item.id
        };

        // A fresh SDK over the same backend recovers the queue.
        let sdk = build_sdk(
            plain_config(),
            backend,
            ScriptedTransport::new(vec![]),
            clock,
            None,
        )
        .await;
        let recovered = sdk.queue().get(&item_id).unwrap();
        assert_eq!(recovered.status, ItemStatus::Pending);

        let processor = Arc::new(RecordingProcessor { order: Mutex::new(Vec::new()) });
        sdk.queue()
            .register_processor(Resource::Receipt, OperationKind::Create, processor.clone());
        sdk.queue().drain().await.unwrap();
        assert_eq!(*processor.order.lock(), vec![item_id]);

        sdk.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn encrypted_session_survives_a_restart_without_plaintext_on_disk() {
        init_tracing();
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(1_000_000));

        {
            let sdk = build_sdk(
                SdkConfig::default(),
                backend.clone(),
                ScriptedTransport::new(vec![login_response()]),
                clock.clone(),
                Some("device-secret"),
            )
            .await;
            let user = sdk
                .auth()
                .login(Credentials { email: "merchant@example.it".into(), password: "pw".into() })
                .await
                .unwrap();
            assert_eq!(user.id, "user-1");
            sdk.destroy().await;
        }

        // The persisted bytes never contain the tokens in the clear.
        let raw = backend.get("acube_auth").await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("refresh-1"));
        assert!(!text.contains(&mint_token(10_000)[..40]));

        // A fresh SDK with the same secret restores the session.
        let sdk = build_sdk(
            SdkConfig::default(),
            backend,
            ScriptedTransport::new(vec![]),
            clock,
            Some("device-secret"),
        )
        .await;
        let restored = sdk.auth().restore_session().await.unwrap();
        assert!(restored);
        assert_eq!(sdk.auth().current_user().unwrap().id, "user-1");
        assert!(sdk.bearer_token().await.is_some());

        sdk.destroy().await;
    }

    /// Access control that counts evaluations, for cache-invalidation checks.
    struct CountingAccess {
        checks: AtomicU32,
    }

    #[async_trait]
    impl AccessControl for CountingAccess {
        async fn check(&self, _request: &PermissionRequest) -> anyhow::Result<PermissionDecision> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(PermissionDecision {
                granted: true,
                reason: "counted".to_string(),
                requires_approval: false,
            })
        }

        async fn create_session(&self, _user: &UserRecord) -> anyhow::Result<String> {
            Ok("session-counted".to_string())
        }

        async fn end_session(&self, _session_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn role_switch_invalidates_the_permission_cache() {
        let access = Arc::new(CountingAccess { checks: AtomicU32::new(0) });
        let clock = Arc::new(ManualClock::new(1_000_000));
        let sdk = SdkBuilder::new(plain_config())
            .with_backend(Arc::new(MemoryBackend::new()))
            .with_transport(ScriptedTransport::new(vec![login_response()]))
            .with_access_control(access.clone())
            .with_clock(clock)
            .build()
            .await
            .unwrap();

        let user = sdk
            .auth()
            .login(Credentials { email: "merchant@example.it".into(), password: "pw".into() })
            .await
            .unwrap();
        let after_preload = access.checks.load(Ordering::SeqCst);

        // First check misses, second hits the cache.
        sdk.permissions().check(&user, "receipts", "create", Value::Null).await.unwrap();
        sdk.permissions().check(&user, "receipts", "create", Value::Null).await.unwrap();
        let after_checks = access.checks.load(Ordering::SeqCst);
        assert!(after_checks <= after_preload + 1);

        // Switching roles purges the user's cached decisions.
        let switched = sdk.auth().switch_role(Role::Cashier).await.unwrap();
        sdk.permissions()
            .check(&switched, "receipts", "create", Value::Null)
            .await
            .unwrap();
        assert!(access.checks.load(Ordering::SeqCst) > after_checks);

        sdk.destroy().await;
    }
}
