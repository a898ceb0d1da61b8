//! Cached, batched permission evaluation.
//!
//! The actual policy decision comes from an [`AccessControl`] collaborator;
//! this engine wraps it with an LRU+TTL decision cache and per-user request
//! coalescing: up to `max_batch_size` concurrent checks for the same user
//! within `batch_timeout_ms` dispatch as a single batch, and a full batch
//! flushes immediately.
//!
//! Cache keys embed a per-user generation counter. Invalidation
//! (`clear_user_caches`, logout, role change) bumps the generation, making
//! every older entry unreachable; the LRU then ages them out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acube_core::clock::ClockSource;
use acube_core::roles::{effective_roles, primary_role, Role};
use acube_core::types::UserRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::SdkError;
use crate::storage::cache::LruTtlCache;

/// One permission question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub user_id: String,
    pub resource: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

/// The collaborator's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub granted: bool,
    pub reason: String,
    pub requires_approval: bool,
}

/// Policy/session collaborator. Supplied by the embedder.
#[async_trait]
pub trait AccessControl: Send + Sync + 'static {
    /// Evaluate one request.
    async fn check(&self, request: &PermissionRequest) -> anyhow::Result<PermissionDecision>;

    /// Evaluate several requests for one user. The default runs them
    /// sequentially; implementations with a batch endpoint should override.
    async fn check_batch(
        &self,
        requests: &[PermissionRequest],
    ) -> anyhow::Result<Vec<PermissionDecision>> {
        let mut decisions = Vec::with_capacity(requests.len());
        for request in requests {
            decisions.push(self.check(request).await?);
        }
        Ok(decisions)
    }

    /// Create a server-side session for a logged-in user, returning its id.
    async fn create_session(&self, user: &UserRecord) -> anyhow::Result<String>;

    /// Tear down a server-side session. Best-effort.
    async fn end_session(&self, session_id: &str) -> anyhow::Result<()>;
}

/// Engine configuration, resolved from
/// [`PerformanceConfig`](crate::config::PerformanceConfig).
#[derive(Debug, Clone)]
pub struct PermissionEngineConfig {
    pub cache_size: usize,
    pub cache_ttl_ms: i64,
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
}

type WaiterResult = Result<PermissionDecision, String>;

struct PendingEntry {
    cache_key: String,
    request: PermissionRequest,
    tx: oneshot::Sender<WaiterResult>,
}

/// Resource/action pairs pre-warmed after login, by primary role.
fn preload_set(role: Role) -> &'static [(&'static str, &'static str)] {
    match role {
        Role::Admin => &[
            ("merchants", "read"),
            ("merchants", "update"),
            ("cashiers", "read"),
            ("receipts", "read"),
        ],
        Role::Supplier => &[("merchants", "read"), ("merchants", "create"), ("pems", "read")],
        Role::Merchant => &[
            ("receipts", "create"),
            ("receipts", "read"),
            ("cashiers", "read"),
            ("cash-registers", "read"),
        ],
        Role::Cashier => &[("receipts", "create"), ("receipts", "read"), ("receipts", "void")],
    }
}

/// Cached and batched facade over [`AccessControl`].
pub struct PermissionEngine {
    access: Arc<dyn AccessControl>,
    cache: LruTtlCache<PermissionDecision>,
    /// Per-user cache generation; bumped to invalidate.
    user_gen: DashMap<String, u64>,
    batches: Mutex<HashMap<String, Vec<PendingEntry>>>,
    config: PermissionEngineConfig,
    clock: Arc<dyn ClockSource>,
    batches_dispatched: AtomicU64,
}

impl PermissionEngine {
    #[must_use]
    pub fn new(
        access: Arc<dyn AccessControl>,
        config: PermissionEngineConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            access,
            cache: LruTtlCache::new(config.cache_size, config.cache_ttl_ms),
            user_gen: DashMap::new(),
            batches: Mutex::new(HashMap::new()),
            config,
            clock,
            batches_dispatched: AtomicU64::new(0),
        })
    }

    fn generation(&self, user_id: &str) -> u64 {
        self.user_gen.get(user_id).map_or(0, |g| *g)
    }

    /// Composite cache key: user, generation, scope+roles hash, question.
    fn cache_key(&self, user: &UserRecord, resource: &str, action: &str, context: &Value) -> String {
        let mut hasher = Sha256::new();
        for role in effective_roles(&user.roles) {
            hasher.update(role.as_str().as_bytes());
        }
        hasher.update(user.merchant_id.as_deref().unwrap_or("").as_bytes());
        hasher.update(user.cashier_id.as_deref().unwrap_or("").as_bytes());
        let scope_hash = hex::encode(&hasher.finalize()[..8]);

        let context_hash =
            hex::encode(&Sha256::digest(context.to_string().as_bytes())[..8]);

        format!(
            "perm:{}:{}:{}:{}:{}:{}",
            user.id,
            self.generation(&user.id),
            scope_hash,
            resource,
            action,
            context_hash
        )
    }

    /// Evaluates a permission, serving from cache when possible and joining
    /// the per-user batch otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Internal`] when the collaborator fails and
    /// [`SdkError::Destroyed`] when the engine is dropped mid-flight.
    pub async fn check(
        self: &Arc<Self>,
        user: &UserRecord,
        resource: &str,
        action: &str,
        context: Value,
    ) -> Result<PermissionDecision, SdkError> {
        let key = self.cache_key(user, resource, action, &context);
        let now = self.clock.now_ms();

        if let Some(decision) = self.cache.get(&key, now) {
            metrics::counter!("permission_cache_hits_total").increment(1);
            return Ok(decision);
        }
        metrics::counter!("permission_cache_misses_total").increment(1);

        let request = PermissionRequest {
            user_id: user.id.clone(),
            resource: resource.to_string(),
            action: action.to_string(),
            context,
        };

        let (tx, rx) = oneshot::channel();
        let flush_now = {
            let mut batches = self.batches.lock();
            let batch = batches.entry(user.id.clone()).or_default();
            let first = batch.is_empty();
            batch.push(PendingEntry { cache_key: key, request, tx });
            let full = batch.len() >= self.config.max_batch_size;

            if first && !full {
                // Arm the window timer for this user's batch.
                let engine = self.clone();
                let user_id = user.id.clone();
                let timeout = self.config.batch_timeout_ms;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(timeout)).await;
                    engine.flush_user(&user_id).await;
                });
            }
            full
        };

        if flush_now {
            self.flush_user(&user.id).await;
        }

        match rx.await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(message)) => Err(SdkError::Internal(anyhow::anyhow!(message))),
            Err(_) => Err(SdkError::Destroyed),
        }
    }

    /// Dispatches the pending batch for one user, resolving waiters in
    /// request order.
    async fn flush_user(self: &Arc<Self>, user_id: &str) {
        let entries = {
            let mut batches = self.batches.lock();
            match batches.remove(user_id) {
                Some(entries) if !entries.is_empty() => entries,
                _ => return,
            }
        };

        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(user_id, count = entries.len(), "dispatching permission batch");

        let requests: Vec<PermissionRequest> =
            entries.iter().map(|e| e.request.clone()).collect();
        match self.access.check_batch(&requests).await {
            Ok(decisions) if decisions.len() == entries.len() => {
                let now = self.clock.now_ms();
                for (entry, decision) in entries.into_iter().zip(decisions) {
                    self.cache.insert(entry.cache_key, decision.clone(), now);
                    let _ = entry.tx.send(Ok(decision));
                }
            }
            Ok(decisions) => {
                warn!(
                    expected = entries.len(),
                    got = decisions.len(),
                    "access control returned a short batch"
                );
                for entry in entries {
                    let _ = entry.tx.send(Err("access control returned a short batch".into()));
                }
            }
            Err(err) => {
                for entry in entries {
                    let _ = entry.tx.send(Err(err.to_string()));
                }
            }
        }
    }

    /// Pre-warms the cache with the common checks for the user's primary role.
    pub async fn preload(self: &Arc<Self>, user: &UserRecord) {
        let Some(role) = primary_role(&user.roles) else { return };
        for (resource, action) in preload_set(role) {
            if let Err(err) = self.check(user, resource, action, Value::Null).await {
                debug!(%err, resource, action, "permission preload skipped");
            }
        }
    }

    /// Invalidates every cached decision for `user_id`.
    pub fn clear_user_caches(&self, user_id: &str) {
        let mut gen = self.user_gen.entry(user_id.to_string()).or_insert(0);
        *gen += 1;
    }

    /// Cache hit rate in `[0, 1]`.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        self.cache.hit_rate()
    }

    /// (hits, misses, batches dispatched).
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.cache.hits(),
            self.cache.misses(),
            self.batches_dispatched.load(Ordering::Relaxed),
        )
    }
}
