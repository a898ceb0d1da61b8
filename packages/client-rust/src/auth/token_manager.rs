//! Token lifecycle: in-memory triple, timer-driven refresh, backoff.
//!
//! The manager exclusively owns the `(access, refresh, expires_at)` triple
//! and the refresh timer. Refresh is single-flight: a mutex serialises
//! attempts, and a caller that waited on the mutex while another refresh
//! completed simply adopts that result instead of issuing a second request.
//!
//! Refresh failures back off exponentially (`base * 2^(attempt-1)`, capped)
//! up to `max_refresh_attempts`; exhausting the budget emits `expired` and
//! drops the triple. A 401/403 from the refresh endpoint means the refresh
//! token itself is dead and surfaces immediately as `TokenInvalid`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acube_core::clock::ClockSource;
use acube_core::retry::{Backoff, RetryPolicy};
use arc_swap::ArcSwapOption;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::auth::jwt;
use crate::auth::token_store::{TokenPatch, TokenStore};
use crate::error::SdkError;
use crate::events::{EventBus, SdkEvent};
use crate::http::AuthTransport;

/// The in-memory token triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTriple {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry, milliseconds since epoch.
    pub expires_at: i64,
}

/// Manager configuration, resolved from [`AuthConfig`](crate::config::AuthConfig).
#[derive(Debug, Clone)]
pub struct TokenManagerConfig {
    pub refresh_url: String,
    pub refresh_buffer_ms: i64,
    pub max_refresh_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Warn when the server reuses the refresh token instead of rotating it.
    pub rotation_warning: bool,
}

/// Body of a successful refresh response.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    #[allow(dead_code)]
    token_type: Option<String>,
    /// Lifetime of the new access token, seconds.
    expires_in: i64,
}

/// Owns the current token triple and the refresh cycle.
pub struct TokenManager {
    transport: Arc<dyn AuthTransport>,
    /// Persists refreshed tokens; absent in token-less test setups.
    store: Option<Arc<TokenStore>>,
    config: TokenManagerConfig,
    events: EventBus,
    clock: Arc<dyn ClockSource>,
    current: ArcSwapOption<TokenTriple>,
    refresh_gate: tokio::sync::Mutex<()>,
    timer: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl TokenManager {
    #[must_use]
    pub fn new(
        transport: Arc<dyn AuthTransport>,
        store: Option<Arc<TokenStore>>,
        config: TokenManagerConfig,
        events: EventBus,
        clock: Arc<dyn ClockSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            config,
            events,
            clock,
            current: ArcSwapOption::from(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            timer: parking_lot::Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Installs a fresh triple and (re)schedules the refresh timer.
    pub fn install(self: &Arc<Self>, triple: TokenTriple) {
        self.current.store(Some(Arc::new(triple)));
        self.schedule_refresh();
    }

    /// Drops the triple and cancels the timer.
    pub fn clear(&self) {
        self.current.store(None);
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    /// Current triple, if any.
    #[must_use]
    pub fn current(&self) -> Option<TokenTriple> {
        self.current.load().as_deref().cloned()
    }

    /// Expiry of the current access token.
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.current().map(|t| t.expires_at)
    }

    /// Returns a usable access token, refreshing first when the current one
    /// is expired or inside the refresh buffer. `None` when unauthenticated
    /// or the refresh cycle has given up.
    pub async fn get_access_token(self: &Arc<Self>) -> Option<String> {
        let triple = self.current()?;
        let now = self.clock.now_ms();

        if !jwt::is_about_to_expire(triple.expires_at, now, self.config.refresh_buffer_ms) {
            return Some(triple.access_token);
        }

        let expired = now >= triple.expires_at;
        if triple.refresh_token.is_empty() {
            return (!expired).then_some(triple.access_token);
        }

        match self.refresh().await {
            Ok(fresh) => Some(fresh.access_token),
            // Still valid for a little while: hand out the old token.
            Err(_) if !expired => Some(triple.access_token),
            Err(_) => None,
        }
    }

    /// Single-flight refresh. Concurrent callers share one outcome.
    ///
    /// # Errors
    ///
    /// - [`SdkError::TokenInvalid`] when the server rejects the refresh token
    ///   (401/403) or there is nothing to refresh.
    /// - [`SdkError::RefreshFailed`] when every attempt failed; `expired` has
    ///   been emitted and the triple dropped.
    pub async fn refresh(self: &Arc<Self>) -> Result<TokenTriple, SdkError> {
        let _gate = self.refresh_gate.lock().await;

        let Some(triple) = self.current() else {
            return Err(SdkError::TokenInvalid { reason: "no token installed".to_string() });
        };
        // Another caller refreshed while we waited on the gate.
        let now = self.clock.now_ms();
        if !jwt::is_about_to_expire(triple.expires_at, now, self.config.refresh_buffer_ms) {
            return Ok(triple);
        }

        self.events.emit(SdkEvent::RefreshStart);
        let policy = RetryPolicy {
            backoff: Backoff::Exponential { factor: 2.0 },
            base_delay_ms: self.config.base_delay_ms,
            max_delay_ms: self.config.max_delay_ms,
            jitter: false,
        };

        let mut attempt = 1;
        loop {
            match self.attempt_refresh(&triple).await {
                Ok(fresh) => {
                    self.events
                        .emit(SdkEvent::RefreshSuccess { expires_at: fresh.expires_at });
                    metrics::counter!("auth_refresh_success_total").increment(1);
                    return Ok(fresh);
                }
                Err(err @ SdkError::TokenInvalid { .. }) => {
                    self.events.emit(SdkEvent::RefreshFailure {
                        attempt,
                        error: err.report(self.clock.now_ms()),
                    });
                    // A rejected refresh token cannot recover; end the cycle.
                    self.clear();
                    return Err(err);
                }
                Err(err) => {
                    warn!(attempt, %err, "token refresh attempt failed");
                    self.events.emit(SdkEvent::RefreshFailure {
                        attempt,
                        error: err.report(self.clock.now_ms()),
                    });
                    metrics::counter!("auth_refresh_failure_total").increment(1);
                    if attempt >= self.config.max_refresh_attempts {
                        break;
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }

        // Budget exhausted: the session is over.
        self.events.emit(SdkEvent::TokenExpired);
        self.current.store(None);
        Err(SdkError::RefreshFailed { attempts: self.config.max_refresh_attempts })
    }

    /// One HTTP round-trip against the refresh endpoint.
    async fn attempt_refresh(self: &Arc<Self>, old: &TokenTriple) -> Result<TokenTriple, SdkError> {
        let body = json!({
            "refresh_token": old.refresh_token,
            "grant_type": "refresh_token",
        });
        let response = self.transport.post_json(&self.config.refresh_url, &body, None).await?;

        match response.status {
            200 => {}
            401 | 403 => {
                return Err(SdkError::TokenInvalid {
                    reason: "refresh token rejected".to_string(),
                })
            }
            status => {
                return Err(SdkError::Network {
                    message: format!("refresh endpoint returned {status}"),
                })
            }
        }

        let parsed: RefreshResponse =
            serde_json::from_value(response.body).map_err(|_| SdkError::TokenInvalid {
                reason: "malformed refresh response".to_string(),
            })?;

        if self.config.rotation_warning {
            let reused: bool = parsed
                .refresh_token
                .as_bytes()
                .ct_eq(old.refresh_token.as_bytes())
                .into();
            if reused {
                warn!("refresh response reused the previous refresh token");
            }
        }

        let now = self.clock.now_ms();
        let fresh = TokenTriple {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: now + parsed.expires_in * 1_000,
        };
        self.current.store(Some(Arc::new(fresh.clone())));
        self.schedule_refresh();

        if let Some(store) = &self.store {
            let patch = TokenPatch {
                access_token: Some(fresh.access_token.clone()),
                refresh_token: Some(fresh.refresh_token.clone()),
                expires_at: Some(fresh.expires_at),
                ..TokenPatch::default()
            };
            if let Err(err) = store.update(patch).await {
                warn!(%err, "could not persist refreshed tokens");
            }
        }

        Ok(fresh)
    }

    /// Arms the timer at `expires_at - refresh_buffer`; fires immediately
    /// when that instant has already passed.
    fn schedule_refresh(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Some(triple) = self.current() else { return };
        if triple.refresh_token.is_empty() {
            return;
        }

        let delay_ms =
            (triple.expires_at - self.config.refresh_buffer_ms - self.clock.now_ms()).max(0);
        debug!(delay_ms, "scheduling token refresh");

        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            #[allow(clippy::cast_sign_loss)]
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            if let Some(manager) = manager.upgrade() {
                if let Err(err) = manager.refresh().await {
                    warn!(%err, "scheduled token refresh failed");
                }
            }
        });

        if let Some(old) = self.timer.lock().replace(task) {
            old.abort();
        }
    }

    /// Cancels the timer and rejects further scheduling.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    use acube_core::clock::ManualClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::*;
    use crate::http::HttpResponse;

    /// Transport with a scripted queue of responses; the last one repeats.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
        calls: AtomicU32,
        last_body: Mutex<Option<Value>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
                last_body: Mutex::new(None),
            })
        }

        fn ok(expires_in: i64, access: &str, refresh: &str) -> HttpResponse {
            HttpResponse {
                status: 200,
                body: json!({
                    "access_token": access,
                    "refresh_token": refresh,
                    "token_type": "Bearer",
                    "expires_in": expires_in,
                }),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthTransport for ScriptedTransport {
        async fn post_json(
            &self,
            _url: &str,
            body: &Value,
            _bearer: Option<&str>,
        ) -> Result<HttpResponse, SdkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_body.lock() = Some(body.clone());
            let mut responses = self.responses.lock();
            let response = if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().expect("scripted response")
            };
            Ok(response)
        }
    }

    fn config() -> TokenManagerConfig {
        TokenManagerConfig {
            refresh_url: "https://auth.test/token/refresh".to_string(),
            refresh_buffer_ms: 5_000,
            max_refresh_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            rotation_warning: true,
        }
    }

    fn manager(
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
    ) -> (Arc<TokenManager>, EventBus) {
        let events = EventBus::new();
        let mgr = TokenManager::new(transport, None, config(), events.clone(), clock);
        (mgr, events)
    }

    fn triple(expires_at: i64) -> TokenTriple {
        TokenTriple {
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            expires_at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_token_is_returned_without_refresh() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(60, "a", "r")]);
        let clock = Arc::new(ManualClock::new(0));
        let (mgr, _) = manager(transport.clone(), clock);

        mgr.install(triple(1_000_000));
        assert_eq!(mgr.get_access_token().await.as_deref(), Some("old-access"));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn near_expiry_triggers_refresh() {
        let transport =
            ScriptedTransport::new(vec![ScriptedTransport::ok(3_600, "new-access", "new-refresh")]);
        let clock = Arc::new(ManualClock::new(996_000));
        let (mgr, events) = manager(transport.clone(), clock);
        let mut rx = events.subscribe();

        // 996_000 >= 1_000_000 - 5_000: inside the buffer.
        mgr.install(triple(1_000_000));
        let token = mgr.get_access_token().await;
        assert_eq!(token.as_deref(), Some("new-access"));
        assert_eq!(transport.calls(), 1);

        // The request body follows the grant contract.
        let body = transport.last_body.lock().clone().unwrap();
        assert_eq!(body["grant_type"], "refresh_token");
        assert_eq!(body["refresh_token"], "old-refresh");

        assert!(matches!(rx.recv().await.unwrap(), SdkEvent::RefreshStart));
        assert!(matches!(rx.recv().await.unwrap(), SdkEvent::RefreshSuccess { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let transport =
            ScriptedTransport::new(vec![ScriptedTransport::ok(3_600, "shared", "r2")]);
        let clock = Arc::new(ManualClock::new(996_000));
        let (mgr, events) = manager(transport.clone(), clock);
        let mut rx = events.subscribe();

        mgr.install(triple(1_000_000));

        let a = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.get_access_token().await }
        });
        let b = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.get_access_token().await }
        });
        let (ta, tb) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(ta.as_deref(), Some("shared"));
        assert_eq!(tb.as_deref(), Some("shared"));
        assert_eq!(transport.calls(), 1, "exactly one refresh request in flight");

        // refresh:success observed exactly once.
        let mut successes = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SdkEvent::RefreshSuccess { .. }) {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_refresh_surfaces_token_invalid() {
        let transport = ScriptedTransport::new(vec![HttpResponse { status: 401, body: Value::Null }]);
        let clock = Arc::new(ManualClock::new(996_000));
        let (mgr, _) = manager(transport.clone(), clock);

        mgr.install(triple(1_000_000));
        let err = mgr.refresh().await.unwrap_err();
        assert!(matches!(err, SdkError::TokenInvalid { .. }));
        // No retries on a rejected refresh token.
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_with_backoff_then_expire() {
        let transport = ScriptedTransport::new(vec![HttpResponse { status: 500, body: Value::Null }]);
        let clock = Arc::new(ManualClock::new(999_000));
        let (mgr, events) = manager(transport.clone(), clock);
        let mut rx = events.subscribe();

        mgr.install(triple(1_000_000));
        let err = mgr.refresh().await.unwrap_err();
        assert!(matches!(err, SdkError::RefreshFailed { attempts: 3 }));
        assert_eq!(transport.calls(), 3);

        // After exhaustion the triple is gone.
        assert!(mgr.current().is_none());
        assert!(mgr.get_access_token().await.is_none());

        let mut saw_expired = false;
        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SdkEvent::TokenExpired => saw_expired = true,
                SdkEvent::RefreshFailure { .. } => failures += 1,
                _ => {}
            }
        }
        assert!(saw_expired);
        assert_eq!(failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_refresh_fires_at_the_buffer_boundary() {
        let transport =
            ScriptedTransport::new(vec![ScriptedTransport::ok(3_600, "timer-access", "r2")]);
        let clock = Arc::new(ManualClock::new(0));
        let (mgr, _) = manager(transport.clone(), clock.clone());

        // Expires in 10s with a 5s buffer: the timer should fire ~5s in.
        mgr.install(triple(10_000));
        assert_eq!(transport.calls(), 0);

        clock.set(6_000);
        tokio::time::sleep(Duration::from_millis(6_000)).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(
            mgr.current().map(|t| t.access_token),
            Some("timer-access".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_refresh_token_disables_refresh() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(60, "a", "r")]);
        let clock = Arc::new(ManualClock::new(996_000));
        let (mgr, _) = manager(transport.clone(), clock.clone());

        let mut t = triple(1_000_000);
        t.refresh_token = String::new();
        mgr.install(t);

        // Near expiry but nothing to refresh with: old token while it lasts.
        assert_eq!(mgr.get_access_token().await.as_deref(), Some("old-access"));
        assert_eq!(transport.calls(), 0);

        clock.set(1_000_001);
        assert!(mgr.get_access_token().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_the_triple() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(60, "a", "r")]);
        let clock = Arc::new(ManualClock::new(0));
        let (mgr, _) = manager(transport, clock);

        mgr.install(triple(1_000_000));
        assert!(mgr.current().is_some());

        mgr.clear();
        assert!(mgr.current().is_none());
        assert!(mgr.get_access_token().await.is_none());
    }
}
