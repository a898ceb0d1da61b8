//! Auth orchestration: login, logout, session restoration, role switching.
//!
//! State machine: `unauthenticated -> authenticating -> authenticated`
//! with `authenticated <-> refreshing` while the session lives, and back to
//! `unauthenticated` on logout or a failed refresh (forced logout).

use std::sync::Arc;

use acube_core::clock::ClockSource;
use acube_core::roles::{can_switch_to, primary_role, Role, RoleContext};
use acube_core::types::{TokenRecord, UserRecord};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::jwt;
use crate::auth::permissions::{AccessControl, PermissionEngine};
use crate::auth::token_manager::{TokenManager, TokenTriple};
use crate::auth::token_store::TokenStore;
use crate::error::SdkError;
use crate::events::{EventBus, SdkEvent};
use crate::http::AuthTransport;
use crate::storage::entry::SetOptions;
use crate::storage::UnifiedStorage;

/// Storage key of the per-installation device id.
const DEVICE_ID_KEY: &str = "device:id";

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
}

/// Login credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Options for [`AuthService::logout`].
#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    /// Wipe local storage. Anything but an explicit `false` wipes.
    pub clear_local_data: Option<bool>,
    pub reason: Option<String>,
}

/// Endpoints the orchestrator talks to.
#[derive(Debug, Clone)]
pub struct AuthServiceConfig {
    pub login_url: String,
    pub logout_url: String,
}

/// Collaborators wired in at construction.
pub struct AuthDeps {
    pub transport: Arc<dyn AuthTransport>,
    pub token_manager: Arc<TokenManager>,
    pub token_store: Arc<TokenStore>,
    pub permissions: Arc<PermissionEngine>,
    pub access: Arc<dyn AccessControl>,
    pub storage: Arc<UnifiedStorage>,
    pub events: EventBus,
    pub clock: Arc<dyn ClockSource>,
}

/// Owns the session lifecycle.
pub struct AuthService {
    deps: AuthDeps,
    config: AuthServiceConfig,
    state: RwLock<AuthState>,
    current_user: RwLock<Option<UserRecord>>,
}

impl AuthService {
    #[must_use]
    pub fn new(deps: AuthDeps, config: AuthServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            deps,
            config,
            state: RwLock::new(AuthState::Unauthenticated),
            current_user: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state(), AuthState::Authenticated | AuthState::Refreshing)
    }

    #[must_use]
    pub fn current_user(&self) -> Option<UserRecord> {
        self.current_user.read().clone()
    }

    /// Authenticates against the login endpoint and installs the session.
    ///
    /// # Errors
    ///
    /// - [`SdkError::InvalidCredentials`] on HTTP 401.
    /// - [`SdkError::AccountLocked`] on HTTP 403.
    /// - [`SdkError::RateLimited`] on HTTP 429.
    /// - [`SdkError::Network`] on transport failures and other statuses.
    /// - [`SdkError::TokenInvalid`] when the returned JWT is unusable.
    pub async fn login(&self, credentials: Credentials) -> Result<UserRecord, SdkError> {
        *self.state.write() = AuthState::Authenticating;
        self.deps
            .events
            .emit(SdkEvent::LoginStart { email: credentials.email.clone() });

        match self.login_inner(credentials).await {
            Ok(user) => {
                *self.state.write() = AuthState::Authenticated;
                *self.current_user.write() = Some(user.clone());
                self.deps.events.emit(SdkEvent::LoginSuccess { user_id: user.id.clone() });
                self.deps
                    .events
                    .emit(SdkEvent::SessionCreated { session_id: user.session_id.clone() });
                self.deps.permissions.preload(&user).await;
                metrics::counter!("auth_login_success_total").increment(1);
                Ok(user)
            }
            Err(err) => {
                *self.state.write() = AuthState::Unauthenticated;
                metrics::counter!("auth_login_failure_total").increment(1);
                Err(err)
            }
        }
    }

    async fn login_inner(&self, credentials: Credentials) -> Result<UserRecord, SdkError> {
        let body = json!({"email": credentials.email, "password": credentials.password});
        let response = self
            .deps
            .transport
            .post_json(&self.config.login_url, &body, None)
            .await?;

        match response.status {
            200 => {}
            401 => return Err(SdkError::InvalidCredentials),
            403 => return Err(SdkError::AccountLocked),
            429 => return Err(SdkError::RateLimited),
            status => {
                return Err(SdkError::Network {
                    message: format!("login endpoint returned {status}"),
                })
            }
        }

        let Some(token) = response.body["token"].as_str() else {
            return Err(SdkError::TokenInvalid { reason: "login response has no token".into() });
        };
        let refresh_token = response.body["refresh_token"].as_str().unwrap_or_default();

        let now = self.deps.clock.now_ms();
        let claims = jwt::parse_unverified(token)?;
        jwt::validate(&claims, now)?;

        let roles = jwt::normalize_roles(claims.roles.as_ref());
        let expires_at = claims
            .expires_at_ms()
            .ok_or_else(|| SdkError::TokenInvalid { reason: "missing exp claim".into() })?;

        let mut user = UserRecord {
            id: claims.sub.clone().unwrap_or_default(),
            email: claims.email.clone().unwrap_or_default(),
            name: String::new(),
            roles,
            permissions: Vec::new(),
            merchant_id: claims.merchant_id.clone(),
            cashier_id: claims.cashier_id.clone(),
            point_of_sale_id: claims.point_of_sale_id.clone(),
            // Local fallback; replaced if the access-control session sticks.
            session_id: Uuid::new_v4().to_string(),
            last_login: now,
            attributes: Value::Null,
        };

        match self.deps.access.create_session(&user).await {
            Ok(session_id) => user.session_id = session_id,
            Err(err) => {
                warn!(%err, "session creation failed, keeping locally generated session id");
            }
        }

        self.deps.token_manager.install(TokenTriple {
            access_token: token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at,
        });

        let record = TokenRecord {
            access_token: token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at,
            token_type: "Bearer".to_string(),
            user: user.clone(),
            device_id: self.ensure_device_id().await,
            encrypted_at: 0,
            version: TokenRecord::SCHEMA_VERSION.to_string(),
        };
        self.deps.token_store.store(record).await?;

        info!(user_id = %user.id, primary = ?primary_role(&user.roles), "login complete");
        Ok(user)
    }

    /// Ends the session: best-effort server logout, token teardown, optional
    /// local-data wipe, permission cache purge.
    pub async fn logout(&self, options: LogoutOptions) {
        let user = self.current_user();
        self.deps.events.emit(SdkEvent::Logout { reason: options.reason.clone() });

        // Best-effort server-side teardown; local state goes regardless.
        if let Some(token) = self.deps.token_manager.current().map(|t| t.access_token) {
            if let Err(err) = self
                .deps
                .transport
                .post_json(&self.config.logout_url, &Value::Null, Some(&token))
                .await
            {
                warn!(%err, "logout endpoint unreachable");
            }
        }
        if let Some(user) = &user {
            if let Err(err) = self.deps.access.end_session(&user.session_id).await {
                warn!(%err, "session teardown failed");
            }
        }

        self.deps.token_manager.clear();
        if let Err(err) = self.deps.token_store.clear().await {
            warn!(%err, "token store clear failed");
        }

        if options.clear_local_data != Some(false) {
            if let Err(err) = self.deps.storage.clear(None).await {
                warn!(%err, "local data clear failed");
            }
        }

        if let Some(user) = &user {
            self.deps.permissions.clear_user_caches(&user.id);
        }

        *self.current_user.write() = None;
        *self.state.write() = AuthState::Unauthenticated;
    }

    /// Forces a token refresh; a failure ends the session.
    ///
    /// # Errors
    ///
    /// Propagates the refresh error after performing a forced logout.
    pub async fn refresh_session(&self) -> Result<(), SdkError> {
        *self.state.write() = AuthState::Refreshing;
        match self.deps.token_manager.refresh().await {
            Ok(_) => {
                *self.state.write() = AuthState::Authenticated;
                Ok(())
            }
            Err(err) => {
                warn!(%err, "session refresh failed, forcing logout");
                self.logout(LogoutOptions {
                    clear_local_data: None,
                    reason: Some("token_invalid".to_string()),
                })
                .await;
                Err(err)
            }
        }
    }

    /// Restores a persisted session on startup. Returns whether a session is
    /// now active.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures; an expired or
    /// unrecoverable session is `Ok(false)`, not an error.
    pub async fn restore_session(&self) -> Result<bool, SdkError> {
        self.deps.token_store.init().await?;

        if let Some(record) = self.deps.token_store.retrieve().await? {
            self.deps.token_manager.install(TokenTriple {
                access_token: record.access_token.clone(),
                refresh_token: record.refresh_token.clone(),
                expires_at: record.expires_at,
            });
            *self.current_user.write() = Some(record.user.clone());
            *self.state.write() = AuthState::Authenticated;
            self.deps
                .events
                .emit(SdkEvent::SessionRestored { user_id: record.user.id });
            return Ok(true);
        }

        // Expired access token: one refresh attempt if we still hold a
        // refresh token.
        let stale = self.deps.token_store.retrieve_stale().await?;
        if let Some(record) = stale.filter(|r| !r.refresh_token.is_empty()) {
            self.deps.token_manager.install(TokenTriple {
                access_token: record.access_token.clone(),
                refresh_token: record.refresh_token.clone(),
                expires_at: record.expires_at,
            });
            match self.deps.token_manager.refresh().await {
                Ok(_) => {
                    *self.current_user.write() = Some(record.user.clone());
                    *self.state.write() = AuthState::Authenticated;
                    self.deps
                        .events
                        .emit(SdkEvent::SessionRestored { user_id: record.user.id });
                    return Ok(true);
                }
                Err(err) => {
                    warn!(%err, "session restoration refresh failed, clearing local data");
                    self.deps.token_manager.clear();
                    self.deps.token_store.clear().await?;
                    self.deps.storage.clear(None).await?;
                    return Ok(false);
                }
            }
        }

        Ok(false)
    }

    /// Switches the active role, re-deriving caches and persisting the new
    /// role set.
    ///
    /// # Errors
    ///
    /// - [`SdkError::SessionExpired`] with no active session.
    /// - [`SdkError::PermissionDenied`] when the role or its scope ids are
    ///   not available to this user.
    pub async fn switch_role(&self, target: Role) -> Result<UserRecord, SdkError> {
        let Some(mut user) = self.current_user() else {
            return Err(SdkError::SessionExpired);
        };

        let ctx = RoleContext {
            merchant_id: user.merchant_id.clone(),
            cashier_id: user.cashier_id.clone(),
            point_of_sale_id: user.point_of_sale_id.clone(),
        };
        if !can_switch_to(&user.roles, target, &ctx) {
            return Err(SdkError::PermissionDenied {
                reason: format!("cannot switch to {}", target.as_str()),
            });
        }

        user.roles = std::iter::once(target).collect();
        self.deps
            .token_store
            .update(crate::auth::token_store::TokenPatch {
                user: Some(user.clone()),
                ..Default::default()
            })
            .await?;

        self.deps.permissions.clear_user_caches(&user.id);
        *self.current_user.write() = Some(user.clone());
        self.deps.events.emit(SdkEvent::RoleChanged { user_id: user.id.clone() });
        Ok(user)
    }

    /// Stable per-installation device id, created on first use.
    async fn ensure_device_id(&self) -> String {
        if let Ok(Some(id)) = self.deps.storage.get::<String>(DEVICE_ID_KEY).await {
            return id;
        }
        let id = Uuid::new_v4().to_string();
        if let Err(err) = self
            .deps
            .storage
            .set(DEVICE_ID_KEY, &id, SetOptions::default())
            .await
        {
            warn!(%err, "could not persist device id");
        }
        id
    }
}
