//! Authentication: JWT handling, token persistence and refresh, permission
//! evaluation, and the session-lifecycle orchestrator.

pub mod jwt;
pub mod orchestrator;
pub mod permissions;
pub mod token_manager;
pub mod token_store;

pub use orchestrator::{
    AuthDeps, AuthService, AuthServiceConfig, AuthState, Credentials, LogoutOptions,
};
pub use permissions::{
    AccessControl, PermissionDecision, PermissionEngine, PermissionEngineConfig, PermissionRequest,
};
pub use token_manager::{TokenManager, TokenManagerConfig, TokenTriple};
pub use token_store::{
    SecureEnclaveHook, TokenPatch, TokenStore, TokenStoreStats, LEGACY_TOKEN_KEY,
};
