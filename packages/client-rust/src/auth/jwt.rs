//! JWT payload parsing and claim validation.
//!
//! The SDK never verifies signatures: tokens come straight from the auth
//! endpoint over TLS and are consumed client-side only. Parsing decodes the
//! middle segment (base64url, tolerant of padding) into claims; validation
//! enforces the required claims and the time window.
//!
//! The `roles` claim is either a flat array of role strings or a map of
//! audience domain to role list; per the auth service contract the first
//! audience's list is used. Unknown role strings normalise to the cashier
//! default.

use std::collections::BTreeSet;

use acube_core::roles::{Role, RoleContext};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::SdkError;

/// The `roles` claim in both shapes the server emits.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RolesClaim {
    /// Flat list of role strings.
    Flat(Vec<String>),
    /// Map of audience domain to role list; document order matters.
    ByAudience(serde_json::Map<String, Value>),
}

/// Decoded JWT payload. Field presence is validated separately so parsing
/// never rejects a structurally sound token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtClaims {
    pub sub: Option<String>,
    pub email: Option<String>,
    /// Expiry, seconds since epoch (standard JWT `exp`).
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub nbf: Option<i64>,
    pub roles: Option<RolesClaim>,
    pub merchant_id: Option<String>,
    pub cashier_id: Option<String>,
    pub point_of_sale_id: Option<String>,
}

impl JwtClaims {
    /// Expiry in milliseconds, when present.
    #[must_use]
    pub fn expires_at_ms(&self) -> Option<i64> {
        self.exp.map(|exp| exp * 1_000)
    }

    /// Scope ids as a [`RoleContext`].
    #[must_use]
    pub fn role_context(&self) -> RoleContext {
        RoleContext {
            merchant_id: self.merchant_id.clone(),
            cashier_id: self.cashier_id.clone(),
            point_of_sale_id: self.point_of_sale_id.clone(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> SdkError {
    SdkError::TokenInvalid { reason: reason.into() }
}

/// Decodes the payload segment of a compact JWT without verifying the
/// signature.
///
/// # Errors
///
/// Returns [`SdkError::TokenInvalid`] for tokens that are not three
/// dot-separated segments of base64url JSON.
pub fn parse_unverified(token: &str) -> Result<JwtClaims, SdkError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload)) = (segments.next(), segments.next()) else {
        return Err(invalid("token has no payload segment"));
    };
    if segments.next().is_none() {
        return Err(invalid("token has no signature segment"));
    }

    // Tolerate padded base64url emitted by some issuers.
    let trimmed = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|_| invalid("payload is not base64url"))?;
    serde_json::from_slice(&bytes).map_err(|_| invalid("payload is not JSON"))
}

/// Validates the claims required by the SDK: `sub`, `email`, non-empty
/// `roles`, `exp` in the future, `nbf`/`iat` not in the future.
///
/// # Errors
///
/// - [`SdkError::TokenExpired`] when `exp` has passed.
/// - [`SdkError::TokenInvalid`] for every other violation.
pub fn validate(claims: &JwtClaims, now_ms: i64) -> Result<(), SdkError> {
    if claims.sub.as_deref().is_none_or(str::is_empty) {
        return Err(invalid("missing sub claim"));
    }
    if claims.email.as_deref().is_none_or(str::is_empty) {
        return Err(invalid("missing email claim"));
    }
    if normalize_roles(claims.roles.as_ref()).is_empty() {
        return Err(invalid("missing roles claim"));
    }

    let Some(exp_ms) = claims.expires_at_ms() else {
        return Err(invalid("missing exp claim"));
    };
    if now_ms >= exp_ms {
        return Err(SdkError::TokenExpired);
    }
    if let Some(nbf) = claims.nbf {
        if now_ms < nbf * 1_000 {
            return Err(invalid("token is not yet valid"));
        }
    }
    if let Some(iat) = claims.iat {
        if iat * 1_000 > now_ms {
            return Err(invalid("token issued in the future"));
        }
    }
    Ok(())
}

/// Whether the token should be refreshed: `now >= exp - buffer`.
#[must_use]
pub fn is_about_to_expire(expires_at_ms: i64, now_ms: i64, refresh_buffer_ms: i64) -> bool {
    now_ms >= expires_at_ms - refresh_buffer_ms
}

/// Flattens the roles claim into a role set. Unknown role strings map to
/// [`Role::Cashier`]; for the audience-map shape, only the first audience's
/// list is used.
#[must_use]
pub fn normalize_roles(claim: Option<&RolesClaim>) -> BTreeSet<Role> {
    let strings: Vec<String> = match claim {
        None => Vec::new(),
        Some(RolesClaim::Flat(list)) => list.clone(),
        Some(RolesClaim::ByAudience(map)) => map
            .values()
            .next()
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };

    strings
        .iter()
        .map(|s| {
            Role::parse(s).unwrap_or_else(|| {
                debug!(role = %s, "unknown role string, defaulting to cashier");
                Role::Cashier
            })
        })
        .collect()
}
