//! Retry delay policies and error-code classification.
//!
//! Delay computation is pure: jitter is applied by the caller from a uniform
//! sample so the math here stays deterministic and property-testable.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Whether a failed operation may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDisposition {
    /// Transient: the operation may succeed on a later attempt.
    Retryable,
    /// Permanent: retrying cannot change the outcome.
    Fatal,
}

/// Error codes that warrant another attempt.
pub const RETRYABLE_CODES: [&str; 5] = [
    "NETWORK_ERROR",
    "TIMEOUT",
    "SERVER_ERROR",
    "RATE_LIMITED",
    "TEMPORARY_FAILURE",
];

/// Error codes that must never be retried.
pub const NON_RETRYABLE_CODES: [&str; 5] = [
    "AUTHENTICATION_ERROR",
    "AUTHORIZATION_ERROR",
    "VALIDATION_ERROR",
    "NOT_FOUND",
    "CONFLICT",
];

/// Classifies an error code. Unknown codes are fatal: retrying an error the
/// tables do not recognise risks replaying a write the server already applied.
#[must_use]
pub fn classify_error_code(code: &str) -> ErrorDisposition {
    if RETRYABLE_CODES.contains(&code) {
        ErrorDisposition::Retryable
    } else {
        ErrorDisposition::Fatal
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Shape of the retry delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum Backoff {
    /// `base * factor^(attempt-1)`, capped at `max_delay_ms`.
    Exponential { factor: f64 },
    /// `base * attempt`, capped at `max_delay_ms`.
    Linear,
}

/// Per-item retry schedule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// When true, the caller applies +/-10% jitter via [`RetryPolicy::jittered`].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential { factor: 2.0 },
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// Attempt 0 is treated as attempt 1 so callers that count retries from
    /// zero never underflow the exponent.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            Backoff::Exponential { factor } => {
                let exp = factor.powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX));
                (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64) as u64
            }
            Backoff::Linear => self
                .base_delay_ms
                .saturating_mul(u64::from(attempt))
                .min(self.max_delay_ms),
        };
        raw.min(self.max_delay_ms)
    }

    /// Applies +/-10% jitter to a delay from a uniform sample in `[0, 1)`.
    ///
    /// With jitter disabled the delay passes through unchanged.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn jittered(&self, delay_ms: u64, unit_sample: f64) -> u64 {
        if !self.jitter {
            return delay_ms;
        }
        let spread = (unit_sample.clamp(0.0, 1.0) * 2.0) - 1.0;
        let jitter = delay_ms as f64 * 0.10 * spread;
        ((delay_ms as f64) + jitter).max(0.0) as u64
    }
}
