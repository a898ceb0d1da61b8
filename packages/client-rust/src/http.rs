//! HTTP transport seam.
//!
//! The auth components only need "POST this JSON, give me status and body",
//! expressed as the [`AuthTransport`] trait so tests and embedders can
//! substitute their own network. [`ReqwestTransport`] is the default
//! implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SdkError;

/// Minimal HTTP response view: status plus parsed JSON body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    /// 2xx check.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network collaborator used for login, refresh, and logout.
#[async_trait]
pub trait AuthTransport: Send + Sync + 'static {
    /// POST `body` as JSON to `url`, optionally with a bearer token.
    ///
    /// Implementations return `Ok` for any HTTP status; only transport-level
    /// failures (DNS, connect, timeout) become errors.
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<HttpResponse, SdkError>;
}

/// Default transport over a shared `reqwest` client.
///
/// Transport-level failures (DNS, connect, timeout) are retried up to
/// `retry_attempts` additional times; HTTP error statuses are returned to
/// the caller untouched, since their handling is endpoint-specific.
pub struct ReqwestTransport {
    client: reqwest::Client,
    custom_headers: HashMap<String, String>,
    retry_attempts: u32,
}

impl ReqwestTransport {
    /// Builds the client with the configured timeout and default headers.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Internal`] when the client cannot be constructed.
    pub fn new(
        timeout_ms: u64,
        custom_headers: HashMap<String, String>,
        retry_attempts: u32,
    ) -> Result<Self, SdkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| SdkError::Internal(err.into()))?;
        Ok(Self { client, custom_headers, retry_attempts })
    }

    async fn post_once(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<HttpResponse, SdkError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in &self.custom_headers {
            request = request.header(name, value);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| SdkError::Network {
            message: format!("POST {url} failed: {err}"),
        })?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);

        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl AuthTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<HttpResponse, SdkError> {
        let mut last_error = None;
        for attempt in 0..=self.retry_attempts {
            match self.post_once(url, body, bearer).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    tracing::debug!(url, attempt, %err, "transport attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(SdkError::Network { message: format!("POST {url} failed") }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range() {
        assert!(HttpResponse { status: 200, body: Value::Null }.is_success());
        assert!(HttpResponse { status: 299, body: Value::Null }.is_success());
        assert!(!HttpResponse { status: 199, body: Value::Null }.is_success());
        assert!(!HttpResponse { status: 401, body: Value::Null }.is_success());
        assert!(!HttpResponse { status: 500, body: Value::Null }.is_success());
    }
}
