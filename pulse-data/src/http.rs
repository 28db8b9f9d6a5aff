//! Outbound HTTP: a transport seam, a retrying client with exponential backoff, and the
//! one-shot refresh-and-retry policy for authenticated calls.

use crate::{
    config::RetryPolicy,
    credential::{Credential, CredentialStore},
    error::{LookupError, TransportError},
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use url::Url;

/// Upper bound on a server-directed `Retry-After` delay.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Transport-agnostic description of an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            cookies: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Render the `Cookie` header value, eg/ `a=1; b=2`.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }

        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Response of a single HTTP attempt. Header names are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|content_type| content_type.contains("json"))
    }

    /// Server-directed delay in seconds, if present and numeric, capped at
    /// [`MAX_RETRY_AFTER`].
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|seconds| *seconds >= 0.0)
            .map(|seconds| seconds.min(MAX_RETRY_AFTER.as_secs_f64()))
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
    }

    /// Find a cookie value set by the response, eg/ `Set-Cookie: name=value; Path=/`.
    pub fn set_cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key == "set-cookie")
            .filter_map(|(_, value)| value.split(';').next())
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| key.trim() == name)
            .map(|(_, value)| value.trim())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, LookupError> {
        serde_json::from_str(&self.body).map_err(LookupError::from)
    }
}

/// Seam over the HTTP stack, allowing the pipeline to be driven by a scripted fake.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`HttpTransport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = if request.query.is_empty() {
            Url::parse(&request.url)
        } else {
            Url::parse_with_params(&request.url, &request.query)
        }
        .map_err(|error| TransportError::Request(format!("{}: {error}", request.url)))?;

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(cookie) = request.cookie_header() {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// HTTP client applying bounded retries with exponential backoff.
///
/// Transport errors and 5xx responses sleep for the current backoff before retrying;
/// 429 sleeps for `max(Retry-After, backoff)`. No sleep follows the final attempt, whose
/// response (or transport error) is handed back for the caller to inspect.
#[derive(Clone)]
pub struct RateLimitedClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let timeout = request.timeout.unwrap_or(self.policy.request_timeout);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;

        loop {
            let outcome = match tokio::time::timeout(timeout, self.transport.send(request)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout),
            };

            let delay = match &outcome {
                Ok(response) if response.status == 429 => Some(
                    response
                        .retry_after()
                        .map_or(backoff, |server_delay| server_delay.max(backoff)),
                ),
                Ok(response) if response.status >= 500 => Some(backoff),
                Ok(_) => None,
                Err(_) => Some(backoff),
            };

            match delay {
                Some(delay) if attempt < max_attempts => {
                    match &outcome {
                        Ok(response) => warn!(
                            url = %request.url,
                            status = response.status,
                            attempt,
                            ?delay,
                            "request failed, retrying"
                        ),
                        Err(error) => warn!(
                            url = %request.url,
                            %error,
                            attempt,
                            ?delay,
                            "request failed, retrying"
                        ),
                    }
                    tokio::time::sleep(delay).await;
                    backoff = backoff.mul_f64(self.policy.backoff_factor);
                    attempt += 1;
                }
                Some(_) => {
                    debug!(url = %request.url, attempt, "retries exhausted");
                    return outcome;
                }
                None => return outcome,
            }
        }
    }

    /// Execute a request built from the current credential.
    ///
    /// An already-expired access token is refreshed before the first attempt. A 401/403
    /// answer triggers exactly one refresh followed by exactly one more attempt; any
    /// refresh failure yields [`LookupError::AuthFailed`].
    pub async fn execute_authorized<F>(
        &self,
        credentials: &CredentialStore,
        build: F,
    ) -> Result<HttpResponse, LookupError>
    where
        F: Fn(&Credential) -> HttpRequest,
    {
        let credential = credentials.ensure_fresh().await.map_err(|error| {
            warn!(%error, "pre-emptive credential refresh failed");
            LookupError::AuthFailed
        })?;

        let response = self.execute(&build(&credential)).await?;
        if !matches!(response.status, 401 | 403) {
            return Ok(response);
        }

        debug!(
            status = response.status,
            "authenticated request rejected, refreshing credential"
        );
        let refreshed = credentials
            .refresh_if_current(&credential.access_token)
            .await
            .map_err(|error| {
                warn!(%error, "credential refresh after auth failure was rejected");
                LookupError::AuthFailed
            })?;

        Ok(self.execute(&build(&refreshed)).await?)
    }
}
