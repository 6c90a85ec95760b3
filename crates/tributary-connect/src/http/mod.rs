//! Rate-limited, retrying HTTP client
//!
//! One [`HttpClient`] is built per connector and cloned into every worker.
//! Clones share the connection pool, the auth strategy (and therefore the
//! OAuth2 token cache) and the per-host rate limiter buckets.
//!
//! # Request lifecycle
//!
//! ```text
//! limiter.acquire ─▶ build ─▶ auth.sign ─▶ send ─┬─ 2xx ─────────────▶ Ok(response)
//!        ▲                                       ├─ 401 (once) ──────▶ invalidate + resend
//!        │                                       ├─ 429/5xx/network ─▶ wait, retry
//!        └───────────────────────────────────────┘  otherwise ───────▶ Err(HttpError)
//! ```

pub mod auth;
pub mod retry;

pub use auth::{
    AuthStrategy, BasicAuth, HmacSigned, NoAuth, OAuth2ClientCredentials, StaticToken,
};
pub use retry::RetryPolicy;

use crate::error::HttpError;
use crate::rate_limiter::{RateLimitConfig, RateLimiterRegistry};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Response};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HttpClientConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum attempts per request, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Client-side rate limit, applied per destination host
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// User-Agent header
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    concat!("tributary-connect/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            rate_limit: RateLimitConfig::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpClientConfig {
    /// Bare client carrying the timeout and user agent
    pub fn build_client(&self) -> Result<reqwest::Client, HttpError> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| HttpError::InvalidRequest(format!("failed to build client: {}", e)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts).with_backoff(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }
}

/// Shared HTTP client with auth, retries and rate limiting
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    auth: Arc<dyn AuthStrategy>,
    retry: RetryPolicy,
    limiters: RateLimiterRegistry,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("auth", &self.auth.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl HttpClient {
    pub fn new(config: &HttpClientConfig, auth: Arc<dyn AuthStrategy>) -> Result<Self, HttpError> {
        Ok(Self {
            inner: config.build_client()?,
            auth,
            retry: config.retry_policy(),
            limiters: RateLimiterRegistry::new(config.rate_limit),
        })
    }

    /// Client without authentication
    pub fn unauthenticated(config: &HttpClientConfig) -> Result<Self, HttpError> {
        Self::new(config, Arc::new(NoAuth))
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn rate_limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    /// Send a request, retrying transient failures.
    ///
    /// Returns the first 2xx response, or the classified error once the
    /// retry budget is spent.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        headers: Option<&HeaderMap>,
    ) -> Result<Response, HttpError> {
        let url = Url::parse(url).map_err(|e| HttpError::InvalidRequest(format!("{}: {}", url, e)))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let limiter = self.limiters.for_host(&host);

        let max_attempts = self.retry.max_attempts;
        let mut attempt = 0u32;
        let mut reauthenticated = false;

        loop {
            attempt += 1;
            limiter.acquire().await;

            let mut builder = self.inner.request(method.clone(), url.clone());
            if let Some(headers) = headers {
                builder = builder.headers(headers.clone());
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }
            let mut request = builder
                .build()
                .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
            self.auth.sign(&mut request).await?;
            let signed_headers = request.headers().clone();

            match self.inner.execute(request).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        return Ok(response);
                    }

                    if status == 401 || status == 403 {
                        // A rejected token may have been revoked early; one fresh try
                        if status == 401
                            && !reauthenticated
                            && self.auth.invalidate(&signed_headers).await
                        {
                            reauthenticated = true;
                            debug!(host = %host, "Credentials rejected, retrying with fresh token");
                            attempt -= 1;
                            continue;
                        }
                        return Err(HttpError::Auth(format!(
                            "{} {} returned HTTP {}",
                            method,
                            url.path(),
                            status
                        )));
                    }

                    if RetryPolicy::is_retriable_status(status) {
                        if attempt >= max_attempts {
                            return Err(HttpError::Transient {
                                status,
                                attempts: attempt,
                            });
                        }

                        match retry::server_advised_delay(response.headers(), chrono::Utc::now()) {
                            Some(delay) => {
                                warn!(
                                    host = %host,
                                    status,
                                    attempt,
                                    "Server asked to back off for {:?}",
                                    delay
                                );
                                // Every caller hitting this host waits, not just this one
                                limiter.defer(delay);
                            }
                            None => {
                                let delay = self.retry.backoff(attempt);
                                warn!(host = %host, status, attempt, "Retrying after {:?}", delay);
                                tokio::time::sleep(delay).await;
                            }
                        }
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    return Err(if status >= 500 {
                        HttpError::Server { status, body }
                    } else {
                        HttpError::Client { status, body }
                    });
                }
                Err(e) => {
                    if e.is_builder() {
                        return Err(HttpError::InvalidRequest(e.to_string()));
                    }
                    let transient = e.is_timeout() || e.is_connect() || e.is_request();
                    if !transient || attempt >= max_attempts {
                        return Err(HttpError::Network {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(host = %host, attempt, error = %e, "Request failed, retrying after {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// `GET url`
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::GET, url, None, None).await
    }

    /// `POST url` with a JSON body
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        value: &T,
    ) -> Result<Response, HttpError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| HttpError::InvalidRequest(format!("failed to encode body: {}", e)))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.request(Method::POST, url, Some(Bytes::from(body)), Some(&headers))
            .await
    }
}
