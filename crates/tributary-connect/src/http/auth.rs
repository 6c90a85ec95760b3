//! Authentication strategies
//!
//! Each strategy attaches its headers to a fully built request right before
//! it is sent, so signatures that cover the URL or a timestamp are computed
//! per attempt.
//!
//! | Strategy | Headers |
//! |---|---|
//! | [`StaticToken`] | `Authorization: <scheme> <value>` or a vendor header |
//! | [`BasicAuth`] | `Authorization: Basic base64(user:pass)` |
//! | [`HmacSigned`] | `DTAPI-Token`, `DTAPI-Date`, `DTAPI-Signature` |
//! | [`OAuth2ClientCredentials`] | `Authorization: Bearer <access_token>` |

use crate::error::HttpError;
use crate::types::SensitiveString;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use sha1::Sha1;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Minimum safety margin before an OAuth2 token's expiry
pub const MIN_TOKEN_SKEW: Duration = Duration::from_secs(60);

/// Signs outgoing requests
#[async_trait]
pub trait AuthStrategy: Send + Sync + std::fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Attach authentication headers to `request`
    async fn sign(&self, request: &mut reqwest::Request) -> Result<(), HttpError>;

    /// Force a credential refresh
    async fn refresh(&self) -> Result<(), HttpError> {
        Ok(())
    }

    /// Drop cached credentials after the server rejected the request that
    /// carried `rejected` headers.
    ///
    /// Credentials already replaced since that request was signed are kept.
    /// Returns true when retrying with fresh credentials may succeed.
    async fn invalidate(&self, _rejected: &HeaderMap) -> bool {
        false
    }
}

fn header_value(value: &str) -> Result<HeaderValue, HttpError> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| HttpError::InvalidRequest(format!("invalid header value: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

/// No authentication (intake pushes carry the key in the body)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl AuthStrategy for NoAuth {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn sign(&self, _request: &mut reqwest::Request) -> Result<(), HttpError> {
        Ok(())
    }
}

/// Fixed token, either as `Authorization: <scheme> <value>` or in a vendor header
#[derive(Debug, Clone)]
pub struct StaticToken {
    header: HeaderName,
    scheme: Option<String>,
    value: SensitiveString,
}

impl StaticToken {
    /// `Authorization: <scheme> <value>`
    pub fn new(scheme: impl Into<String>, value: SensitiveString) -> Self {
        Self {
            header: AUTHORIZATION,
            scheme: Some(scheme.into()),
            value,
        }
    }

    /// `<header>: <value>` (e.g. `x-api-key`)
    pub fn with_header(header: &str, value: SensitiveString) -> Result<Self, HttpError> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|e| HttpError::InvalidRequest(format!("invalid header name: {}", e)))?;
        Ok(Self {
            header,
            scheme: None,
            value,
        })
    }
}

#[async_trait]
impl AuthStrategy for StaticToken {
    fn name(&self) -> &'static str {
        "static_token"
    }

    async fn sign(&self, request: &mut reqwest::Request) -> Result<(), HttpError> {
        let value = match &self.scheme {
            Some(scheme) => format!("{} {}", scheme, self.value.expose_secret()),
            None => self.value.expose_secret().to_string(),
        };
        request
            .headers_mut()
            .insert(self.header.clone(), header_value(&value)?);
        Ok(())
    }
}

/// HTTP basic authentication
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: SensitiveString,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: SensitiveString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

#[async_trait]
impl AuthStrategy for BasicAuth {
    fn name(&self) -> &'static str {
        "basic"
    }

    async fn sign(&self, request: &mut reqwest::Request) -> Result<(), HttpError> {
        let credentials = format!("{}:{}", self.username, self.password.expose_secret());
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request
            .headers_mut()
            .insert(AUTHORIZATION, header_value(&format!("Basic {}", encoded))?);
        Ok(())
    }
}

/// Per-request HMAC-SHA1 signature over path, query, public token and date
#[derive(Debug, Clone)]
pub struct HmacSigned {
    public_token: String,
    private_token: SensitiveString,
}

impl HmacSigned {
    pub const TOKEN_HEADER: &'static str = "DTAPI-Token";
    pub const DATE_HEADER: &'static str = "DTAPI-Date";
    pub const SIGNATURE_HEADER: &'static str = "DTAPI-Signature";

    pub fn new(public_token: impl Into<String>, private_token: SensitiveString) -> Self {
        Self {
            public_token: public_token.into(),
            private_token,
        }
    }

    /// `hex(hmac_sha1(private, "<path>[?<query>]\n<public>\n<date>"))`
    pub fn signature(&self, path: &str, query: Option<&str>, date: &str) -> Result<String, HttpError> {
        let request_line = match query {
            Some(query) if !query.is_empty() => format!("{}?{}", path, query),
            _ => path.to_string(),
        };
        let message = format!("{}\n{}\n{}", request_line, self.public_token, date);

        let mut mac = Hmac::<Sha1>::new_from_slice(self.private_token.expose_secret().as_bytes())
            .map_err(|e| HttpError::Auth(format!("invalid HMAC key: {}", e)))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl AuthStrategy for HmacSigned {
    fn name(&self) -> &'static str {
        "hmac_signed"
    }

    async fn sign(&self, request: &mut reqwest::Request) -> Result<(), HttpError> {
        let date = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let signature = self.signature(request.url().path(), request.url().query(), &date)?;

        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_static("dtapi-token"),
            header_value(&self.public_token)?,
        );
        headers.insert(HeaderName::from_static("dtapi-date"), header_value(&date)?);
        headers.insert(
            HeaderName::from_static("dtapi-signature"),
            header_value(&signature)?,
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: SensitiveString,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_valid(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = ChronoDuration::from_std(skew).unwrap_or(ChronoDuration::seconds(60));
        now < self.expires_at - skew
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth2 client-credentials grant with an in-memory token cache.
///
/// The cache sits behind an async mutex: the first caller that finds the
/// token stale performs the refresh while holding the lock, later callers
/// wait and then reuse the new token.
#[derive(Debug)]
pub struct OAuth2ClientCredentials {
    token_url: String,
    client_id: String,
    client_secret: SensitiveString,
    scope: Option<String>,
    skew: Duration,
    http: reqwest::Client,
    cache: Mutex<Option<CachedToken>>,
    refreshes: AtomicU64,
}

impl OAuth2ClientCredentials {
    /// Tokens without `expires_in` are assumed to live this long
    const DEFAULT_TOKEN_LIFETIME: u64 = 3600;
    const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SensitiveString,
        scope: Option<String>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            scope,
            skew: MIN_TOKEN_SKEW,
            http: reqwest::Client::builder()
                .timeout(Self::DEFAULT_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            cache: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Safety margin before expiry; never below [`MIN_TOKEN_SKEW`]
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew.max(MIN_TOKEN_SKEW);
        self
    }

    /// HTTP client used to reach the token endpoint; it should carry a
    /// timeout, since token requests hold the refresh lock
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Seed the cache, e.g. with a token persisted by a previous run
    pub fn with_cached_token(self, access_token: SensitiveString, expires_at: DateTime<Utc>) -> Self {
        Self {
            cache: Mutex::new(Some(CachedToken {
                access_token,
                expires_at,
            })),
            ..self
        }
    }

    /// Number of token requests sent to the identity provider
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Current access token, refreshing it if it is stale
    pub async fn access_token(&self) -> Result<SensitiveString, HttpError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if token.is_valid(Utc::now(), self.skew) {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.fetch_token().await?;
        let access_token = token.access_token.clone();
        *cache = Some(token);
        Ok(access_token)
    }

    async fn fetch_token(&self) -> Result<CachedToken, HttpError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(token_url = %self.token_url, "Requesting OAuth2 access token");

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.expose_secret().to_string()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.clone()));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| HttpError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Auth(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| HttpError::Auth(format!("invalid token response: {}", e)))?;

        let lifetime = body.expires_in.unwrap_or(Self::DEFAULT_TOKEN_LIFETIME);
        let expires_at = Utc::now() + ChronoDuration::seconds(lifetime as i64);
        info!(expires_at = %expires_at, "Obtained OAuth2 access token");

        Ok(CachedToken {
            access_token: SensitiveString::new(body.access_token),
            expires_at,
        })
    }
}

#[async_trait]
impl AuthStrategy for OAuth2ClientCredentials {
    fn name(&self) -> &'static str {
        "oauth2_client_credentials"
    }

    async fn sign(&self, request: &mut reqwest::Request) -> Result<(), HttpError> {
        let token = self.access_token().await?;
        request.headers_mut().insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", token.expose_secret()))?,
        );
        Ok(())
    }

    async fn refresh(&self) -> Result<(), HttpError> {
        let mut cache = self.cache.lock().await;
        *cache = Some(self.fetch_token().await?);
        Ok(())
    }

    async fn invalidate(&self, rejected: &HeaderMap) -> bool {
        let mut cache = self.cache.lock().await;
        let sent = rejected
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        let stale = matches!(
            (cache.as_ref(), sent),
            (Some(token), Some(sent)) if token.access_token.expose_secret() == sent
        );
        if stale {
            debug!("Dropping rejected OAuth2 access token");
            cache.take();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    fn request(url: &str) -> reqwest::Request {
        reqwest::Request::new(Method::GET, url.parse().unwrap())
    }

    #[tokio::test]
    async fn test_static_token_scheme() {
        let auth = StaticToken::new("Token", SensitiveString::new("abc"));
        let mut req = request("https://api.example.com/v1/alerts");
        auth.sign(&mut req).await.unwrap();
        assert_eq!(req.headers()[AUTHORIZATION], "Token abc");
        assert!(req.headers()[AUTHORIZATION].is_sensitive());
    }

    #[tokio::test]
    async fn test_static_token_vendor_header() {
        let auth = StaticToken::with_header("x-api-key", SensitiveString::new("k1")).unwrap();
        let mut req = request("https://api.example.com/");
        auth.sign(&mut req).await.unwrap();
        assert_eq!(req.headers()["x-api-key"], "k1");
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_basic_auth() {
        let auth = BasicAuth::new("user", SensitiveString::new("pass"));
        let mut req = request("https://api.example.com/");
        auth.sign(&mut req).await.unwrap();
        // base64("user:pass")
        assert_eq!(req.headers()[AUTHORIZATION], "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_hmac_signature_known_vector() {
        let auth = HmacSigned::new("pub", SensitiveString::new("key"));

        // Same key/message computed independently with HMAC-SHA1
        let mut mac = Hmac::<Sha1>::new_from_slice(b"key").unwrap();
        mac.update(b"/modelbreaches?minscore=0.5\npub\n20240301T120000");
        let expected = hex::encode(mac.finalize().into_bytes());

        let signature = auth
            .signature("/modelbreaches", Some("minscore=0.5"), "20240301T120000")
            .unwrap();
        assert_eq!(signature, expected);
        assert_eq!(signature.len(), 40);
    }

    #[test]
    fn test_hmac_signature_without_query() {
        let auth = HmacSigned::new("pub", SensitiveString::new("key"));
        let without = auth.signature("/status", None, "20240301T120000").unwrap();
        let empty = auth.signature("/status", Some(""), "20240301T120000").unwrap();
        let with = auth.signature("/status", Some("a=1"), "20240301T120000").unwrap();
        assert_eq!(without, empty);
        assert_ne!(without, with);
    }

    #[tokio::test]
    async fn test_hmac_headers() {
        let auth = HmacSigned::new("pub", SensitiveString::new("key"));
        let mut req = request("https://dt.example.com/modelbreaches?minscore=0.5");
        auth.sign(&mut req).await.unwrap();

        let date = req.headers()[HmacSigned::DATE_HEADER].to_str().unwrap().to_string();
        assert_eq!(date.len(), "20240301T120000".len());
        assert_eq!(req.headers()[HmacSigned::TOKEN_HEADER], "pub");

        let expected = auth
            .signature("/modelbreaches", Some("minscore=0.5"), &date)
            .unwrap();
        assert_eq!(req.headers()[HmacSigned::SIGNATURE_HEADER], expected.as_str());
    }

    #[test]
    fn test_token_validity_respects_skew() {
        let now = Utc::now();
        let token = CachedToken {
            access_token: SensitiveString::new("t"),
            expires_at: now + ChronoDuration::seconds(90),
        };
        assert!(token.is_valid(now, MIN_TOKEN_SKEW));
        assert!(!token.is_valid(now + ChronoDuration::seconds(31), MIN_TOKEN_SKEW));
    }

    #[test]
    fn test_skew_floor() {
        let auth = OAuth2ClientCredentials::new(
            "https://idp.example.com/token",
            "id",
            SensitiveString::new("secret"),
            None,
        )
        .with_skew(Duration::from_secs(5));
        assert_eq!(auth.skew, MIN_TOKEN_SKEW);
    }

    #[tokio::test]
    async fn test_oauth2_fetches_and_caches() {
        let mut server = mockito::Server::new_async().await;
        let idp = server
            .mock("POST", "/oauth/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "cid".into()),
                mockito::Matcher::UrlEncoded("scope".into(), "read".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh","expires_in":3600,"token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let auth = OAuth2ClientCredentials::new(
            format!("{}/oauth/token", server.url()),
            "cid",
            SensitiveString::new("secret"),
            Some("read".into()),
        );

        for _ in 0..3 {
            let mut req = request("https://api.example.com/events");
            auth.sign(&mut req).await.unwrap();
            assert_eq!(req.headers()[AUTHORIZATION], "Bearer fresh");
        }

        idp.assert_async().await;
        assert_eq!(auth.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_oauth2_refresh_failure_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let _idp = server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .create_async()
            .await;

        let auth = OAuth2ClientCredentials::new(
            format!("{}/oauth/token", server.url()),
            "cid",
            SensitiveString::new("wrong"),
            None,
        );
        let mut req = request("https://api.example.com/events");
        let err = auth.sign(&mut req).await.unwrap_err();
        assert!(matches!(err, HttpError::Auth(_)));
    }

    #[tokio::test]
    async fn test_oauth2_invalidate_forces_refetch() {
        let mut server = mockito::Server::new_async().await;
        let idp = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"next","expires_in":600}"#)
            .expect(1)
            .create_async()
            .await;

        let auth = OAuth2ClientCredentials::new(
            format!("{}/oauth/token", server.url()),
            "cid",
            SensitiveString::new("secret"),
            None,
        )
        .with_cached_token(
            SensitiveString::new("revoked"),
            Utc::now() + ChronoDuration::hours(1),
        );

        let mut rejected = request("https://api.example.com/events");
        auth.sign(&mut rejected).await.unwrap();
        assert_eq!(rejected.headers()[AUTHORIZATION], "Bearer revoked");

        assert!(auth.invalidate(rejected.headers()).await);
        assert_eq!(auth.access_token().await.unwrap().expose_secret(), "next");

        // A late rejection of the old token keeps the replacement
        assert!(auth.invalidate(rejected.headers()).await);
        assert_eq!(auth.access_token().await.unwrap().expose_secret(), "next");
        idp.assert_async().await;
        assert_eq!(auth.refresh_count(), 1);
    }
}
