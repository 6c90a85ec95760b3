//! Connector configuration
//!
//! One flat YAML document per connector. `${VAR}` and `${VAR:-default}`
//! references are expanded from the environment before parsing, so
//! credentials can stay out of the file:
//!
//! ```yaml
//! name: cloudtrail
//! intake_url: https://intake.example.com/batch
//! intake_key: ${INTAKE_KEY}
//! queue_name: cloudtrail-notifications
//! codec:
//!   type: json_records
//! ```

use crate::checkpoint::FileCheckpointStore;
use crate::codec::CodecConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::forwarder::ForwarderConfig;
use crate::http::auth::{
    AuthStrategy, BasicAuth, HmacSigned, NoAuth, OAuth2ClientCredentials, StaticToken,
};
use crate::http::{HttpClient, HttpClientConfig};
use crate::pull::{CursorBoundary, PullConfig};
use crate::queue::QueueConsumerConfig;
use crate::types::SensitiveString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use validator::Validate;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Configuration of one connector
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ConnectorConfig {
    /// Connector name, used for logs, metrics and the checkpoint file
    #[validate(length(min = 1, max = 128))]
    pub name: String,

    /// Tenant identifier sent with every push
    pub intake_key: SensitiveString,

    /// Endpoint the forwarder posts batches to
    #[validate(url)]
    pub intake_url: String,

    /// Seconds between pull iterations
    #[serde(default = "default_frequency")]
    #[validate(range(min = 1, max = 86_400))]
    pub frequency: u64,

    /// Queue to poll; set for queue-mode connectors
    #[serde(default)]
    #[validate(length(min = 1))]
    pub queue_name: Option<String>,

    /// Seconds to pause after an empty receive
    #[serde(default = "default_sqs_frequency")]
    #[validate(range(max = 3600))]
    pub sqs_frequency: u64,

    /// Seconds a received message stays hidden from other consumers
    #[serde(default = "default_visibility_timeout")]
    #[validate(range(max = 43_200))]
    pub visibility_timeout: u32,

    /// Messages per receive
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 10))]
    pub batch_size: usize,

    /// Delete messages once processed; disable only for testing
    #[serde(default = "default_true")]
    pub delete_consumed_messages: bool,

    /// Queue workers
    #[serde(default = "default_max_concurrency")]
    #[validate(range(min = 1, max = 256))]
    pub max_concurrency: usize,

    /// Largest object accepted once decompressed
    #[serde(default = "default_max_object_bytes")]
    #[validate(range(min = 1024))]
    pub max_object_bytes: usize,

    /// Records per intake batch
    #[serde(default = "default_max_batch_count")]
    #[validate(range(min = 1, max = 100_000))]
    pub max_batch_count: usize,

    /// Serialized bytes per intake batch
    #[serde(default = "default_max_batch_bytes")]
    #[validate(range(min = 1024))]
    pub max_batch_bytes: usize,

    /// Seconds a partial batch may wait before it is sent
    #[serde(default = "default_max_linger")]
    #[validate(range(min = 0.0, max = 300.0))]
    pub max_linger: f64,

    /// Records larger than this are dropped
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,

    /// Oldest point a timestamp cursor may start from
    #[serde(default = "default_max_lookback_days")]
    #[validate(range(min = 1, max = 365))]
    pub max_lookback_days: u32,

    /// Page limit per pull iteration
    #[serde(default = "default_max_pages")]
    #[validate(range(min = 1))]
    pub max_pages_per_iteration: usize,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1))]
    pub page_size: usize,

    /// How the next lower bound is derived from a timestamp cursor
    #[serde(default)]
    pub cursor_boundary: CursorBoundary,

    /// Seconds to wait for a graceful stop before aborting
    #[serde(default = "default_max_shutdown")]
    #[validate(range(min = 1, max = 600))]
    pub max_shutdown_seconds: u64,

    /// Directory holding checkpoint files
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Vendor API authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Object payload codec
    #[serde(default)]
    pub codec: CodecConfig,

    /// HTTP client settings for vendor and intake calls
    #[serde(default)]
    pub http: HttpClientConfig,

    /// Object storage and queue endpoints
    #[serde(default)]
    pub aws: AwsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_frequency() -> u64 {
    60
}

fn default_sqs_frequency() -> u64 {
    10
}

fn default_visibility_timeout() -> u32 {
    300
}

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_object_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_max_batch_count() -> usize {
    1000
}

fn default_max_batch_bytes() -> usize {
    1024 * 1024
}

fn default_max_linger() -> f64 {
    5.0
}

fn default_max_record_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_lookback_days() -> u32 {
    7
}

fn default_max_pages() -> usize {
    100
}

fn default_page_size() -> usize {
    100
}

fn default_max_shutdown() -> u64 {
    30
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

/// Vendor authentication strategy
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    /// `Authorization: <scheme> <token>`, or `<header>: <token>` when `header` is set
    StaticToken {
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default)]
        header: Option<String>,
        token: SensitiveString,
    },
    Basic {
        username: String,
        password: SensitiveString,
    },
    HmacSigned {
        public_token: String,
        private_token: SensitiveString,
    },
    Oauth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: SensitiveString,
        #[serde(default)]
        scope: Option<String>,
    },
}

fn default_scheme() -> String {
    "Bearer".to_string()
}

impl AuthConfig {
    /// Build the strategy; token requests share the timeout of `http`
    pub fn build(&self, http: &HttpClientConfig) -> ConnectorResult<Arc<dyn AuthStrategy>> {
        Ok(match self {
            Self::None => Arc::new(NoAuth),
            Self::StaticToken {
                header: Some(header),
                token,
                ..
            } => Arc::new(
                StaticToken::with_header(header, token.clone())
                    .map_err(|e| ConnectorError::config(e.to_string()))?,
            ),
            Self::StaticToken {
                scheme,
                header: None,
                token,
            } => Arc::new(StaticToken::new(scheme.clone(), token.clone())),
            Self::Basic { username, password } => {
                Arc::new(BasicAuth::new(username.clone(), password.clone()))
            }
            Self::HmacSigned {
                public_token,
                private_token,
            } => Arc::new(HmacSigned::new(public_token.clone(), private_token.clone())),
            Self::Oauth2ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scope,
            } => Arc::new(
                OAuth2ClientCredentials::new(
                    token_url.clone(),
                    client_id.clone(),
                    client_secret.clone(),
                    scope.clone(),
                )
                .with_http_client(http.build_client()?),
            ),
        })
    }
}

/// Overrides for AWS clients; unset values come from the environment
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct AwsConfig {
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint (LocalStack, MinIO)
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Prometheus exporter
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> ConnectorResult<SocketAddr> {
        self.listen.parse().map_err(|e| {
            ConnectorError::config(format!("invalid metrics listen address '{}': {}", self.listen, e))
        })
    }
}

impl ConnectorConfig {
    /// Load, expand and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ConnectorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse, expand and validate a YAML document
    pub fn from_yaml(content: &str) -> ConnectorResult<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| ConnectorError::config(format!("failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Field ranges plus cross-field rules
    pub fn check(&self) -> ConnectorResult<()> {
        self.validate()
            .map_err(|e| ConnectorError::config(format!("invalid config '{}': {}", self.name, e)))?;

        if self.intake_key.expose_secret().is_empty() {
            return Err(ConnectorError::config("intake_key must not be empty"));
        }
        if self.max_record_bytes < self.max_batch_bytes {
            return Err(ConnectorError::config(format!(
                "max_record_bytes ({}) must be at least max_batch_bytes ({})",
                self.max_record_bytes, self.max_batch_bytes
            )));
        }
        if self.http.max_attempts == 0 {
            return Err(ConnectorError::config("http.max_attempts must be at least 1"));
        }
        if self.metrics.enabled {
            self.metrics.listen_addr()?;
        }
        self.codec.build()?;
        Ok(())
    }

    pub fn is_queue_mode(&self) -> bool {
        self.queue_name.is_some()
    }

    pub fn max_shutdown(&self) -> Duration {
        Duration::from_secs(self.max_shutdown_seconds)
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            max_batch_count: self.max_batch_count,
            max_batch_bytes: self.max_batch_bytes,
            max_linger: Duration::from_secs_f64(self.max_linger),
            max_record_bytes: self.max_record_bytes,
            channel_capacity: self.max_concurrency.max(1) * 4,
            ..ForwarderConfig::new(self.intake_url.clone(), self.intake_key.clone())
        }
    }

    pub fn consumer_config(&self) -> ConnectorResult<QueueConsumerConfig> {
        let queue_name = self
            .queue_name
            .clone()
            .ok_or_else(|| ConnectorError::config("queue_name is required in queue mode"))?;
        Ok(QueueConsumerConfig {
            poll_interval: Duration::from_secs(self.sqs_frequency),
            visibility_timeout: self.visibility_timeout,
            batch_size: self.batch_size,
            delete_consumed_messages: self.delete_consumed_messages,
            max_concurrency: self.max_concurrency,
            max_object_bytes: self.max_object_bytes,
            ..QueueConsumerConfig::new(queue_name)
        })
    }

    pub fn pull_config(&self) -> PullConfig {
        PullConfig {
            frequency: Duration::from_secs(self.frequency),
            max_lookback: chrono::Duration::days(i64::from(self.max_lookback_days)),
            max_pages_per_iteration: self.max_pages_per_iteration,
            page_size: self.page_size,
            boundary: self.cursor_boundary,
        }
    }

    /// HTTP client signed with the configured vendor credentials
    pub fn vendor_http_client(&self) -> ConnectorResult<HttpClient> {
        Ok(HttpClient::new(&self.http, self.auth.build(&self.http)?)?)
    }

    /// HTTP client for intake pushes; the intake key travels in the body
    pub fn intake_http_client(&self) -> ConnectorResult<HttpClient> {
        Ok(HttpClient::unauthenticated(&self.http)?)
    }

    pub async fn checkpoint_store(&self) -> ConnectorResult<FileCheckpointStore> {
        FileCheckpointStore::new(&self.checkpoint_dir, &self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: cloudtrail
intake_url: https://intake.example.com/batch
intake_key: tenant-key
queue_name: cloudtrail-events
"#;

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.frequency, 60);
        assert_eq!(config.sqs_frequency, 10);
        assert_eq!(config.visibility_timeout, 300);
        assert_eq!(config.batch_size, 10);
        assert!(config.delete_consumed_messages);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.max_object_bytes, 512 * 1024 * 1024);
        assert_eq!(config.max_batch_count, 1000);
        assert_eq!(config.max_batch_bytes, 1024 * 1024);
        assert_eq!(config.max_lookback_days, 7);
        assert_eq!(config.max_shutdown(), Duration::from_secs(30));
        assert_eq!(config.http.max_attempts, 5);
        assert!(config.is_queue_mode());
        assert!(matches!(config.auth, AuthConfig::None));
        assert_eq!(config.codec, CodecConfig::default());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("TRIBUTARY_TEST_INTAKE_KEY", "from-env");
        let yaml = r#"
name: okta
intake_url: ${TRIBUTARY_TEST_INTAKE_URL:-https://intake.example.com/batch}
intake_key: ${TRIBUTARY_TEST_INTAKE_KEY}
"#;
        let config = ConnectorConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.intake_key.expose_secret(), "from-env");
        assert_eq!(config.intake_url, "https://intake.example.com/batch");
        assert!(!config.is_queue_mode());
    }

    #[test]
    fn test_range_validation() {
        let yaml = format!("{}batch_size: 11\n", MINIMAL);
        let err = ConnectorConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_invalid_intake_url() {
        let yaml = MINIMAL.replace("https://intake.example.com/batch", "not a url");
        assert!(ConnectorConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_record_limit_must_cover_batch() {
        let yaml = format!("{}max_batch_bytes: 2048\nmax_record_bytes: 1024\n", MINIMAL);
        let err = ConnectorConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("max_record_bytes"));
    }

    #[test]
    fn test_bad_metrics_listen() {
        let yaml = format!("{}metrics:\n  enabled: true\n  listen: nowhere\n", MINIMAL);
        assert!(ConnectorConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_auth_variants() {
        let yaml = format!(
            "{}auth:\n  type: oauth2_client_credentials\n  token_url: https://idp.example.com/token\n  client_id: abc\n  client_secret: s3cret\n",
            MINIMAL
        );
        let config = ConnectorConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.auth.build(&config.http).unwrap().name(), "oauth2_client_credentials");
        // Secrets never leak through Debug
        assert!(!format!("{:?}", config).contains("s3cret"));

        let yaml = format!(
            "{}auth:\n  type: static_token\n  header: x-api-key\n  token: k\n",
            MINIMAL
        );
        let config = ConnectorConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.auth.build(&config.http).unwrap().name(), "static_token");

        let yaml = format!(
            "{}auth:\n  type: hmac_signed\n  public_token: pub\n  private_token: priv\n",
            MINIMAL
        );
        let config = ConnectorConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.auth.build(&config.http).unwrap().name(), "hmac_signed");
    }

    #[test]
    fn test_derived_configs() {
        let yaml = format!(
            "{}max_linger: 0.5\nmax_concurrency: 2\ncursor_boundary: next_second\ncodec:\n  type: csv\n  separator: \";\"\n",
            MINIMAL
        );
        let config = ConnectorConfig::from_yaml(&yaml).unwrap();

        let forwarder = config.forwarder_config();
        assert_eq!(forwarder.max_linger, Duration::from_millis(500));
        assert_eq!(forwarder.intake_key.expose_secret(), "tenant-key");

        let consumer = config.consumer_config().unwrap();
        assert_eq!(consumer.queue_name, "cloudtrail-events");
        assert_eq!(consumer.max_concurrency, 2);
        assert_eq!(consumer.poll_interval, Duration::from_secs(10));

        let pull = config.pull_config();
        assert_eq!(pull.boundary, CursorBoundary::NextSecond);
        assert_eq!(pull.max_lookback, chrono::Duration::days(7));
    }

    #[test]
    fn test_schema_generation() {
        let schema = schemars::schema_for!(ConnectorConfig);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("intake_key"));
        assert!(json.contains("oauth2_client_credentials"));
    }

    #[tokio::test]
    async fn test_checkpoint_store_under_dir() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!("{}checkpoint_dir: {}\n", MINIMAL, dir.path().display());
        let config = ConnectorConfig::from_yaml(&yaml).unwrap();
        let store = config.checkpoint_store().await.unwrap();
        assert_eq!(store.path(), dir.path().join("cloudtrail.json"));
    }

    #[tokio::test]
    async fn test_token_request_uses_http_timeout() {
        use std::io::Write;

        let mut server = mockito::Server::new_async().await;
        let _idp = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_secs(5));
                w.write_all(br#"{"access_token":"late"}"#)
            })
            .create_async()
            .await;

        let auth = AuthConfig::Oauth2ClientCredentials {
            token_url: format!("{}/oauth/token", server.url()),
            client_id: "cid".into(),
            client_secret: SensitiveString::new("secret"),
            scope: None,
        };
        let http = HttpClientConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let strategy = auth.build(&http).unwrap();

        let mut request = reqwest::Request::new(
            reqwest::Method::GET,
            "https://api.example.com/events".parse().unwrap(),
        );
        let started = std::time::Instant::now();
        let err = strategy.sign(&mut request).await.unwrap_err();

        assert!(matches!(err, crate::error::HttpError::Auth(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
