//! Error types for tributary-connect
//!
//! Two layers: [`HttpError`] is what the HTTP client surfaces once its own
//! retries are exhausted, and [`ConnectorError`] is the classified error that
//! connectors log and act upon (advance or hold the checkpoint, ack or abandon
//! a queue message).

use thiserror::Error;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Errors returned by [`crate::http::HttpClient::request`]
#[derive(Debug, Error)]
pub enum HttpError {
    /// A retriable status (429, 500, 502, 503, 504) persisted through every attempt
    #[error("transient HTTP {status} after {attempts} attempts")]
    Transient { status: u16, attempts: u32 },

    /// 401/403, or the credentials could not be refreshed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Any other 4xx
    #[error("client error HTTP {status}: {body}")]
    Client { status: u16, body: String },

    /// 5xx outside the retriable set
    #[error("server error HTTP {status}: {body}")]
    Server { status: u16, body: String },

    /// Connection-level failure after every attempt
    #[error("network error after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },

    /// The request could not be built (bad URL, bad header value)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpError {
    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. }
            | Self::Client { status, .. }
            | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Coarse classification used for structured logs and the error counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    Transient,
    Client,
    PoisonPayload,
    IntakeUnavailable,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Transient => "transient",
            Self::Client => "client",
            Self::PoisonPayload => "poison_payload",
            Self::IntakeUnavailable => "intake_unavailable",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Credentials invalid or expired and unrefreshable
    #[error("authentication error: {0}")]
    Auth(String),

    /// Retriable failure that outlived the HTTP client's own retries
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Non-retriable request-side problem
    #[error("client error: {0}")]
    Client(String),

    /// Payload the codec cannot parse
    #[error("poison payload: {0}")]
    PoisonPayload(String),

    /// The intake did not accept a batch after retries
    #[error("intake unavailable: {0}")]
    IntakeUnavailable(String),

    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint store error
    #[error("state error: {0}")]
    State(String),

    /// Queue backend error
    #[error("queue error: {0}")]
    Queue(String),

    /// Object storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::IntakeUnavailable(_) | Self::Queue(_) | Self::Storage(_)
        )
    }

    /// Classify for logging and metrics
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Transient(_) | Self::Queue(_) | Self::Storage(_) => ErrorKind::Transient,
            Self::Client(_) => ErrorKind::Client,
            Self::PoisonPayload(_) => ErrorKind::PoisonPayload,
            Self::IntakeUnavailable(_) => ErrorKind::IntakeUnavailable,
            Self::Config(_) | Self::Yaml(_) => ErrorKind::Config,
            Self::State(_) | Self::Io(_) | Self::Json(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a poison payload error
    pub fn poison(msg: impl Into<String>) -> Self {
        Self::PoisonPayload(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}

impl From<HttpError> for ConnectorError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Auth(msg) => Self::Auth(msg),
            HttpError::Client { .. } | HttpError::InvalidRequest(_) => {
                Self::Client(err.to_string())
            }
            HttpError::Transient { .. } | HttpError::Server { .. } | HttpError::Network { .. } => {
                Self::Transient(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_mapping() {
        let auth: ConnectorError = HttpError::Auth("expired".into()).into();
        assert_eq!(auth.kind(), ErrorKind::Auth);
        assert!(!auth.is_retryable());

        let client: ConnectorError = HttpError::Client {
            status: 400,
            body: "bad".into(),
        }
        .into();
        assert_eq!(client.kind(), ErrorKind::Client);

        let transient: ConnectorError = HttpError::Transient {
            status: 503,
            attempts: 5,
        }
        .into();
        assert!(transient.is_retryable());

        // Non-retriable 5xx still classifies as transient above the client
        let server: ConnectorError = HttpError::Server {
            status: 501,
            body: String::new(),
        }
        .into();
        assert_eq!(server.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(
            HttpError::Client {
                status: 404,
                body: String::new()
            }
            .status(),
            Some(404)
        );
        assert_eq!(HttpError::Auth("x".into()).status(), None);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::PoisonPayload.to_string(), "poison_payload");
        assert_eq!(
            ConnectorError::config("missing queue_name").kind(),
            ErrorKind::Config
        );
    }
}
