//! Common types for tributary-connect
//!
//! [`Record`] is the unit every component moves around. [`SensitiveString`]
//! wraps credentials so they never end up in logs or config dumps.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// An opaque payload (usually one JSON line) plus the timestamp a codec or
/// pull source extracted from it.
///
/// The runtime only looks at the byte length and the timestamp; the payload is
/// forwarded verbatim. Payloads that are not valid UTF-8 cannot be carried in
/// a JSON intake body and are discarded by the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub payload: Bytes,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Byte length of the payload
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Length of the payload once written as the body of a JSON string,
    /// with quotes and backslashes escaped and control characters encoded
    pub fn escaped_len(&self) -> usize {
        self.as_str_lossy()
            .bytes()
            .map(|b| match b {
                b'"' | b'\\' | b'\n' | b'\r' | b'\t' | 0x08 | 0x0c => 2,
                0x00..=0x1f => 6,
                _ => 1,
            })
            .sum()
    }

    /// Upper bound of the bytes this record adds to an intake body: the
    /// escaped payload, its quotes and a separator
    pub fn encoded_len(&self) -> usize {
        self.escaped_len() + 3
    }

    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// Payload as a string, replacing invalid UTF-8.
    ///
    /// The forwarder drops non-UTF-8 records before sending, so records
    /// reaching the intake are never altered by the replacement.
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<&str> for Record {
    fn from(value: &str) -> Self {
        Self::new(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Record {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A wrapper around `SecretString` that keeps credentials out of logs.
///
/// - `Debug` and `Display` print `[REDACTED]`
/// - serializes as `"***REDACTED***"`
/// - `expose_secret()` gives access when the value is actually needed
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value. Only call this when signing a request.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

impl JsonSchema for SensitiveString {
    fn schema_name() -> String {
        "SensitiveString".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = gen.subschema_for::<String>();
        if let schemars::schema::Schema::Object(obj) = &mut schema {
            obj.format = Some("password".to_string());
            obj.metadata().description =
                Some("Credential or tenant key. Redacted in logs.".to_string());
        }
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_string_redacted() {
        let secret = SensitiveString::new("intake-key-123");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert_eq!(secret.expose_secret(), "intake-key-123");
    }

    #[test]
    fn test_sensitive_string_serde() {
        let secret: SensitiveString = serde_json::from_str("\"s3cr3t\"").unwrap();
        assert_eq!(secret.expose_secret(), "s3cr3t");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"***REDACTED***\"");
    }

    #[test]
    fn test_record_sizes() {
        let record = Record::from("{\"a\":1}");
        assert_eq!(record.len(), 7);
        // Four quotes gain a backslash each
        assert_eq!(record.escaped_len(), 11);
        assert_eq!(record.encoded_len(), 14);
        assert!(record.timestamp.is_none());
        assert!(!Record::from("x").is_empty());
    }

    #[test]
    fn test_escaped_len_matches_serde_json() {
        for payload in ["plain", "q\"u\\o", "tab\tnl\nbell\u{7}", "ünïcødé", ""] {
            let record = Record::from(payload);
            let json = serde_json::to_string(payload).unwrap();
            assert_eq!(record.escaped_len() + 2, json.len(), "{:?}", payload);
        }
    }

    #[test]
    fn test_non_utf8_detected() {
        assert!(Record::from("ok").is_utf8());
        assert!(!Record::new(vec![0xff, 0xfe]).is_utf8());
    }
}
