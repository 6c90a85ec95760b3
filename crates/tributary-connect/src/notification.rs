//! Object-queue notification resolution
//!
//! A queue message body describes zero or more objects to fetch. Supported
//! envelopes, checked in order:
//!
//! 1. SNS wrapper: `{"Type": "Notification", "Message": "<json string>"}`,
//!    unwrapped once
//! 2. S3 event: `{"Records": [{"s3": {"bucket": {"name"}, "object": {"key"}}}]}`
//! 3. EventBridge-style: `{"detail": {"bucket": {"name"}, "object": {"key"}}}`
//! 4. File batch: `{"bucket": "...", "files": [{"path": "..."}]}`
//! 5. Azure Event Grid blob events: `{"data": {"url": "https://acct.blob.core.windows.net/<container>/<blob>"}}`,
//!    alone or in a top-level array
//!
//! Keys are percent-decoded exactly once. S3 event keys are form-encoded, so
//! `+` also decodes to a space there.

use crate::error::{ConnectorError, ConnectorResult};
use serde_json::Value;
use std::borrow::Cow;
use tracing::debug;

/// One object named by a notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub source_account_id: Option<String>,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            source_account_id: None,
        }
    }

    fn with_account(mut self, account: Option<&str>) -> Self {
        self.source_account_id = account.map(str::to_string);
        self
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Resolve a raw message body into the objects it references.
///
/// A body that is not JSON is a poison payload. A JSON body of an unknown
/// shape, or an S3 test event, resolves to no objects.
pub fn resolve(body: &str) -> ConnectorResult<Vec<ObjectRef>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ConnectorError::poison(format!("notification is not JSON: {}", e)))?;

    // SNS delivers the S3 event as a JSON string inside "Message"
    if let Some(message) = sns_message(&value) {
        let inner: Value = serde_json::from_str(message).map_err(|e| {
            ConnectorError::poison(format!("SNS message is not JSON: {}", e))
        })?;
        return Ok(resolve_value(&inner));
    }

    Ok(resolve_value(&value))
}

fn sns_message(value: &Value) -> Option<&str> {
    let message = value.get("Message")?.as_str()?;
    let is_sns = value.get("Type").and_then(Value::as_str) == Some("Notification")
        || value.get("TopicArn").is_some();
    is_sns.then_some(message)
}

fn resolve_value(value: &Value) -> Vec<ObjectRef> {
    if let Value::Array(events) = value {
        return events.iter().flat_map(resolve_value).collect();
    }

    if let Some(records) = value.get("Records").and_then(Value::as_array) {
        return records.iter().filter_map(s3_record).collect();
    }

    if let Some(detail) = value.get("detail") {
        let bucket = detail.pointer("/bucket/name").and_then(Value::as_str);
        let key = detail.pointer("/object/key").and_then(Value::as_str);
        if let (Some(bucket), Some(key)) = (bucket, key) {
            let account = value.get("account").and_then(Value::as_str);
            return vec![ObjectRef::new(bucket, decode_key(key, false)).with_account(account)];
        }
    }

    if let (Some(bucket), Some(files)) = (
        value.get("bucket").and_then(Value::as_str),
        value.get("files").and_then(Value::as_array),
    ) {
        let account = value.get("cid").and_then(Value::as_str);
        return files
            .iter()
            .filter_map(|file| file.get("path").and_then(Value::as_str))
            .map(|path| ObjectRef::new(bucket, decode_key(path, false)).with_account(account))
            .collect();
    }

    if let Some(url) = value.pointer("/data/url").and_then(Value::as_str) {
        return blob_url(url).into_iter().collect();
    }

    debug!("Notification has no recognizable object references");
    Vec::new()
}

fn s3_record(record: &Value) -> Option<ObjectRef> {
    let bucket = record.pointer("/s3/bucket/name")?.as_str()?;
    let key = record.pointer("/s3/object/key")?.as_str()?;
    let account = record
        .get("recipientAccountId")
        .or_else(|| record.pointer("/userIdentity/accountId"))
        .and_then(Value::as_str);
    Some(ObjectRef::new(bucket, decode_key(key, true)).with_account(account))
}

fn blob_url(url: &str) -> Option<ObjectRef> {
    let parsed = url::Url::parse(url).ok()?;
    let path = parsed.path().trim_start_matches('/');
    let (container, blob) = path.split_once('/')?;
    if container.is_empty() || blob.is_empty() {
        return None;
    }
    let account = parsed.host_str().and_then(|host| host.split('.').next());
    Some(ObjectRef::new(decode_key(container, false), decode_key(blob, false)).with_account(account))
}

/// Percent-decode once; `+` means space in form-encoded keys.
///
/// Invalid UTF-8 after decoding falls back to the raw key.
pub fn decode_key(key: &str, plus_as_space: bool) -> String {
    let key: Cow<'_, str> = if plus_as_space && key.contains('+') {
        Cow::Owned(key.replace('+', " "))
    } else {
        Cow::Borrowed(key)
    };
    match urlencoding::decode(&key) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => key.into_owned(),
    }
}
