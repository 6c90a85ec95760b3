//! Whole-document JSON codecs

use super::{json_record, Codec, Decoded};
use crate::error::{ConnectorError, ConnectorResult};
use serde_json::Value;
use tracing::warn;

fn parse_document(data: &[u8]) -> ConnectorResult<Value> {
    serde_json::from_slice(data)
        .map_err(|e| ConnectorError::poison(format!("invalid JSON document: {}", e)))
}

/// Object with an array of events under one field (`{"Records": [...]}`)
///
/// An object without the field yields no records. A field that is not an
/// array, or a document that is not an object, is a poison payload.
#[derive(Debug, Clone)]
pub struct JsonRecordsCodec {
    field: String,
    timestamp_field: Option<String>,
}

impl JsonRecordsCodec {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            timestamp_field: None,
        }
    }

    pub fn with_timestamp_field(mut self, field: Option<String>) -> Self {
        self.timestamp_field = field;
        self
    }
}

impl Default for JsonRecordsCodec {
    fn default() -> Self {
        Self::new("Records")
    }
}

impl Codec for JsonRecordsCodec {
    fn name(&self) -> &'static str {
        "json_records"
    }

    fn decode(&self, data: &[u8]) -> ConnectorResult<Decoded> {
        let document = parse_document(data)?;
        let object = document
            .as_object()
            .ok_or_else(|| ConnectorError::poison("JSON document is not an object"))?;

        let items = match object.get(&self.field) {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ConnectorError::poison(format!(
                    "field '{}' is not an array",
                    self.field
                )))
            }
            None => {
                warn!(field = %self.field, "JSON document has no records field");
                return Ok(Decoded::default());
            }
        };

        let records = items
            .iter()
            .map(|item| json_record(item, self.timestamp_field.as_deref()))
            .collect::<ConnectorResult<Vec<_>>>()?;
        Ok(Decoded::new(records))
    }
}

/// Top-level JSON array, one record per element
#[derive(Debug, Default, Clone)]
pub struct JsonArrayCodec {
    timestamp_field: Option<String>,
}

impl JsonArrayCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamp_field(mut self, field: Option<String>) -> Self {
        self.timestamp_field = field;
        self
    }
}

impl Codec for JsonArrayCodec {
    fn name(&self) -> &'static str {
        "json_array"
    }

    fn decode(&self, data: &[u8]) -> ConnectorResult<Decoded> {
        match parse_document(data)? {
            Value::Array(items) => {
                let records = items
                    .iter()
                    .map(|item| json_record(item, self.timestamp_field.as_deref()))
                    .collect::<ConnectorResult<Vec<_>>>()?;
                Ok(Decoded::new(records))
            }
            _ => Err(ConnectorError::poison("JSON document is not an array")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloudtrail_records() {
        let data = br#"{"Records":[{"eventName":"A"},{"eventName":"B"}]}"#;
        let records = JsonRecordsCodec::default().parse(data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_str_lossy(), r#"{"eventName":"A"}"#);
        assert_eq!(records[1].as_str_lossy(), r#"{"eventName":"B"}"#);
    }

    #[test]
    fn test_custom_field_and_timestamp() {
        let data = br#"{"events":[{"id":1,"time":"2024-03-01T12:00:00Z"}]}"#;
        let records = JsonRecordsCodec::new("events")
            .with_timestamp_field(Some("time".into()))
            .parse(data)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].timestamp.is_some());
    }

    #[test]
    fn test_missing_field_is_empty() {
        let data = br#"{"digestStartTime":"2024-03-01T12:00:00Z"}"#;
        assert!(JsonRecordsCodec::default().parse(data).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_documents_are_poison() {
        let codec = JsonRecordsCodec::default();
        for data in [&b"not valid json"[..], b"[1,2]", br#"{"Records":"x"}"#] {
            let err = codec.parse(data).unwrap_err();
            assert!(matches!(err, ConnectorError::PoisonPayload(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_json_array() {
        let records = JsonArrayCodec::new().parse(br#"[{"a":1}, {"a":2}, 3]"#).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].as_str_lossy(), "3");

        assert!(JsonArrayCodec::new().parse(br#"{"a":1}"#).is_err());
    }
}
