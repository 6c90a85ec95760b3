//! Pluggable payload codecs
//!
//! A codec turns the (already decompressed) bytes of one object or API
//! response into an ordered list of [`Record`]s. Codecs are pure: no I/O,
//! no shared state. Which codec applies is chosen by configuration through
//! [`CodecConfig`].
//!
//! | Codec | Behavior |
//! |---|---|
//! | `jsonl` | one record per non-empty line |
//! | `json_records` | object, one record per element of `.Records[]` (field configurable) |
//! | `json_array` | top-level array, one record per element |
//! | `csv` | separator-split rows after `skip_first` lines, optional `#` comments, optional header |
//! | `flowlog` | `csv` plus dropping rows whose addresses are all private |
//! | `line_delimited` | raw lines, verbatim |
//! | `parquet` | one JSON object per row (feature `parquet`) |

pub mod compression;
pub mod csv;
pub mod flowlog;
pub mod json;
pub mod jsonl;
#[cfg(feature = "parquet")]
pub mod parquet;

pub use self::csv::{CsvCodec, CsvOptions};
pub use compression::{decompress, is_gzip, TransportHints};
pub use flowlog::{FlowlogCodec, FlowlogOptions};
pub use json::{JsonArrayCodec, JsonRecordsCodec};
pub use jsonl::{JsonLinesCodec, LineDelimitedCodec};

use crate::error::{ConnectorError, ConnectorResult};
use crate::types::Record;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Output of a codec run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    pub records: Vec<Record>,
    /// Rows the codec deliberately filtered out
    pub discarded: usize,
}

impl Decoded {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            discarded: 0,
        }
    }
}

/// `bytes -> records` transform
pub trait Codec: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Split `data` into records, reporting rows that were filtered out.
    ///
    /// An error means the payload as a whole is unparseable.
    fn decode(&self, data: &[u8]) -> ConnectorResult<Decoded>;

    /// Split `data` into records
    fn parse(&self, data: &[u8]) -> ConnectorResult<Vec<Record>> {
        Ok(self.decode(data)?.records)
    }
}

/// Codec selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodecConfig {
    Jsonl {
        #[serde(default)]
        timestamp_field: Option<String>,
    },
    JsonRecords {
        #[serde(default = "default_records_field")]
        field: String,
        #[serde(default)]
        timestamp_field: Option<String>,
    },
    JsonArray {
        #[serde(default)]
        timestamp_field: Option<String>,
    },
    Csv(CsvOptions),
    Flowlog(FlowlogOptions),
    LineDelimited {
        #[serde(default)]
        skip_comments: bool,
    },
    Parquet,
}

fn default_records_field() -> String {
    "Records".to_string()
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::Jsonl {
            timestamp_field: None,
        }
    }
}

impl CodecConfig {
    pub fn build(&self) -> ConnectorResult<Arc<dyn Codec>> {
        Ok(match self {
            Self::Jsonl { timestamp_field } => {
                Arc::new(JsonLinesCodec::new().with_timestamp_field(timestamp_field.clone()))
            }
            Self::JsonRecords {
                field,
                timestamp_field,
            } => Arc::new(
                JsonRecordsCodec::new(field.clone()).with_timestamp_field(timestamp_field.clone()),
            ),
            Self::JsonArray { timestamp_field } => {
                Arc::new(JsonArrayCodec::new().with_timestamp_field(timestamp_field.clone()))
            }
            Self::Csv(options) => Arc::new(CsvCodec::new(options.clone())?),
            Self::Flowlog(options) => Arc::new(FlowlogCodec::new(options.clone())?),
            Self::LineDelimited { skip_comments } => {
                Arc::new(LineDelimitedCodec::new().with_skip_comments(*skip_comments))
            }
            #[cfg(feature = "parquet")]
            Self::Parquet => Arc::new(self::parquet::ParquetCodec),
            #[cfg(not(feature = "parquet"))]
            Self::Parquet => {
                return Err(ConnectorError::config(
                    "parquet codec requires the 'parquet' feature",
                ))
            }
        })
    }
}

/// Interpret a JSON value as an event time.
///
/// Strings are RFC 3339; numbers are Unix epoch seconds, or milliseconds
/// when larger than 10^11.
pub fn timestamp_from_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => timestamp_from_str(s),
        serde_json::Value::Number(n) => {
            let raw = n.as_f64()?;
            if raw.abs() > 1e11 {
                DateTime::from_timestamp_millis(raw as i64)
            } else {
                DateTime::from_timestamp_millis((raw * 1000.0) as i64)
            }
        }
        _ => None,
    }
}

pub(crate) fn timestamp_from_str(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Record for a JSON value, with the timestamp taken from `timestamp_field`
pub(crate) fn json_record(
    value: &serde_json::Value,
    timestamp_field: Option<&str>,
) -> ConnectorResult<Record> {
    let record = Record::new(serde_json::to_vec(value)?);
    Ok(match timestamp_field
        .and_then(|field| value.get(field))
        .and_then(timestamp_from_value)
    {
        Some(ts) => record.with_timestamp(ts),
        None => record,
    })
}

pub(crate) fn utf8(data: &[u8]) -> ConnectorResult<&str> {
    std::str::from_utf8(data)
        .map_err(|e| ConnectorError::poison(format!("payload is not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_codec_config_yaml() {
        let config: CodecConfig = serde_yaml::from_str("type: json_records").unwrap();
        assert_eq!(
            config,
            CodecConfig::JsonRecords {
                field: "Records".into(),
                timestamp_field: None
            }
        );

        let config: CodecConfig =
            serde_yaml::from_str("type: csv\nseparator: \"\\t\"\nskip_first: 2").unwrap();
        match config {
            CodecConfig::Csv(options) => {
                assert_eq!(options.separator, '\t');
                assert_eq!(options.skip_first, 2);
            }
            other => panic!("unexpected codec {other:?}"),
        }
    }

    #[test]
    fn test_build_each_codec() {
        let configs = [
            CodecConfig::default(),
            CodecConfig::JsonArray {
                timestamp_field: None,
            },
            CodecConfig::Csv(CsvOptions::default()),
            CodecConfig::Flowlog(FlowlogOptions::default()),
            CodecConfig::LineDelimited {
                skip_comments: true,
            },
        ];
        for config in configs {
            let codec = config.build().unwrap();
            assert!(!codec.name().is_empty());
        }
    }

    #[cfg(not(feature = "parquet"))]
    #[test]
    fn test_parquet_requires_feature() {
        assert!(CodecConfig::Parquet.build().is_err());
    }

    #[test]
    fn test_timestamp_from_value() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            timestamp_from_value(&json!("2024-03-01T12:00:00Z")),
            Some(expected)
        );
        assert_eq!(
            timestamp_from_value(&json!("2024-03-01T13:00:00+01:00")),
            Some(expected)
        );
        assert_eq!(timestamp_from_value(&json!(1709294400)), Some(expected));
        assert_eq!(timestamp_from_value(&json!(1709294400000i64)), Some(expected));
        assert_eq!(timestamp_from_value(&json!("yesterday")), None);
        assert_eq!(timestamp_from_value(&json!(null)), None);
    }
}
