//! Delimited text codec
//!
//! Rows are separated by newlines; fields by a single-byte separator with
//! standard CSV quoting. Without column names each row is forwarded as the
//! raw line. With column names (explicit, or taken from a header line) each
//! row becomes a JSON object.

use super::{timestamp_from_str, timestamp_from_value, utf8, Codec, Decoded};
use crate::error::{ConnectorError, ConnectorResult};
use crate::types::Record;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Options for the `csv` codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CsvOptions {
    /// Field separator (single ASCII character)
    #[serde(default = "default_separator")]
    pub separator: char,

    /// Lines to skip at the top of the payload
    #[serde(default)]
    pub skip_first: usize,

    /// Drop lines starting with `#`
    #[serde(default = "default_true")]
    pub skip_comments: bool,

    /// First remaining line holds column names
    #[serde(default)]
    pub header: bool,

    /// Explicit column names
    #[serde(default)]
    pub columns: Option<Vec<String>>,

    /// Column holding the event time (RFC 3339 or epoch)
    #[serde(default)]
    pub timestamp_column: Option<String>,
}

fn default_separator() -> char {
    ','
}

fn default_true() -> bool {
    true
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            skip_first: 0,
            skip_comments: true,
            header: false,
            columns: None,
            timestamp_column: None,
        }
    }
}

/// One data row: the raw line and its split fields
#[derive(Debug)]
pub(crate) struct Row<'a> {
    pub line: &'a str,
    pub fields: Vec<String>,
}

/// Rows of one payload plus the column names in effect
#[derive(Debug)]
pub(crate) struct Rows<'a> {
    pub columns: Option<Vec<String>>,
    pub rows: Vec<Row<'a>>,
    pub malformed: usize,
}

/// Delimited text codec
#[derive(Debug, Clone)]
pub struct CsvCodec {
    options: CsvOptions,
    delimiter: u8,
}

impl CsvCodec {
    pub fn new(options: CsvOptions) -> ConnectorResult<Self> {
        if !options.separator.is_ascii() {
            return Err(ConnectorError::config(format!(
                "csv separator must be a single ASCII character, got {:?}",
                options.separator
            )));
        }
        let delimiter = options.separator as u8;
        Ok(Self { options, delimiter })
    }

    pub fn options(&self) -> &CsvOptions {
        &self.options
    }

    fn split_line(&self, line: &str) -> Result<Vec<String>, ::csv::Error> {
        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(line.as_bytes());
        match reader.records().next() {
            Some(record) => Ok(record?.iter().map(str::to_string).collect()),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn rows<'a>(&self, data: &'a [u8]) -> ConnectorResult<Rows<'a>> {
        let text = utf8(data)?;
        let mut columns = self.options.columns.clone();
        let mut expect_header = self.options.header && columns.is_none();
        let mut rows = Vec::new();
        let mut malformed = 0;

        let lines = text
            .lines()
            .skip(self.options.skip_first)
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .filter(|line| !(self.options.skip_comments && line.trim_start().starts_with('#')));

        for (index, line) in lines.enumerate() {
            let fields = match self.split_line(line) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(line = index, error = %e, "Dropping malformed row");
                    malformed += 1;
                    continue;
                }
            };
            if expect_header {
                columns = Some(fields);
                expect_header = false;
                continue;
            }
            rows.push(Row { line, fields });
        }

        Ok(Rows {
            columns,
            rows,
            malformed,
        })
    }

    pub(crate) fn row_record(&self, columns: Option<&[String]>, row: &Row<'_>) -> ConnectorResult<Record> {
        let Some(columns) = columns else {
            return Ok(Record::new(Bytes::copy_from_slice(row.line.as_bytes())));
        };

        let object: serde_json::Map<String, serde_json::Value> = columns
            .iter()
            .zip(row.fields.iter())
            .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
            .collect();

        let timestamp = self
            .options
            .timestamp_column
            .as_ref()
            .and_then(|column| columns.iter().position(|c| c == column))
            .and_then(|idx| row.fields.get(idx))
            .and_then(|value| parse_field_timestamp(value));

        let record = Record::new(serde_json::to_vec(&object)?);
        Ok(match timestamp {
            Some(ts) => record.with_timestamp(ts),
            None => record,
        })
    }
}

fn parse_field_timestamp(value: &str) -> Option<DateTime<Utc>> {
    timestamp_from_str(value).or_else(|| {
        let number: serde_json::Number = value.trim().parse().ok()?;
        timestamp_from_value(&serde_json::Value::Number(number))
    })
}

impl Codec for CsvCodec {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn decode(&self, data: &[u8]) -> ConnectorResult<Decoded> {
        let rows = self.rows(data)?;
        let records = rows
            .rows
            .iter()
            .map(|row| self.row_record(rows.columns.as_deref(), row))
            .collect::<ConnectorResult<Vec<_>>>()?;
        Ok(Decoded {
            records,
            discarded: rows.malformed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_lines_after_skip_and_comments() {
        let codec = CsvCodec::new(CsvOptions {
            skip_first: 1,
            ..Default::default()
        })
        .unwrap();
        let data = b"banner line\n# comment\na,b,c\n\nd,e,f\n";
        let records = codec.parse(data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_str_lossy(), "a,b,c");
        assert_eq!(records[1].as_str_lossy(), "d,e,f");
    }

    #[test]
    fn test_comments_kept_when_disabled() {
        let codec = CsvCodec::new(CsvOptions {
            skip_comments: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(codec.parse(b"#a,b\nc,d\n").unwrap().len(), 2);
    }

    #[test]
    fn test_header_to_objects() {
        let codec = CsvCodec::new(CsvOptions {
            separator: '\t',
            header: true,
            timestamp_column: Some("time".into()),
            ..Default::default()
        })
        .unwrap();
        let data = b"time\tuser\taction\n2024-03-01T12:00:00Z\talice\t\"log in\"\n";
        let records = codec.parse(data).unwrap();
        assert_eq!(records.len(), 1);

        let value: serde_json::Value = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(value["user"], "alice");
        assert_eq!(value["action"], "log in");
        assert!(records[0].timestamp.is_some());
    }

    #[test]
    fn test_explicit_columns_epoch_timestamp() {
        let codec = CsvCodec::new(CsvOptions {
            columns: Some(vec!["ts".into(), "msg".into()]),
            timestamp_column: Some("ts".into()),
            ..Default::default()
        })
        .unwrap();
        let records = codec.parse(b"1709294400,hello\n").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(value["msg"], "hello");
        assert_eq!(records[0].timestamp.unwrap().timestamp(), 1709294400);
    }

    #[test]
    fn test_non_ascii_separator_rejected() {
        let options = CsvOptions {
            separator: '§',
            ..Default::default()
        };
        assert!(matches!(
            CsvCodec::new(options).unwrap_err(),
            ConnectorError::Config(_)
        ));
    }
}
