//! Line-oriented codecs

use super::{utf8, Codec, Decoded};
use crate::error::ConnectorResult;
use crate::types::Record;
use bytes::Bytes;

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
}

/// One record per non-empty line.
///
/// Lines are forwarded verbatim. When a timestamp field is configured each
/// line is parsed to extract it; lines that are not JSON are still forwarded,
/// just without a timestamp.
#[derive(Debug, Default, Clone)]
pub struct JsonLinesCodec {
    timestamp_field: Option<String>,
}

impl JsonLinesCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamp_field(mut self, field: Option<String>) -> Self {
        self.timestamp_field = field;
        self
    }
}

impl Codec for JsonLinesCodec {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn decode(&self, data: &[u8]) -> ConnectorResult<Decoded> {
        let text = utf8(data)?;
        let records = non_empty_lines(text)
            .map(|line| {
                let record = Record::new(Bytes::copy_from_slice(line.as_bytes()));
                let timestamp = self.timestamp_field.as_deref().and_then(|field| {
                    let value: serde_json::Value = serde_json::from_str(line).ok()?;
                    super::timestamp_from_value(value.get(field)?)
                });
                match timestamp {
                    Some(ts) => record.with_timestamp(ts),
                    None => record,
                }
            })
            .collect();
        Ok(Decoded::new(records))
    }
}

/// Raw lines, optionally skipping `#` comments
#[derive(Debug, Default, Clone)]
pub struct LineDelimitedCodec {
    skip_comments: bool,
}

impl LineDelimitedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip_comments(mut self, skip: bool) -> Self {
        self.skip_comments = skip;
        self
    }
}

impl Codec for LineDelimitedCodec {
    fn name(&self) -> &'static str {
        "line_delimited"
    }

    fn decode(&self, data: &[u8]) -> ConnectorResult<Decoded> {
        let text = utf8(data)?;
        let records = non_empty_lines(text)
            .filter(|line| !(self.skip_comments && line.trim_start().starts_with('#')))
            .map(|line| Record::new(Bytes::copy_from_slice(line.as_bytes())))
            .collect();
        Ok(Decoded::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectorError;

    #[test]
    fn test_jsonl_drops_blank_lines() {
        let data = b"{\"a\":1}\n\n  \r\n{\"a\":2}\r\n";
        let records = JsonLinesCodec::new().parse(data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload.as_ref(), b"{\"a\":1}");
        assert_eq!(records[1].payload.as_ref(), b"{\"a\":2}");
    }

    #[test]
    fn test_jsonl_timestamp_extraction() {
        let data = b"{\"ts\":\"2024-03-01T12:00:00Z\"}\nplain text\n";
        let records = JsonLinesCodec::new()
            .with_timestamp_field(Some("ts".into()))
            .parse(data)
            .unwrap();
        assert!(records[0].timestamp.is_some());
        assert!(records[1].timestamp.is_none());
    }

    #[test]
    fn test_jsonl_rejects_binary() {
        let err = JsonLinesCodec::new().parse(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, ConnectorError::PoisonPayload(_)));
    }

    #[test]
    fn test_line_delimited_comments() {
        let data = b"#Version: 1.0\n#Fields: date time\n2024-03-01 12:00:00 GET /\n";
        let all = LineDelimitedCodec::new().parse(data).unwrap();
        assert_eq!(all.len(), 3);

        let records = LineDelimitedCodec::new()
            .with_skip_comments(true)
            .parse(data)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].as_str_lossy(), "2024-03-01 12:00:00 GET /");
    }
}
