//! Transparent gzip handling for fetched objects
//!
//! An object is gunzipped when its first two bytes are `1F 8B`, when it was
//! served with `Content-Encoding: gzip`, or when its content type is
//! `application/gzip` / `application/x-gzip`. Anything else passes through
//! untouched: detection is strictly additive.

use crate::error::{ConnectorError, ConnectorResult};
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use std::io::Read;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Transport metadata that accompanies a blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHints {
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
}

impl TransportHints {
    pub fn gzip_encoded() -> Self {
        Self {
            content_encoding: Some("gzip".to_string()),
            content_type: None,
        }
    }

    fn indicates_gzip(&self) -> bool {
        let encoding = self
            .content_encoding
            .as_deref()
            .is_some_and(|enc| enc.trim().eq_ignore_ascii_case("gzip"));

        let content_type = self.content_type.as_deref().is_some_and(|ct| {
            let mime = ct.split(';').next().unwrap_or_default().trim();
            mime.eq_ignore_ascii_case("application/gzip")
                || mime.eq_ignore_ascii_case("application/x-gzip")
        });

        encoding || content_type
    }
}

/// Whether `data` must be gunzipped before parsing
pub fn is_gzip(data: &[u8], hints: &TransportHints) -> bool {
    data.starts_with(&GZIP_MAGIC) || hints.indicates_gzip()
}

/// Gunzip `data` if it is gzipped, otherwise return it unchanged.
///
/// Concatenated gzip members are decoded as one stream. Output larger than
/// `max_bytes` is rejected. Errors are [`ConnectorError::PoisonPayload`]: a
/// corrupt or oversized archive will not get better on redelivery.
pub fn decompress(data: Bytes, hints: &TransportHints, max_bytes: usize) -> ConnectorResult<Bytes> {
    if !is_gzip(&data, hints) {
        return Ok(data);
    }

    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    let mut decoder = MultiGzDecoder::new(data.as_ref()).take(limit.saturating_add(1));
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(max_bytes));
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ConnectorError::poison(format!("gzip decompression failed: {}", e)))?;
    if out.len() > max_bytes {
        return Err(ConnectorError::poison(format!(
            "decompressed object exceeds {} bytes",
            max_bytes
        )));
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const LIMIT: usize = 1024 * 1024;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn test_magic_bytes_detected() {
        let data = gzip(b"{\"a\":1}\n");
        assert!(is_gzip(&data, &TransportHints::default()));
        assert_eq!(
            decompress(data, &TransportHints::default(), LIMIT).unwrap(),
            Bytes::from_static(b"{\"a\":1}\n")
        );
    }

    #[test]
    fn test_plain_passthrough() {
        let data = Bytes::from_static(b"PAR1....");
        assert!(!is_gzip(&data, &TransportHints::default()));
        assert_eq!(decompress(data.clone(), &TransportHints::default(), LIMIT).unwrap(), data);
    }

    #[test]
    fn test_header_hints() {
        let plain = b"line";
        assert!(is_gzip(plain, &TransportHints::gzip_encoded()));
        assert!(is_gzip(
            plain,
            &TransportHints {
                content_encoding: None,
                content_type: Some("application/x-gzip".into()),
            }
        ));
        assert!(is_gzip(
            plain,
            &TransportHints {
                content_encoding: None,
                content_type: Some("Application/GZIP; charset=binary".into()),
            }
        ));
        assert!(!is_gzip(
            plain,
            &TransportHints {
                content_encoding: Some("identity".into()),
                content_type: Some("application/json".into()),
            }
        ));
    }

    #[test]
    fn test_hint_on_corrupt_data_is_poison() {
        let err = decompress(Bytes::from_static(b"not gzip"), &TransportHints::gzip_encoded(), LIMIT)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::PoisonPayload(_)));
    }

    #[test]
    fn test_multi_member_stream() {
        let mut data = gzip(b"first\n").to_vec();
        data.extend_from_slice(&gzip(b"second\n"));
        let out = decompress(Bytes::from(data), &TransportHints::default(), LIMIT).unwrap();
        assert_eq!(out, Bytes::from_static(b"first\nsecond\n"));
    }

    #[test]
    fn test_output_over_limit_is_poison() {
        let data = gzip(&vec![b'a'; 10_000]);
        let err = decompress(data.clone(), &TransportHints::default(), 9_999).unwrap_err();
        assert!(matches!(err, ConnectorError::PoisonPayload(_)));

        let out = decompress(data, &TransportHints::default(), 10_000).unwrap();
        assert_eq!(out.len(), 10_000);
    }
}
