//! Parquet codec: one JSON object per row

use super::{Codec, Decoded};
use crate::error::{ConnectorError, ConnectorResult};
use crate::types::Record;
use bytes::Bytes;
use parquet::file::reader::{FileReader, SerializedFileReader};

#[derive(Debug, Default, Clone, Copy)]
pub struct ParquetCodec;

impl Codec for ParquetCodec {
    fn name(&self) -> &'static str {
        "parquet"
    }

    fn decode(&self, data: &[u8]) -> ConnectorResult<Decoded> {
        let reader = SerializedFileReader::new(Bytes::copy_from_slice(data))
            .map_err(|e| ConnectorError::poison(format!("invalid parquet file: {}", e)))?;
        let rows = reader
            .get_row_iter(None)
            .map_err(|e| ConnectorError::poison(format!("unreadable parquet rows: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|e| ConnectorError::poison(format!("bad parquet row: {}", e)))?;
            records.push(Record::new(serde_json::to_vec(&row.to_json_value())?));
        }
        Ok(Decoded::new(records))
    }
}
