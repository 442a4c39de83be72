use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, StorageError};
use crate::value::Row;

/// Bytes in the big-endian row-count header.
const HEADER_LEN: usize = 2;

/// Encodes a row batch as a 2-byte big-endian row count followed by the
/// canonical JSON serialization of the row list.
pub fn encode_rows_block(rows: &[Row]) -> Result<Vec<u8>> {
    if rows.len() > u16::MAX as usize {
        return Err(StorageError::Corruption(format!(
            "row batch of {} rows exceeds the count header",
            rows.len()
        )));
    }
    let payload = serde_json::to_vec(rows)
        .map_err(|e| StorageError::Corruption(format!("row encode: {}", e)))?;
    let mut data = vec![0u8; HEADER_LEN];
    BigEndian::write_u16(&mut data, rows.len() as u16);
    data.extend_from_slice(&payload);
    Ok(data)
}

/// Decodes a row batch, tolerating trailing zero padding after the payload.
pub fn decode_rows_block(data: &[u8]) -> Result<Vec<Row>> {
    if data.len() < HEADER_LEN {
        return Ok(Vec::new());
    }
    let row_count = BigEndian::read_u16(&data[..HEADER_LEN]) as usize;
    if row_count == 0 {
        return Ok(Vec::new());
    }
    let payload = strip_padding(&data[HEADER_LEN..]);
    let rows: Vec<Row> = serde_json::from_slice(payload)
        .map_err(|e| StorageError::Corruption(format!("row decode: {}", e)))?;
    if rows.len() != row_count {
        return Err(StorageError::Corruption(format!(
            "row block header says {} rows, payload holds {}",
            row_count,
            rows.len()
        )));
    }
    Ok(rows)
}

fn strip_padding(payload: &[u8]) -> &[u8] {
    let end = payload.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &payload[..end]
}
