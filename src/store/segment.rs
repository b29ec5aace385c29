//! Arrow IPC segment codec.
//!
//! Each physical write becomes one segment: a single-batch Arrow IPC stream
//! holding the fixed record schema. Dimension columns can be read alone
//! through IPC projection, which is what `distinct_values` relies on.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::error::{EngineError, Result};
use crate::record::{Dimension, Record};

const TRANSACTION_ID: usize = 0;
const TIMESTAMP_MS: usize = 1;
const DATE: usize = 2;
const AMOUNT: usize = 3;
const PAYMENT_MODE: usize = 4;
const MERCHANT_ID: usize = 5;
const GATEWAY: usize = 6;
const BANK: usize = 7;
const CARD_TYPE: usize = 8;
const STATUS: usize = 9;
const IS_SUCCESS: usize = 10;
const IS_FAILED: usize = 11;
const IS_USER_DROPPED: usize = 12;
const COLUMN_COUNT: usize = 13;

/// Arrow schema of a stored segment.
pub fn record_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("transaction_id", DataType::Utf8, true),
        Field::new("timestamp_ms", DataType::Int64, false),
        Field::new("date", DataType::Utf8, false),
        Field::new("amount", DataType::Float64, false),
        Field::new("payment_mode", DataType::Utf8, false),
        Field::new("merchant_id", DataType::Utf8, false),
        Field::new("gateway", DataType::Utf8, false),
        Field::new("bank", DataType::Utf8, false),
        Field::new("card_type", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("is_success", DataType::Boolean, false),
        Field::new("is_failed", DataType::Boolean, false),
        Field::new("is_user_dropped", DataType::Boolean, false),
    ]))
}

/// Column index of a dimension in the segment schema.
pub fn dimension_column(dimension: Dimension) -> usize {
    match dimension {
        Dimension::PaymentMode => PAYMENT_MODE,
        Dimension::MerchantId => MERCHANT_ID,
        Dimension::Gateway => GATEWAY,
        Dimension::Bank => BANK,
        Dimension::CardType => CARD_TYPE,
    }
}

fn utf8_column(records: &[Record], value: impl Fn(&Record) -> &str) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(records.iter().map(value)))
}

/// Convert records into one Arrow batch.
pub fn to_batch(records: &[Record]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.transaction_id.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            records.iter().map(|r| r.timestamp_ms).collect::<Vec<_>>(),
        )),
        utf8_column(records, |r| r.date.as_str()),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.amount).collect::<Vec<_>>(),
        )),
        utf8_column(records, |r| r.payment_mode.as_str()),
        utf8_column(records, |r| r.merchant_id.as_str()),
        utf8_column(records, |r| r.gateway.as_str()),
        utf8_column(records, |r| r.bank.as_str()),
        utf8_column(records, |r| r.card_type.as_str()),
        utf8_column(records, |r| r.status.as_str()),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.is_success).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.is_failed).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.is_user_dropped).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(record_schema(), columns)?)
}

fn typed<T: Array + 'static>(batch: &RecordBatch, idx: usize) -> Result<&T> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| EngineError::Arrow {
            message: format!(
                "segment column {} has unexpected type {}",
                batch.schema().field(idx).name(),
                batch.column(idx).data_type()
            ),
        })
}

/// Convert one Arrow batch back into records.
pub fn from_batch(batch: &RecordBatch) -> Result<Vec<Record>> {
    if batch.num_columns() != COLUMN_COUNT {
        return Err(EngineError::Arrow {
            message: format!(
                "segment has {} columns, expected {COLUMN_COUNT}",
                batch.num_columns()
            ),
        });
    }

    let ids = typed::<StringArray>(batch, TRANSACTION_ID)?;
    let timestamps = typed::<Int64Array>(batch, TIMESTAMP_MS)?;
    let dates = typed::<StringArray>(batch, DATE)?;
    let amounts = typed::<Float64Array>(batch, AMOUNT)?;
    let modes = typed::<StringArray>(batch, PAYMENT_MODE)?;
    let merchants = typed::<StringArray>(batch, MERCHANT_ID)?;
    let gateways = typed::<StringArray>(batch, GATEWAY)?;
    let banks = typed::<StringArray>(batch, BANK)?;
    let cards = typed::<StringArray>(batch, CARD_TYPE)?;
    let statuses = typed::<StringArray>(batch, STATUS)?;
    let success = typed::<BooleanArray>(batch, IS_SUCCESS)?;
    let failed = typed::<BooleanArray>(batch, IS_FAILED)?;
    let dropped = typed::<BooleanArray>(batch, IS_USER_DROPPED)?;

    Ok((0..batch.num_rows())
        .map(|i| Record {
            transaction_id: (!ids.is_null(i)).then(|| ids.value(i).to_string()),
            timestamp_ms: timestamps.value(i),
            date: dates.value(i).to_string(),
            amount: amounts.value(i),
            payment_mode: modes.value(i).to_string(),
            merchant_id: merchants.value(i).to_string(),
            gateway: gateways.value(i).to_string(),
            bank: banks.value(i).to_string(),
            card_type: cards.value(i).to_string(),
            status: statuses.value(i).to_string(),
            is_success: success.value(i),
            is_failed: failed.value(i),
            is_user_dropped: dropped.value(i),
        })
        .collect())
}

/// Encode records as a single-batch IPC stream.
pub fn encode(records: &[Record]) -> Result<Vec<u8>> {
    let batch = to_batch(records)?;
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &batch.schema())?;
        writer.write(&batch)?;
        writer.finish()?;
    }
    Ok(buf)
}

/// Decode every record of an IPC stream.
pub fn decode<R: Read>(reader: R) -> Result<Vec<Record>> {
    let reader = StreamReader::try_new(reader, None)?;
    let mut records = Vec::new();
    for batch in reader {
        records.extend(from_batch(&batch?)?);
    }
    Ok(records)
}

/// Read a whole segment file.
pub fn read_segment(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).map_err(|e| EngineError::from_storage_io(e, path))?;
    decode(BufReader::new(file))
}

/// Read the distinct, trimmed, non-empty values of one dimension column.
///
/// Only the projected column is decoded.
pub fn read_dimension(path: &Path, dimension: Dimension) -> Result<BTreeSet<String>> {
    let file = File::open(path).map_err(|e| EngineError::from_storage_io(e, path))?;
    let reader = StreamReader::try_new(BufReader::new(file), Some(vec![dimension_column(dimension)]))?;

    let mut values = BTreeSet::new();
    for batch in reader {
        let batch = batch?;
        let column = typed::<StringArray>(&batch, 0)?;
        for value in column.iter().flatten() {
            let value = value.trim();
            if !value.is_empty() && !values.contains(value) {
                values.insert(value.to_string());
            }
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::dataset;

    #[test]
    fn test_segment_preserves_records_and_order() {
        let mut records = dataset(50);
        records[3].transaction_id = None;
        let bytes = encode(&records).unwrap();
        let decoded = decode(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_schema_matches_batch() {
        let batch = to_batch(&dataset(3)).unwrap();
        assert_eq!(batch.num_columns(), COLUMN_COUNT);
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.schema(), record_schema());
    }

    #[test]
    fn test_read_dimension_projection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.arrow");
        let mut records = dataset(20);
        records[0].bank = "  ICICI ".to_string();
        records[1].bank = "   ".to_string();
        std::fs::write(&path, encode(&records).unwrap()).unwrap();

        let banks = read_dimension(&path, Dimension::Bank).unwrap();
        assert_eq!(
            banks.into_iter().collect::<Vec<_>>(),
            vec!["HDFC".to_string(), "ICICI".to_string()]
        );

        let gateways = read_dimension(&path, Dimension::Gateway).unwrap();
        assert!(gateways.contains("N/A"));
        assert!(!gateways.contains(""));
    }

    #[test]
    fn test_rejects_foreign_batch() {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1_i64]))]).unwrap();
        assert!(from_batch(&batch).is_err());
    }
}
