//! Reshaping received blocks to the declared header
//!
//! Replicas may ship columns in a different order, with slightly different
//! types, or with constants materialized as full columns. Every block is
//! adapted before it reaches the caller so downstream operators see one
//! stable schema.

use crate::header::Header;
use arrow::compute::{cast, take};
use arrow_array::{ArrayRef, RecordBatch, UInt32Array};
use arrow_schema::{Field, Schema};
use std::sync::Arc;
use tundra_common::{Result, TundraError};

/// Repeat a single-row array `rows` times.
fn broadcast(value: &ArrayRef, rows: usize) -> Result<ArrayRef> {
    let indices = UInt32Array::from(vec![0u32; rows]);
    Ok(take(value.as_ref(), &indices, None)?)
}

/// Reshape `batch` to match `header`: header order, header types, constant
/// columns re-derived. Rows are never reordered, filtered, or deduplicated.
pub fn adapt_batch(batch: &RecordBatch, header: &Header) -> Result<RecordBatch> {
    if header.is_empty() {
        return Ok(batch.clone());
    }

    let rows = batch.num_rows();
    let mut columns = Vec::with_capacity(header.columns().len());
    for col in header.columns() {
        let array = match &col.const_value {
            Some(reference) => {
                // The replica may know a different value for constants like
                // version() or now(); when it shipped the column, its first
                // value wins over the reference one.
                if rows > 0 && batch.column_by_name(&col.name).is_some() {
                    let received = batch.column_by_name(&col.name).unwrap().slice(0, 1);
                    let received = cast(received.as_ref(), &col.data_type)?;
                    broadcast(&received, rows)?
                } else {
                    broadcast(reference, rows)?
                }
            }
            None => {
                let source = batch.column_by_name(&col.name).ok_or_else(|| {
                    TundraError::Logical(format!(
                        "column '{}' is missing from the received block",
                        col.name
                    ))
                })?;
                cast(source.as_ref(), &col.data_type)?
            }
        };
        columns.push(array);
    }

    let schema = Arc::new(Schema::new_with_metadata(
        header
            .columns()
            .iter()
            .map(|col| Field::new(&col.name, col.data_type.clone(), true))
            .collect::<Vec<_>>(),
        batch.schema().metadata().clone(),
    ));
    Ok(RecordBatch::try_new(schema, columns)?)
}
