//! The expected result schema for a remote query

use arrow_array::ArrayRef;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use std::sync::Arc;

/// One expected output column.
///
/// A column marked constant carries a length-1 reference array with the
/// expected value; the adapter rewrites every received block so the column
/// really is constant (see [`adapt_batch`](crate::adapt_batch)).
#[derive(Debug, Clone)]
pub struct HeaderColumn {
    pub name: String,
    pub data_type: DataType,
    pub const_value: Option<ArrayRef>,
}

impl HeaderColumn {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            const_value: None,
        }
    }

    /// A constant column; `value` must hold exactly one row.
    pub fn constant(name: impl Into<String>, value: ArrayRef) -> Self {
        debug_assert_eq!(value.len(), 1, "constant reference value must have one row");
        Self {
            name: name.into(),
            data_type: value.data_type().clone(),
            const_value: Some(value),
        }
    }
}

/// Ordered column descriptors every returned block must match.
///
/// An empty header turns the adapter off; blocks pass through with whatever
/// schema the replica produced.
#[derive(Debug, Clone, Default)]
pub struct Header {
    columns: Vec<HeaderColumn>,
}

impl Header {
    pub fn new(columns: Vec<HeaderColumn>) -> Self {
        Self { columns }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            columns: schema
                .fields()
                .iter()
                .map(|field| HeaderColumn::new(field.name(), field.data_type().clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[HeaderColumn] {
        &self.columns
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|col| Field::new(&col.name, col.data_type.clone(), true))
                .collect::<Vec<_>>(),
        ))
    }
}
