//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use datafusion::arrow::array::{Array, ArrayRef, StringArray};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use pivot_fusion::catalog::{AttachOptions, PivotCatalog};
use pivot_fusion::provider::PivotTableProvider;
use pivot_fusion::table::PivotTableEntry;
use tempfile::TempDir;

/// Opens a fresh store in a temp dir and wraps it in a catalog.
pub fn attach_temp() -> Result<(TempDir, Arc<PivotCatalog>)> {
    let dir = TempDir::new()?;
    let options = AttachOptions {
        create_if_missing: true,
        ..AttachOptions::default()
    };
    let catalog = PivotCatalog::open(&dir.path().join("db"), &options)?;
    Ok((dir, catalog))
}

/// Provider wired to the catalog's table map and transaction manager.
pub fn provider_for(catalog: &Arc<PivotCatalog>, table: &str) -> PivotTableProvider {
    let schema = catalog.main_schema();
    let entry = schema.table_entry(table).expect("table exists");
    PivotTableProvider::new(
        entry,
        Arc::clone(schema.tables()),
        Arc::clone(catalog.transactions()),
    )
}

pub fn table_entry(catalog: &Arc<PivotCatalog>, table: &str) -> Arc<PivotTableEntry> {
    catalog
        .main_schema()
        .table_entry(table)
        .expect("table exists")
}

pub fn string_vec(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// All-VARCHAR schema over the given column names.
pub fn varchar_schema(columns: &[&str]) -> SchemaRef {
    Arc::new(Schema::new(
        columns
            .iter()
            .map(|name| Field::new(*name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ))
}

/// Builds a UTF-8 chunk; `None` cells become NULL.
pub fn string_chunk(schema: SchemaRef, rows: &[Vec<Option<&str>>]) -> RecordBatch {
    let columns: Vec<ArrayRef> = (0..schema.fields().len())
        .map(|col| {
            let values: Vec<Option<&str>> = rows.iter().map(|row| row[col]).collect();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect();
    RecordBatch::try_new(schema, columns).expect("chunk assembly")
}

/// Renders every cell as `Option<String>` for order-insensitive comparisons.
pub fn batch_rows(batch: &RecordBatch) -> Vec<Vec<Option<String>>> {
    let columns: Vec<StringArray> = batch
        .columns()
        .iter()
        .map(|array| {
            let utf8 = cast(array, &DataType::Utf8).expect("render as text");
            utf8.as_any()
                .downcast_ref::<StringArray>()
                .expect("string column")
                .clone()
        })
        .collect();

    (0..batch.num_rows())
        .map(|row| {
            columns
                .iter()
                .map(|column| {
                    if column.is_null(row) {
                        None
                    } else {
                        Some(column.value(row).to_string())
                    }
                })
                .collect()
        })
        .collect()
}

/// Drains a chunked scan into row tuples.
pub fn collect_rows(
    chunks: impl Iterator<Item = pivot_fusion::PivotResult<RecordBatch>>,
) -> Vec<Vec<Option<String>>> {
    let mut rows = Vec::new();
    for chunk in chunks {
        rows.extend(batch_rows(&chunk.expect("scan chunk")));
    }
    rows
}

pub fn row(cells: &[Option<&str>]) -> Vec<Option<String>> {
    cells.iter().map(|cell| cell.map(str::to_string)).collect()
}
