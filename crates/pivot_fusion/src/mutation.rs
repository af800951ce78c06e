//! Chunk-oriented write operators: insert, update, delete.
//!
//! Each operator turns one host chunk into a single buffered store batch,
//! commits it after the chunk, and announces every written key to the
//! dirty-table tracker. The returned count is the number of affected input
//! rows, not the number of underlying store operations.

use std::sync::Arc;

use datafusion::arrow::array::{Array, ArrayRef, StringArray};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::record_batch::RecordBatch;

use crate::error::{PivotError, PivotResult};
use crate::table::{PivotTableEntry, TableKind};
use crate::transaction::{PivotTransactionManager, TableMap};
use crate::values::encode_json_value;

/// Renders a column as strings via the host's default representation,
/// preserving nulls.
fn stringify_column(array: &ArrayRef) -> PivotResult<StringArray> {
    let utf8 = if array.data_type() == &DataType::Utf8 {
        Arc::clone(array)
    } else {
        cast(array, &DataType::Utf8).map_err(|err| {
            PivotError::invalid_input(format!("cannot render column as text: {err}"))
        })?
    };
    utf8.as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| PivotError::invalid_input("expected a UTF-8 column"))
}

/// Maps row-id chunk columns onto capture order.
///
/// The host supplies identity columns in declared-column order; key building
/// needs them in pattern order.
fn capture_order_map(entry: &PivotTableEntry) -> PivotResult<Vec<usize>> {
    let TableKind::Pivot {
        parser,
        identity_columns,
        ..
    } = entry.kind()
    else {
        return Err(PivotError::invalid_input("identity mapping on a raw table"));
    };
    parser
        .pattern()
        .capture_names()
        .iter()
        .map(|capture| {
            identity_columns
                .iter()
                .position(|column| column == capture)
                .ok_or_else(|| {
                    PivotError::invalid_input(format!(
                        "capture '{capture}' has no identity column"
                    ))
                })
        })
        .collect()
}

/// Inserts one chunk of rows laid out as the table's declared columns.
pub fn insert_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
) -> PivotResult<u64> {
    match entry.kind() {
        TableKind::Pivot { .. } => insert_pivot_chunk(entry, tables, transactions, chunk),
        TableKind::Raw => insert_raw_chunk(entry, tables, transactions, chunk),
    }
}

fn insert_pivot_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
) -> PivotResult<u64> {
    let TableKind::Pivot {
        parser,
        attr_columns,
        ..
    } = entry.kind()
    else {
        unreachable!("checked by caller");
    };

    let capture_names = parser.pattern().capture_names();
    let mut identity_arrays = Vec::with_capacity(capture_names.len());
    for capture in capture_names {
        let idx = entry.column_index(capture).ok_or_else(|| {
            PivotError::invalid_input(format!("identity column '{capture}' missing from chunk"))
        })?;
        identity_arrays.push((capture.as_str(), stringify_column(chunk.column(idx))?));
    }

    let mut attr_arrays = Vec::with_capacity(attr_columns.len());
    for attr in attr_columns {
        let idx = entry.column_index(attr).ok_or_else(|| {
            PivotError::invalid_input(format!("attribute column '{attr}' missing from chunk"))
        })?;
        let is_string = entry.schema().field(idx).data_type() == &DataType::Utf8;
        attr_arrays.push((
            attr.as_str(),
            entry.is_json_column(idx),
            is_string,
            stringify_column(chunk.column(idx))?,
        ));
    }

    let mut batch = entry.connection().batch()?;
    let mut identity_values: Vec<String> = Vec::with_capacity(capture_names.len());

    for row in 0..chunk.num_rows() {
        identity_values.clear();
        for (capture, array) in &identity_arrays {
            if array.is_null(row) {
                return Err(PivotError::invalid_input(format!(
                    "cannot insert NULL into identity column '{capture}'"
                )));
            }
            identity_values.push(array.value(row).to_string());
        }

        // One key per attribute column that carries a value; NULL attributes
        // simply have no key.
        for (attr, json, is_string, array) in &attr_arrays {
            if array.is_null(row) {
                continue;
            }
            let key = parser.build(&identity_values, attr)?;
            let value = if *json {
                encode_json_value(array.value(row), *is_string)
            } else {
                array.value(row).to_string()
            };
            batch.put(&key, value.as_bytes());
            transactions.with_current(|txn| txn.check_key(&key, tables));
        }
    }

    batch.commit()?;
    Ok(chunk.num_rows() as u64)
}

fn insert_raw_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
) -> PivotResult<u64> {
    let keys = stringify_column(chunk.column(0))?;
    let values = stringify_column(chunk.column(1))?;
    let value_json = entry.is_json_column(1);
    let value_is_string = entry.schema().field(1).data_type() == &DataType::Utf8;

    let mut batch = entry.connection().batch()?;
    for row in 0..chunk.num_rows() {
        if keys.is_null(row) {
            return Err(PivotError::invalid_input(
                "cannot insert NULL key in raw mode",
            ));
        }
        let key = keys.value(row).as_bytes().to_vec();
        if values.is_null(row) {
            batch.put(&key, b"");
        } else if value_json {
            let encoded = encode_json_value(values.value(row), value_is_string);
            batch.put(&key, encoded.as_bytes());
        } else {
            batch.put(&key, values.value(row).as_bytes());
        }
        transactions.with_current(|txn| txn.check_key(&key, tables));
    }

    batch.commit()?;
    Ok(chunk.num_rows() as u64)
}

/// Deletes rows by identity (pivot) or by key (raw).
///
/// The chunk's columns are the table's row-id columns, in that order.
pub fn delete_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
) -> PivotResult<u64> {
    match entry.kind() {
        TableKind::Pivot { .. } => delete_pivot_chunk(entry, tables, transactions, chunk),
        TableKind::Raw => delete_raw_chunk(entry, tables, transactions, chunk),
    }
}

fn delete_pivot_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
) -> PivotResult<u64> {
    let TableKind::Pivot { parser, .. } = entry.kind() else {
        unreachable!("checked by caller");
    };

    let capture_map = capture_order_map(entry)?;
    let mut columns = Vec::with_capacity(chunk.num_columns());
    for idx in 0..chunk.num_columns() {
        columns.push(stringify_column(chunk.column(idx))?);
    }

    let mut batch = entry.connection().batch()?;
    let mut identity_values: Vec<String> = Vec::with_capacity(capture_map.len());
    let mut spans = Vec::with_capacity(capture_map.len());

    for row in 0..chunk.num_rows() {
        identity_values.clear();
        for &column_idx in &capture_map {
            let array = &columns[column_idx];
            identity_values.push(if array.is_null(row) {
                String::new()
            } else {
                array.value(row).to_string()
            });
        }

        // Every key under the identity prefix whose captures equal the
        // supplied identity is removed; sibling identities sharing the
        // prefix bytes are left alone.
        let prefix = parser.build_partial_prefix(&identity_values);
        let mut iter = entry.connection().iter();
        if prefix.is_empty() {
            iter.seek_to_first();
        } else {
            iter.seek(&prefix);
        }

        while iter.valid() {
            let key = iter.key();
            if !prefix.is_empty() && !key.starts_with(prefix.as_slice()) {
                break;
            }
            if parser.parse_spans(key, &mut spans).is_some() {
                let matches = spans.len() == identity_values.len()
                    && identity_values
                        .iter()
                        .zip(spans.iter())
                        .all(|(value, &(start, len))| {
                            value.as_bytes() == &key[start..start + len]
                        });
                if matches {
                    batch.del(key);
                    transactions.with_current(|txn| txn.check_key(key, tables));
                }
            }
            iter.next();
        }
    }

    batch.commit()?;
    Ok(chunk.num_rows() as u64)
}

fn delete_raw_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
) -> PivotResult<u64> {
    let keys = stringify_column(chunk.column(0))?;
    let mut batch = entry.connection().batch()?;
    for row in 0..chunk.num_rows() {
        if keys.is_null(row) {
            continue;
        }
        let key = keys.value(row).as_bytes();
        batch.del(key);
        transactions.with_current(|txn| txn.check_key(key, tables));
    }
    batch.commit()?;
    Ok(chunk.num_rows() as u64)
}

/// Applies one update chunk.
///
/// Pivot chunks are laid out `[new_value_0, …, new_value_k, identity_0, …]`
/// with the row-id columns at the end; `updated_columns` names the declared
/// column index behind each new-value column. Raw chunks are `[new_value,
/// key]`.
pub fn update_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
    updated_columns: &[usize],
) -> PivotResult<u64> {
    match entry.kind() {
        TableKind::Pivot { .. } => {
            update_pivot_chunk(entry, tables, transactions, chunk, updated_columns)
        }
        TableKind::Raw => update_raw_chunk(entry, tables, transactions, chunk),
    }
}

fn update_pivot_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
    updated_columns: &[usize],
) -> PivotResult<u64> {
    let TableKind::Pivot {
        parser,
        identity_columns,
        ..
    } = entry.kind()
    else {
        unreachable!("checked by caller");
    };

    let schema = entry.schema();
    let num_row_id = entry.row_id_columns().len();
    if chunk.num_columns() != updated_columns.len() + num_row_id {
        return Err(PivotError::invalid_input(format!(
            "update chunk has {} columns, expected {} new values plus {} identity columns",
            chunk.num_columns(),
            updated_columns.len(),
            num_row_id
        )));
    }
    let row_id_offset = chunk.num_columns() - num_row_id;

    // Identity columns cannot change: their values are baked into every key
    // of the row.
    let mut updates = Vec::with_capacity(updated_columns.len());
    for (value_idx, &column_idx) in updated_columns.iter().enumerate() {
        let field = schema.field(column_idx);
        if identity_columns.iter().any(|col| col == field.name()) {
            return Err(PivotError::not_supported(format!(
                "updating identity column '{}' is not supported",
                field.name()
            )));
        }
        updates.push((
            field.name().clone(),
            entry.is_json_column(column_idx),
            field.data_type() == &DataType::Utf8,
            stringify_column(chunk.column(value_idx))?,
        ));
    }

    let capture_map = capture_order_map(entry)?;
    let mut identity_arrays = Vec::with_capacity(num_row_id);
    for idx in 0..num_row_id {
        identity_arrays.push(stringify_column(chunk.column(row_id_offset + idx))?);
    }

    let mut batch = entry.connection().batch()?;
    let mut identity_values: Vec<String> = Vec::with_capacity(capture_map.len());

    for row in 0..chunk.num_rows() {
        identity_values.clear();
        for &column_idx in &capture_map {
            let array = &identity_arrays[column_idx];
            identity_values.push(if array.is_null(row) {
                String::new()
            } else {
                array.value(row).to_string()
            });
        }

        for (column, json, is_string, array) in &updates {
            let key = parser.build(&identity_values, column)?;
            if array.is_null(row) {
                // NULL means the attribute no longer exists for this row.
                batch.del(&key);
            } else if *json {
                let encoded = encode_json_value(array.value(row), *is_string);
                batch.put(&key, encoded.as_bytes());
            } else {
                batch.put(&key, array.value(row).as_bytes());
            }
            transactions.with_current(|txn| txn.check_key(&key, tables));
        }
    }

    batch.commit()?;
    Ok(chunk.num_rows() as u64)
}

fn update_raw_chunk(
    entry: &Arc<PivotTableEntry>,
    tables: &TableMap,
    transactions: &PivotTransactionManager,
    chunk: &RecordBatch,
) -> PivotResult<u64> {
    if chunk.num_columns() < 2 {
        return Err(PivotError::invalid_input(
            "raw update chunk must be [new_value, key]",
        ));
    }
    let values = stringify_column(chunk.column(0))?;
    let keys = stringify_column(chunk.column(chunk.num_columns() - 1))?;
    let value_json = entry.is_json_column(1);
    let value_is_string = entry.schema().field(1).data_type() == &DataType::Utf8;

    let mut batch = entry.connection().batch()?;
    for row in 0..chunk.num_rows() {
        if keys.is_null(row) {
            continue;
        }
        let key = keys.value(row).as_bytes().to_vec();
        if values.is_null(row) {
            batch.put(&key, b"");
        } else if value_json {
            let encoded = encode_json_value(values.value(row), value_is_string);
            batch.put(&key, encoded.as_bytes());
        } else {
            batch.put(&key, values.value(row).as_bytes());
        }
        transactions.with_current(|txn| txn.check_key(&key, tables));
    }
    batch.commit()?;
    Ok(chunk.num_rows() as u64)
}
