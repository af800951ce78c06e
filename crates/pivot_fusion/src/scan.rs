//! Chunked scan engines for pivot and raw tables.
//!
//! A pivot scan streams ordered key-value pairs through the key parser and
//! stitches every run of keys sharing an identity into one logical row. State
//! survives across chunks: the engine can stop at any chunk boundary and
//! resume without re-reading or skipping keys. A raw scan is a transparent
//! one-key-one-row walk.

use std::sync::Arc;

use datafusion::arrow::array::{new_null_array, Array, ArrayRef, StringBuilder};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use pivot_store::StoreIterator;
use tracing::debug;

use crate::error::{PivotError, PivotResult};
use crate::parser::Span;
use crate::table::{PivotTableEntry, TableKind};
use crate::values::{decode_value, DecodedValue};

/// Rows per emitted chunk.
pub const VECTOR_SIZE: usize = 2048;

/// Projection entry for the virtual row-id column; its output slot is
/// emitted as NULL because identity columns are the effective row id.
pub const ROW_ID_COLUMN: usize = usize::MAX;

/// What one projected output column is filled from.
#[derive(Debug, Clone, Copy)]
enum OutputColumn {
    /// Capture value of the in-progress identity.
    Identity(usize),
    /// Attribute slot index into the written/value buffers.
    Attr(usize),
    /// Virtual row-id slot; never written.
    RowId,
}

/// One projected attribute column.
#[derive(Debug, Clone)]
struct AttrSlot {
    /// Attribute name bytes as they appear in keys.
    name: Vec<u8>,
    json: bool,
}

/// Resumable pivot-mode scan.
pub struct PivotScanState {
    entry: Arc<PivotTableEntry>,
    output_schema: SchemaRef,
    vector_size: usize,
    prefix: Vec<u8>,
    iter: StoreIterator,
    columns: Vec<OutputColumn>,
    /// Projected attribute columns sorted by name in byte order, matching
    /// the iteration order of keys that share an identity.
    attrs: Vec<AttrSlot>,
    has_identity: bool,
    current_identity: Vec<Vec<u8>>,
    written: Vec<bool>,
    attr_values: Vec<Vec<u8>>,
    spans: Vec<Span>,
    done: bool,
}

impl PivotScanState {
    /// Opens the iterator and precomputes the projection maps.
    ///
    /// `narrowed_prefix` comes from filter pushdown; absent, the scan covers
    /// the pattern's whole literal prefix.
    pub fn new(
        entry: Arc<PivotTableEntry>,
        projection: &[usize],
        narrowed_prefix: Option<Vec<u8>>,
        vector_size: usize,
    ) -> PivotResult<Self> {
        let TableKind::Pivot { parser, .. } = entry.kind() else {
            return Err(PivotError::invalid_input("pivot scan over a raw table"));
        };

        let schema = entry.schema();
        let mut fields = Vec::with_capacity(projection.len());
        let mut columns = Vec::with_capacity(projection.len());
        let mut attrs: Vec<(AttrSlot, usize)> = Vec::new();

        for (out_idx, &col_idx) in projection.iter().enumerate() {
            if col_idx == ROW_ID_COLUMN {
                fields.push(Field::new("rowid", DataType::Int64, true));
                columns.push(OutputColumn::RowId);
                continue;
            }
            let field = schema.fields().get(col_idx).ok_or_else(|| {
                PivotError::invalid_input(format!("projected column {col_idx} out of range"))
            })?;
            fields.push(field.as_ref().clone());
            match parser.pattern().capture_index(field.name()) {
                Some(capture_idx) => columns.push(OutputColumn::Identity(capture_idx)),
                None => {
                    // Placeholder; rewired to the sorted slot below.
                    columns.push(OutputColumn::Attr(usize::MAX));
                    attrs.push((
                        AttrSlot {
                            name: field.name().as_bytes().to_vec(),
                            json: entry.is_json_column(col_idx),
                        },
                        out_idx,
                    ));
                }
            }
        }

        attrs.sort_by(|left, right| left.0.name.cmp(&right.0.name));
        let mut attr_slots = Vec::with_capacity(attrs.len());
        for (slot, (attr, out_idx)) in attrs.into_iter().enumerate() {
            columns[out_idx] = OutputColumn::Attr(slot);
            attr_slots.push(attr);
        }

        let prefix = narrowed_prefix.unwrap_or_else(|| parser.build_prefix().to_vec());
        let mut iter = entry.connection().iter();
        if prefix.is_empty() {
            iter.seek_to_first();
        } else {
            iter.seek(&prefix);
        }

        debug!(
            table = entry.name(),
            prefix = %String::from_utf8_lossy(&prefix),
            projected = columns.len(),
            "starting pivot scan"
        );

        let capture_count = parser.pattern().capture_count();
        let attr_count = attr_slots.len();
        Ok(Self {
            entry,
            output_schema: Arc::new(Schema::new(fields)),
            vector_size,
            prefix,
            iter,
            columns,
            attrs: attr_slots,
            has_identity: false,
            current_identity: vec![Vec::new(); capture_count],
            written: vec![false; attr_count],
            attr_values: vec![Vec::new(); attr_count],
            spans: Vec::with_capacity(capture_count),
            done: false,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    /// Produces the next chunk, or `None` once the scan is exhausted.
    pub fn next_chunk(&mut self) -> PivotResult<Option<RecordBatch>> {
        if self.done {
            return Ok(None);
        }

        let mut builders: Vec<StringBuilder> =
            (0..self.columns.len()).map(|_| StringBuilder::new()).collect();
        let mut row_count = 0usize;

        loop {
            if !self.iter.valid() {
                if self.has_identity {
                    flush_row(
                        &self.columns,
                        &self.attrs,
                        &self.current_identity,
                        &self.written,
                        &self.attr_values,
                        &mut builders,
                    );
                    row_count += 1;
                    self.has_identity = false;
                }
                self.done = true;
                break;
            }

            let key = self.iter.key();
            if !key.starts_with(&self.prefix) {
                // Past the scan range; emit the in-progress row and stop.
                if self.has_identity {
                    flush_row(
                        &self.columns,
                        &self.attrs,
                        &self.current_identity,
                        &self.written,
                        &self.attr_values,
                        &mut builders,
                    );
                    row_count += 1;
                    self.has_identity = false;
                }
                self.done = true;
                break;
            }

            let TableKind::Pivot { parser, .. } = self.entry.kind() else {
                unreachable!("checked at construction");
            };
            let Some(attr_span) = parser.parse_spans(key, &mut self.spans) else {
                // Keys outside the pattern are legitimate neighbors; skip.
                self.iter.next();
                continue;
            };

            if !self.has_identity {
                adopt_identity(&mut self.current_identity, &mut self.written, key, &self.spans);
                self.has_identity = true;
            } else if !identity_matches(&self.current_identity, key, &self.spans) {
                flush_row(
                    &self.columns,
                    &self.attrs,
                    &self.current_identity,
                    &self.written,
                    &self.attr_values,
                    &mut builders,
                );
                row_count += 1;
                if row_count == self.vector_size {
                    // Chunk filled on an identity change. Leave the iterator
                    // on this key; the next call re-parses it from scratch.
                    self.has_identity = false;
                    return Ok(Some(self.finish_chunk(builders, row_count)?));
                }
                adopt_identity(&mut self.current_identity, &mut self.written, key, &self.spans);
            }

            if let Some((attr_start, attr_len)) = attr_span {
                let attr_name = &key[attr_start..attr_start + attr_len];
                // Projected attribute sets typically hold 2-5 entries; a
                // linear probe over the sorted list beats a binary search.
                if let Some(slot) = self
                    .attrs
                    .iter()
                    .position(|attr| attr.name.as_slice() == attr_name)
                {
                    let value = self.iter.value();
                    self.attr_values[slot].clear();
                    self.attr_values[slot].extend_from_slice(value);
                    self.written[slot] = true;
                }
            }
            self.iter.next();
        }

        if row_count == 0 {
            return Ok(None);
        }
        Ok(Some(self.finish_chunk(builders, row_count)?))
    }

    fn finish_chunk(
        &self,
        builders: Vec<StringBuilder>,
        row_count: usize,
    ) -> PivotResult<RecordBatch> {
        finish_chunk(&self.output_schema, builders, row_count)
    }
}

impl Iterator for PivotScanState {
    type Item = PivotResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Copies the parsed captures into the reusable identity buffer and clears
/// the per-attribute written flags. Buffer capacities persist across rows.
fn adopt_identity(
    identity: &mut [Vec<u8>],
    written: &mut [bool],
    key: &[u8],
    spans: &[Span],
) {
    for (slot, &(start, len)) in identity.iter_mut().zip(spans.iter()) {
        slot.clear();
        slot.extend_from_slice(&key[start..start + len]);
    }
    written.fill(false);
}

/// Element-wise byte equality between the in-progress identity and the
/// current key's captures.
fn identity_matches(identity: &[Vec<u8>], key: &[u8], spans: &[Span]) -> bool {
    if identity.len() != spans.len() {
        return false;
    }
    identity
        .iter()
        .zip(spans.iter())
        .all(|(value, &(start, len))| value.as_slice() == &key[start..start + len])
}

/// Appends one finished row: identity columns from the identity buffer,
/// attribute columns from their accumulated values, NULL where unwritten.
fn flush_row(
    columns: &[OutputColumn],
    attrs: &[AttrSlot],
    identity: &[Vec<u8>],
    written: &[bool],
    attr_values: &[Vec<u8>],
    builders: &mut [StringBuilder],
) {
    for (builder, column) in builders.iter_mut().zip(columns.iter()) {
        match *column {
            OutputColumn::Identity(capture_idx) => {
                builder.append_value(String::from_utf8_lossy(&identity[capture_idx]));
            }
            OutputColumn::Attr(slot) => {
                if written[slot] {
                    match decode_value(&attr_values[slot], attrs[slot].json) {
                        DecodedValue::Null => builder.append_null(),
                        DecodedValue::Text(text) => builder.append_value(text),
                    }
                } else {
                    builder.append_null();
                }
            }
            OutputColumn::RowId => builder.append_null(),
        }
    }
}

/// Finishes the UTF-8 accumulators and casts each column to its declared
/// type via the host's default string coercion.
fn finish_chunk(
    schema: &SchemaRef,
    builders: Vec<StringBuilder>,
    row_count: usize,
) -> PivotResult<RecordBatch> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(builders.len());
    for (mut builder, field) in builders.into_iter().zip(schema.fields().iter()) {
        let array: ArrayRef = Arc::new(builder.finish());
        let array = if field.data_type() == &DataType::Utf8 {
            array
        } else if array.null_count() == array.len() {
            new_null_array(field.data_type(), array.len())
        } else {
            cast(&array, field.data_type()).map_err(|err| {
                PivotError::invalid_input(format!(
                    "cannot coerce column '{}' to {}: {err}",
                    field.name(),
                    field.data_type()
                ))
            })?
        };
        arrays.push(array);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(row_count));
    RecordBatch::try_new_with_options(Arc::clone(schema), arrays, &options)
        .map_err(|err| PivotError::invalid_input(format!("chunk assembly failed: {err}")))
}

/// Projection entry for a raw scan output column.
#[derive(Debug, Clone, Copy)]
enum RawColumn {
    Key,
    Value,
    RowId,
}

/// Transparent one-key-one-row scan over the whole store.
pub struct RawScanState {
    entry: Arc<PivotTableEntry>,
    output_schema: SchemaRef,
    vector_size: usize,
    iter: StoreIterator,
    columns: Vec<RawColumn>,
    done: bool,
}

impl RawScanState {
    pub fn new(
        entry: Arc<PivotTableEntry>,
        projection: &[usize],
        vector_size: usize,
    ) -> PivotResult<Self> {
        if !matches!(entry.kind(), TableKind::Raw) {
            return Err(PivotError::invalid_input("raw scan over a pivot table"));
        }

        let schema = entry.schema();
        let mut fields = Vec::with_capacity(projection.len());
        let mut columns = Vec::with_capacity(projection.len());
        for &col_idx in projection {
            if col_idx == ROW_ID_COLUMN {
                fields.push(Field::new("rowid", DataType::Int64, true));
                columns.push(RawColumn::RowId);
                continue;
            }
            let field = schema.fields().get(col_idx).ok_or_else(|| {
                PivotError::invalid_input(format!("projected column {col_idx} out of range"))
            })?;
            fields.push(field.as_ref().clone());
            columns.push(if col_idx == 0 {
                RawColumn::Key
            } else {
                RawColumn::Value
            });
        }

        let mut iter = entry.connection().iter();
        iter.seek_to_first();

        debug!(table = entry.name(), "starting raw scan");

        Ok(Self {
            entry,
            output_schema: Arc::new(Schema::new(fields)),
            vector_size,
            iter,
            columns,
            done: false,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    pub fn next_chunk(&mut self) -> PivotResult<Option<RecordBatch>> {
        if self.done {
            return Ok(None);
        }

        let value_json = self.entry.is_json_column(1);
        let mut builders: Vec<StringBuilder> =
            (0..self.columns.len()).map(|_| StringBuilder::new()).collect();
        let mut row_count = 0usize;

        while row_count < self.vector_size && self.iter.valid() {
            let key = self.iter.key();
            let value = self.iter.value();
            for (builder, column) in builders.iter_mut().zip(self.columns.iter()) {
                match column {
                    RawColumn::Key => builder.append_value(String::from_utf8_lossy(key)),
                    RawColumn::Value => match decode_value(value, value_json) {
                        DecodedValue::Null => builder.append_null(),
                        DecodedValue::Text(text) => builder.append_value(text),
                    },
                    RawColumn::RowId => builder.append_null(),
                }
            }
            row_count += 1;
            self.iter.next();
        }

        if !self.iter.valid() {
            self.done = true;
        }
        if row_count == 0 {
            return Ok(None);
        }
        Ok(Some(finish_chunk(&self.output_schema, builders, row_count)?))
    }
}

impl Iterator for RawScanState {
    type Item = PivotResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
