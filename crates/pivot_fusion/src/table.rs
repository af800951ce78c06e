//! Table entries registered in a level-pivot catalog.
//!
//! An entry ties a table name and declared columns to the shared store
//! connection, in one of two modes: pivot (rows reconstructed from many keys
//! through a key pattern) or raw (a transparent `(key, value)` view).

use std::sync::Arc;

use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use pivot_store::StoreConnection;

use crate::error::{PivotError, PivotResult};
use crate::parser::KeyParser;

/// Storage model of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    Pivot,
    Raw,
}

impl TableMode {
    /// External string tag, as shown by `level_pivot_dirty_tables`.
    pub fn as_str(self) -> &'static str {
        match self {
            TableMode::Pivot => "pivot",
            TableMode::Raw => "raw",
        }
    }
}

/// Mode-specific table state.
#[derive(Debug)]
pub enum TableKind {
    Pivot {
        parser: KeyParser,
        /// Declared columns whose names match pattern captures.
        identity_columns: Vec<String>,
        /// All other declared columns; populated from attribute keys.
        attr_columns: Vec<String>,
    },
    Raw,
}

/// One table registered in the catalog.
#[derive(Debug)]
pub struct PivotTableEntry {
    name: String,
    connection: Arc<StoreConnection>,
    schema: SchemaRef,
    json_flags: Vec<bool>,
    kind: TableKind,
}

impl PivotTableEntry {
    /// Creates a pivot-mode entry, splitting declared columns into identity
    /// and attribute columns by capture-name match.
    pub fn new_pivot(
        name: impl Into<String>,
        connection: Arc<StoreConnection>,
        pattern: &str,
        column_names: &[String],
        column_types: &[DataType],
        json_flags: &[bool],
    ) -> PivotResult<Self> {
        let name = name.into();
        validate_column_shape(column_names, column_types, json_flags)?;

        let parser = KeyParser::compile(pattern)?;
        if !parser.pattern().has_attr() {
            return Err(PivotError::pattern(
                "pivot table pattern must contain an attribute slot '{}'",
            ));
        }

        for capture in parser.pattern().capture_names() {
            let declared = column_names.iter().filter(|col| *col == capture).count();
            if declared != 1 {
                return Err(PivotError::invalid_input(format!(
                    "capture '{capture}' must appear exactly once among declared columns \
                     (found {declared})"
                )));
            }
        }

        let mut identity_columns = Vec::new();
        let mut attr_columns = Vec::new();
        for (idx, column) in column_names.iter().enumerate() {
            if parser.pattern().has_capture(column) {
                if json_flags[idx] {
                    return Err(PivotError::invalid_input(format!(
                        "identity column '{column}' cannot be JSON-encoded"
                    )));
                }
                identity_columns.push(column.clone());
            } else {
                attr_columns.push(column.clone());
            }
        }

        Ok(Self {
            name,
            connection,
            schema: build_schema(column_names, column_types),
            json_flags: json_flags.to_vec(),
            kind: TableKind::Pivot {
                parser,
                identity_columns,
                attr_columns,
            },
        })
    }

    /// Creates a raw-mode entry over the fixed `(key, value)` shape.
    pub fn new_raw(
        name: impl Into<String>,
        connection: Arc<StoreConnection>,
        column_names: &[String],
        column_types: &[DataType],
        json_flags: &[bool],
    ) -> PivotResult<Self> {
        let name = name.into();
        validate_column_shape(column_names, column_types, json_flags)?;
        if column_names.len() != 2 {
            return Err(PivotError::invalid_input(
                "raw tables must have exactly 2 columns (key, value)",
            ));
        }
        if json_flags[0] {
            return Err(PivotError::invalid_input(
                "key column cannot be JSON-encoded",
            ));
        }

        Ok(Self {
            name,
            connection,
            schema: build_schema(column_names, column_types),
            json_flags: json_flags.to_vec(),
            kind: TableKind::Raw,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> TableMode {
        match self.kind {
            TableKind::Pivot { .. } => TableMode::Pivot,
            TableKind::Raw => TableMode::Raw,
        }
    }

    pub fn kind(&self) -> &TableKind {
        &self.kind
    }

    pub fn connection(&self) -> &Arc<StoreConnection> {
        &self.connection
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn is_json_column(&self, index: usize) -> bool {
        self.json_flags.get(index).copied().unwrap_or(false)
    }

    /// Index of a declared column by name.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.schema.fields().iter().position(|f| f.name() == column)
    }

    /// Key parser; present only for pivot mode.
    pub fn parser(&self) -> Option<&KeyParser> {
        match &self.kind {
            TableKind::Pivot { parser, .. } => Some(parser),
            TableKind::Raw => None,
        }
    }

    /// Columns that identify a row: identity columns (pivot) or the key
    /// column (raw). These double as the keys update/delete consume.
    pub fn row_id_columns(&self) -> Vec<usize> {
        match &self.kind {
            TableKind::Pivot {
                identity_columns, ..
            } => identity_columns
                .iter()
                .filter_map(|column| self.column_index(column))
                .collect(),
            TableKind::Raw => vec![0],
        }
    }
}

fn validate_column_shape(
    column_names: &[String],
    column_types: &[DataType],
    json_flags: &[bool],
) -> PivotResult<()> {
    if column_names.is_empty() {
        return Err(PivotError::invalid_input("table requires at least one column"));
    }
    if column_types.len() != column_names.len() {
        return Err(PivotError::invalid_input(format!(
            "column_types length ({}) must match column_names length ({})",
            column_types.len(),
            column_names.len()
        )));
    }
    if json_flags.len() != column_names.len() {
        return Err(PivotError::invalid_input(format!(
            "column_json length ({}) must match column_names length ({})",
            json_flags.len(),
            column_names.len()
        )));
    }
    Ok(())
}

fn build_schema(column_names: &[String], column_types: &[DataType]) -> SchemaRef {
    let fields: Vec<Field> = column_names
        .iter()
        .zip(column_types.iter())
        .map(|(name, data_type)| Field::new(name, data_type.clone(), true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Maps a SQL type name onto its arrow storage type.
pub fn parse_column_type(name: &str) -> PivotResult<DataType> {
    match name.trim().to_ascii_uppercase().as_str() {
        "VARCHAR" | "TEXT" | "STRING" | "CHAR" => Ok(DataType::Utf8),
        "TINYINT" | "INT1" => Ok(DataType::Int8),
        "SMALLINT" | "INT2" => Ok(DataType::Int16),
        "INTEGER" | "INT" | "INT4" => Ok(DataType::Int32),
        "BIGINT" | "INT8" => Ok(DataType::Int64),
        "UTINYINT" => Ok(DataType::UInt8),
        "USMALLINT" => Ok(DataType::UInt16),
        "UINTEGER" => Ok(DataType::UInt32),
        "UBIGINT" => Ok(DataType::UInt64),
        "REAL" | "FLOAT" | "FLOAT4" => Ok(DataType::Float32),
        "DOUBLE" | "FLOAT8" => Ok(DataType::Float64),
        "BOOLEAN" | "BOOL" => Ok(DataType::Boolean),
        other => Err(PivotError::invalid_input(format!(
            "unsupported column type '{other}'"
        ))),
    }
}
