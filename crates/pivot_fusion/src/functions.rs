//! Utility table functions: `level_pivot_create_table`,
//! `level_pivot_drop_table`, and `level_pivot_dirty_tables`.
//!
//! Table creation goes through a function rather than SQL DDL because the
//! identity/attribute column split is derived from the key pattern.

use std::sync::Arc;

use datafusion::arrow::array::{Array, BooleanArray, ListArray, StringArray, StringBuilder};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::memory::MemTable;
use datafusion::catalog::{TableFunctionImpl, TableProvider};
use datafusion::common::{plan_err, DataFusionError, Result as DFResult, ScalarValue};
use datafusion::logical_expr::Expr;

use crate::catalog::AttachedDatabases;
use crate::error::df_external;
use crate::table::parse_column_type;

/// Registers the three utility functions on a session context.
pub fn register_table_functions(
    ctx: &datafusion::prelude::SessionContext,
    registry: &AttachedDatabases,
) {
    ctx.register_udtf(
        "level_pivot_create_table",
        Arc::new(CreateTableFunction {
            registry: registry.clone(),
        }),
    );
    ctx.register_udtf(
        "level_pivot_drop_table",
        Arc::new(DropTableFunction {
            registry: registry.clone(),
        }),
    );
    ctx.register_udtf(
        "level_pivot_dirty_tables",
        Arc::new(DirtyTablesFunction {
            registry: registry.clone(),
        }),
    );
}

/// `level_pivot_create_table(catalog, table, pattern, column_names,
/// [column_types], [table_mode], [column_json])` → `{success BOOLEAN}`.
#[derive(Debug)]
pub struct CreateTableFunction {
    registry: AttachedDatabases,
}

impl TableFunctionImpl for CreateTableFunction {
    fn call(&self, args: &[Expr]) -> DFResult<Arc<dyn TableProvider>> {
        if args.len() < 4 || args.len() > 7 {
            return plan_err!(
                "level_pivot_create_table expects (catalog, table, pattern, column_names, \
                 [column_types], [table_mode], [column_json])"
            );
        }

        let catalog_name = required_text(args, 0, "catalog")?;
        let table_name = required_text(args, 1, "table")?;
        // A NULL pattern is allowed for raw tables.
        let pattern = optional_text(args, 2)?.unwrap_or_default();
        let column_names = text_list(args, 3, "column_names")?;

        let column_types = match args.get(4) {
            Some(_) => {
                let names = text_list(args, 4, "column_types")?;
                if names.len() != column_names.len() {
                    return plan_err!(
                        "column_types length ({}) must match column_names length ({})",
                        names.len(),
                        column_names.len()
                    );
                }
                names
                    .iter()
                    .map(|name| parse_column_type(name).map_err(df_external))
                    .collect::<DFResult<Vec<DataType>>>()?
            }
            None => vec![DataType::Utf8; column_names.len()],
        };

        let table_mode = match args.get(5) {
            Some(_) => required_text(args, 5, "table_mode")?,
            None => "pivot".to_string(),
        };

        let column_json = match args.get(6) {
            Some(_) => {
                let flags = bool_list(args, 6, "column_json")?;
                if flags.len() != column_names.len() {
                    return plan_err!(
                        "column_json length ({}) must match column_names length ({})",
                        flags.len(),
                        column_names.len()
                    );
                }
                flags
            }
            None => vec![false; column_names.len()],
        };

        let catalog = self.registry.get(&catalog_name).ok_or_else(|| {
            DataFusionError::Plan(format!("unknown level_pivot catalog '{catalog_name}'"))
        })?;

        match table_mode.as_str() {
            "raw" => catalog
                .create_raw_table(&table_name, &column_names, &column_types, &column_json)
                .map_err(df_external)?,
            "pivot" => {
                if pattern.is_empty() {
                    return plan_err!("pattern is required for pivot tables");
                }
                catalog
                    .create_pivot_table(
                        &table_name,
                        &pattern,
                        &column_names,
                        &column_types,
                        &column_json,
                    )
                    .map_err(df_external)?;
            }
            other => return plan_err!("table_mode must be 'pivot' or 'raw', got '{other}'"),
        }

        success_provider()
    }
}

/// `level_pivot_drop_table(catalog, table)` → `{success BOOLEAN}`.
#[derive(Debug)]
pub struct DropTableFunction {
    registry: AttachedDatabases,
}

impl TableFunctionImpl for DropTableFunction {
    fn call(&self, args: &[Expr]) -> DFResult<Arc<dyn TableProvider>> {
        if args.len() != 2 {
            return plan_err!("level_pivot_drop_table expects (catalog, table)");
        }
        let catalog_name = required_text(args, 0, "catalog")?;
        let table_name = required_text(args, 1, "table")?;

        let catalog = self.registry.get(&catalog_name).ok_or_else(|| {
            DataFusionError::Plan(format!("unknown level_pivot catalog '{catalog_name}'"))
        })?;
        catalog.drop_table(&table_name).map_err(df_external)?;
        success_provider()
    }
}

/// `level_pivot_dirty_tables()` → rows of `(database_name, table_name,
/// table_mode)` for tables dirty in the active transaction of any attached
/// database.
#[derive(Debug)]
pub struct DirtyTablesFunction {
    registry: AttachedDatabases,
}

impl TableFunctionImpl for DirtyTablesFunction {
    fn call(&self, args: &[Expr]) -> DFResult<Arc<dyn TableProvider>> {
        if !args.is_empty() {
            return plan_err!("level_pivot_dirty_tables takes no arguments");
        }

        let mut database_names = StringBuilder::new();
        let mut table_names = StringBuilder::new();
        let mut table_modes = StringBuilder::new();

        for (database_name, catalog) in self.registry.snapshot() {
            let dirty = catalog.transactions().dirty_tables();
            if dirty.is_empty() {
                continue;
            }
            for table_name in dirty {
                // A table can be dropped after it was marked dirty.
                let Some(entry) = catalog.main_schema().table_entry(&table_name) else {
                    continue;
                };
                database_names.append_value(&database_name);
                table_names.append_value(&table_name);
                table_modes.append_value(entry.mode().as_str());
            }
        }

        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("database_name", DataType::Utf8, false),
            Field::new("table_name", DataType::Utf8, false),
            Field::new("table_mode", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(database_names.finish()),
                Arc::new(table_names.finish()),
                Arc::new(table_modes.finish()),
            ],
        )?;
        let table = MemTable::try_new(schema, vec![vec![batch]])?;
        Ok(Arc::new(table))
    }
}

/// One-row `{success: true}` result table.
fn success_provider() -> DFResult<Arc<dyn TableProvider>> {
    let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
        "success",
        DataType::Boolean,
        false,
    )]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![Arc::new(BooleanArray::from(vec![true]))],
    )?;
    let table = MemTable::try_new(schema, vec![vec![batch]])?;
    Ok(Arc::new(table))
}

/// A scalar string argument; NULL or non-string values are rejected.
fn required_text(args: &[Expr], idx: usize, name: &str) -> DFResult<String> {
    optional_text(args, idx)?
        .ok_or_else(|| DataFusionError::Plan(format!("argument '{name}' must be a string")))
}

/// A scalar string argument that may be NULL.
fn optional_text(args: &[Expr], idx: usize) -> DFResult<Option<String>> {
    match &args[idx] {
        Expr::Literal(ScalarValue::Utf8(value), _)
        | Expr::Literal(ScalarValue::LargeUtf8(value), _)
        | Expr::Literal(ScalarValue::Utf8View(value), _) => Ok(value.clone()),
        Expr::Literal(ScalarValue::Null, _) => Ok(None),
        other => Err(DataFusionError::Plan(format!(
            "expected a string literal argument, got {other}"
        ))),
    }
}

/// A `['a', 'b', …]` argument, accepted as an array expression or a list
/// literal.
fn text_list(args: &[Expr], idx: usize, name: &str) -> DFResult<Vec<String>> {
    match &args[idx] {
        Expr::ScalarFunction(call) if call.func.name() == "make_array" => call
            .args
            .iter()
            .map(|arg| match arg {
                Expr::Literal(ScalarValue::Utf8(Some(value)), _)
                | Expr::Literal(ScalarValue::LargeUtf8(Some(value)), _)
                | Expr::Literal(ScalarValue::Utf8View(Some(value)), _) => Ok(value.clone()),
                other => Err(DataFusionError::Plan(format!(
                    "argument '{name}' must be a list of strings, got element {other}"
                ))),
            })
            .collect(),
        Expr::Literal(ScalarValue::List(list), _) => list_scalar_to_strings(list, name),
        other => Err(DataFusionError::Plan(format!(
            "argument '{name}' must be a list of strings, got {other}"
        ))),
    }
}

/// A `[true, false, …]` argument.
fn bool_list(args: &[Expr], idx: usize, name: &str) -> DFResult<Vec<bool>> {
    match &args[idx] {
        Expr::ScalarFunction(call) if call.func.name() == "make_array" => call
            .args
            .iter()
            .map(|arg| match arg {
                Expr::Literal(ScalarValue::Boolean(Some(flag)), _) => Ok(*flag),
                other => Err(DataFusionError::Plan(format!(
                    "argument '{name}' must be a list of booleans, got element {other}"
                ))),
            })
            .collect(),
        Expr::Literal(ScalarValue::List(list), _) => {
            let values = list_scalar_values(list, name)?;
            let flags = cast(&values, &DataType::Boolean)?;
            let flags = flags
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| {
                    DataFusionError::Plan(format!("argument '{name}' must be a list of booleans"))
                })?;
            (0..flags.len())
                .map(|i| {
                    if flags.is_null(i) {
                        Err(DataFusionError::Plan(format!(
                            "argument '{name}' must not contain NULL"
                        )))
                    } else {
                        Ok(flags.value(i))
                    }
                })
                .collect()
        }
        other => Err(DataFusionError::Plan(format!(
            "argument '{name}' must be a list of booleans, got {other}"
        ))),
    }
}

fn list_scalar_values(
    list: &ListArray,
    name: &str,
) -> DFResult<datafusion::arrow::array::ArrayRef> {
    if list.len() != 1 {
        return Err(DataFusionError::Plan(format!(
            "argument '{name}' must be a single list value"
        )));
    }
    Ok(list.value(0))
}

fn list_scalar_to_strings(list: &ListArray, name: &str) -> DFResult<Vec<String>> {
    let values = list_scalar_values(list, name)?;
    let values = cast(&values, &DataType::Utf8)?;
    let values = values
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| {
            DataFusionError::Plan(format!("argument '{name}' must be a list of strings"))
        })?;
    (0..values.len())
        .map(|i| {
            if values.is_null(i) {
                Err(DataFusionError::Plan(format!(
                    "argument '{name}' must not contain NULL"
                )))
            } else {
                Ok(values.value(i).to_string())
            }
        })
        .collect()
}
