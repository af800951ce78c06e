//! DataFusion integration: table provider, streaming scan plan, equality
//! filter pushdown, and the INSERT sink.
//!
//! Pushdown is purely an optimization. Equality filters on identity columns
//! narrow the scan prefix, but every filter is reported as `Inexact` so the
//! host re-applies it as a post-filter and no rows can be lost.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::{Session, TableProvider};
use datafusion::common::{exec_err, not_impl_err, Result as DFResult, ScalarValue, SchemaExt};
use datafusion::datasource::sink::{DataSink, DataSinkExec};
use datafusion::execution::TaskContext;
use datafusion::logical_expr::dml::InsertOp;
use datafusion::logical_expr::{Expr, Operator, TableProviderFilterPushDown, TableType};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::display::{DisplayAs, DisplayFormatType};
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    ExecutionPlan, Partitioning, PlanProperties, SendableRecordBatchStream,
};
use futures::StreamExt;
use tracing::debug;

use crate::error::{df_external, PivotResult};
use crate::mutation;
use crate::scan::{PivotScanState, RawScanState, VECTOR_SIZE};
use crate::table::{PivotTableEntry, TableKind};
use crate::transaction::{PivotTransactionManager, TableMap};

/// DataFusion-facing view of one table entry.
///
/// Carries the shared table map and transaction manager of its database so
/// write operators can classify keys without a back-pointer to the catalog.
#[derive(Clone)]
pub struct PivotTableProvider {
    entry: Arc<PivotTableEntry>,
    tables: Arc<RwLock<TableMap>>,
    transactions: Arc<PivotTransactionManager>,
}

impl PivotTableProvider {
    pub fn new(
        entry: Arc<PivotTableEntry>,
        tables: Arc<RwLock<TableMap>>,
        transactions: Arc<PivotTransactionManager>,
    ) -> Self {
        Self {
            entry,
            tables,
            transactions,
        }
    }

    pub fn table_entry(&self) -> &Arc<PivotTableEntry> {
        &self.entry
    }

    /// Insert operator entry point for host-driven (non-SQL) writes.
    pub fn insert_chunk(&self, chunk: &RecordBatch) -> PivotResult<u64> {
        let tables = self.tables.read().expect("table map lock poisoned");
        mutation::insert_chunk(&self.entry, &tables, &self.transactions, chunk)
    }

    /// Delete operator: the chunk carries the row-id columns.
    pub fn delete_chunk(&self, chunk: &RecordBatch) -> PivotResult<u64> {
        let tables = self.tables.read().expect("table map lock poisoned");
        mutation::delete_chunk(&self.entry, &tables, &self.transactions, chunk)
    }

    /// Update operator: `[new values…, row-id columns…]` chunk layout.
    pub fn update_chunk(&self, chunk: &RecordBatch, updated_columns: &[usize]) -> PivotResult<u64> {
        let tables = self.tables.read().expect("table map lock poisoned");
        mutation::update_chunk(&self.entry, &tables, &self.transactions, chunk, updated_columns)
    }

    /// Identity column indices (pivot) or the key column (raw); the host
    /// feeds these back as the row identifier for update/delete.
    pub fn row_id_columns(&self) -> Vec<usize> {
        self.entry.row_id_columns()
    }

    /// Derives the narrowed scan prefix from bound equality filters.
    ///
    /// Walks capture names in pattern order and collects consecutively bound
    /// values until the first gap; a leading run yields a prefix, anything
    /// else leaves the scan at the pattern's literal prefix.
    fn narrowed_prefix(&self, filters: &[Expr]) -> Option<Vec<u8>> {
        let TableKind::Pivot { parser, .. } = self.entry.kind() else {
            return None;
        };
        if filters.is_empty() {
            return None;
        }

        let mut bindings: HashMap<String, String> = HashMap::new();
        for filter in filters {
            if let Some(pairs) = extract_equality_bindings(filter) {
                for (column, value) in pairs {
                    bindings.entry(column).or_insert(value);
                }
            }
        }

        let mut values = Vec::new();
        for capture in parser.pattern().capture_names() {
            match bindings.get(capture) {
                Some(value) => values.push(value.clone()),
                None => break,
            }
        }
        if values.is_empty() {
            return None;
        }
        Some(parser.build_partial_prefix(&values))
    }
}

impl fmt::Debug for PivotTableProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PivotTableProvider")
            .field("table", &self.entry.name())
            .field("mode", &self.entry.mode().as_str())
            .finish()
    }
}

#[async_trait]
impl TableProvider for PivotTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.entry.schema()
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        _state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        _limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let projection = projection
            .cloned()
            .unwrap_or_else(|| (0..self.entry.schema().fields().len()).collect());
        let narrowed_prefix = self.narrowed_prefix(filters);

        debug!(
            table = self.entry.name(),
            filters = filters.len(),
            projection = ?projection,
            narrowed = narrowed_prefix.is_some(),
            "planning level_pivot scan"
        );

        Ok(Arc::new(PivotScanExec::try_new(
            Arc::clone(&self.entry),
            projection,
            narrowed_prefix,
        )?))
    }

    async fn insert_into(
        &self,
        _state: &dyn Session,
        input: Arc<dyn ExecutionPlan>,
        insert_op: InsertOp,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        self.schema()
            .logically_equivalent_names_and_types(&input.schema())?;
        if insert_op != InsertOp::Append {
            return not_impl_err!("{insert_op} is not implemented for level_pivot tables");
        }

        let sink = PivotInsertSink::new(self.clone());
        Ok(Arc::new(DataSinkExec::new(input, Arc::new(sink), None)))
    }

    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> DFResult<Vec<TableProviderFilterPushDown>> {
        let identity_filter = |filter: &Expr| -> bool {
            let TableKind::Pivot { parser, .. } = self.entry.kind() else {
                return false;
            };
            match extract_equality_bindings(filter) {
                Some(pairs) => pairs
                    .iter()
                    .any(|(column, _)| parser.pattern().has_capture(column)),
                None => false,
            }
        };

        Ok(filters
            .iter()
            .map(|filter| {
                if identity_filter(filter) {
                    TableProviderFilterPushDown::Inexact
                } else {
                    TableProviderFilterPushDown::Unsupported
                }
            })
            .collect())
    }
}

/// Streaming scan over one table; emits chunks of up to [`VECTOR_SIZE`] rows.
#[derive(Debug)]
pub struct PivotScanExec {
    entry: Arc<PivotTableEntry>,
    projection: Vec<usize>,
    narrowed_prefix: Option<Vec<u8>>,
    projected_schema: SchemaRef,
    properties: PlanProperties,
}

impl PivotScanExec {
    pub fn try_new(
        entry: Arc<PivotTableEntry>,
        projection: Vec<usize>,
        narrowed_prefix: Option<Vec<u8>>,
    ) -> DFResult<Self> {
        let projected_schema = Arc::new(entry.schema().project(&projection)?);
        let properties = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&projected_schema)),
            Partitioning::UnknownPartitioning(1),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );
        Ok(Self {
            entry,
            projection,
            narrowed_prefix,
            projected_schema,
            properties,
        })
    }
}

impl DisplayAs for PivotScanExec {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => {
                write!(
                    f,
                    "PivotScanExec(table={}, mode={}",
                    self.entry.name(),
                    self.entry.mode().as_str()
                )?;
                if let Some(prefix) = &self.narrowed_prefix {
                    write!(f, ", prefix={}", String::from_utf8_lossy(prefix))?;
                }
                write!(f, ")")
            }
            DisplayFormatType::TreeRender => write!(f, ""),
        }
    }
}

impl ExecutionPlan for PivotScanExec {
    fn name(&self) -> &str {
        "PivotScanExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn properties(&self) -> &PlanProperties {
        &self.properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        _children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        Ok(self)
    }

    fn execute(
        &self,
        partition: usize,
        _context: Arc<TaskContext>,
    ) -> DFResult<SendableRecordBatchStream> {
        if partition != 0 {
            return exec_err!("PivotScanExec is single-partitioned, got partition {partition}");
        }

        let chunks: Box<dyn Iterator<Item = DFResult<RecordBatch>> + Send> =
            match self.entry.kind() {
                TableKind::Pivot { .. } => {
                    let state = PivotScanState::new(
                        Arc::clone(&self.entry),
                        &self.projection,
                        self.narrowed_prefix.clone(),
                        VECTOR_SIZE,
                    )
                    .map_err(df_external)?;
                    Box::new(state.map(|chunk| chunk.map_err(df_external)))
                }
                TableKind::Raw => {
                    let state = RawScanState::new(
                        Arc::clone(&self.entry),
                        &self.projection,
                        VECTOR_SIZE,
                    )
                    .map_err(df_external)?;
                    Box::new(state.map(|chunk| chunk.map_err(df_external)))
                }
            };

        Ok(Box::pin(RecordBatchStreamAdapter::new(
            Arc::clone(&self.projected_schema),
            futures::stream::iter(chunks),
        )))
    }
}

/// INSERT sink: buffers nothing, writes one store batch per input chunk.
struct PivotInsertSink {
    provider: PivotTableProvider,
    schema: SchemaRef,
}

impl PivotInsertSink {
    fn new(provider: PivotTableProvider) -> Self {
        Self {
            schema: provider.schema(),
            provider,
        }
    }
}

impl fmt::Debug for PivotInsertSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PivotInsertSink")
            .field("table", &self.provider.entry.name())
            .finish()
    }
}

impl DisplayAs for PivotInsertSink {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => {
                write!(f, "PivotInsertSink(table={})", self.provider.entry.name())
            }
            DisplayFormatType::TreeRender => write!(f, ""),
        }
    }
}

#[async_trait]
impl DataSink for PivotInsertSink {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    async fn write_all(
        &self,
        mut data: SendableRecordBatchStream,
        _context: &Arc<TaskContext>,
    ) -> DFResult<u64> {
        let mut affected = 0u64;
        while let Some(chunk) = data.next().await.transpose()? {
            self.schema
                .logically_equivalent_names_and_types(&chunk.schema())?;
            affected += self.provider.insert_chunk(&chunk).map_err(df_external)?;
        }
        Ok(affected)
    }
}

/// Extracts `column = constant` bindings from a filter expression.
///
/// Returns `None` unless the whole expression is a conjunction of such
/// equalities (either operand order, casts stripped).
fn extract_equality_bindings(expr: &Expr) -> Option<Vec<(String, String)>> {
    let mut bindings = Vec::new();
    if collect_equality_bindings(expr, &mut bindings) {
        Some(bindings)
    } else {
        None
    }
}

fn collect_equality_bindings(expr: &Expr, out: &mut Vec<(String, String)>) -> bool {
    match expr {
        Expr::BinaryExpr(binary) if binary.op == Operator::And => {
            collect_equality_bindings(binary.left.as_ref(), out)
                && collect_equality_bindings(binary.right.as_ref(), out)
        }
        Expr::BinaryExpr(binary) if binary.op == Operator::Eq => {
            let pair = match (
                extract_column_name(binary.left.as_ref()),
                extract_literal_text(binary.right.as_ref()),
            ) {
                (Some(column), Some(value)) => Some((column.to_string(), value)),
                _ => match (
                    extract_column_name(binary.right.as_ref()),
                    extract_literal_text(binary.left.as_ref()),
                ) {
                    (Some(column), Some(value)) => Some((column.to_string(), value)),
                    _ => None,
                },
            };
            match pair {
                Some(binding) => {
                    out.push(binding);
                    true
                }
                None => false,
            }
        }
        _ => false,
    }
}

fn extract_column_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Column(column) => Some(column.name.as_str()),
        Expr::Cast(cast) => extract_column_name(cast.expr.as_ref()),
        Expr::TryCast(cast) => extract_column_name(cast.expr.as_ref()),
        _ => None,
    }
}

fn extract_literal_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Literal(value, _) => scalar_to_text(value),
        Expr::Cast(cast) => extract_literal_text(cast.expr.as_ref()),
        Expr::TryCast(cast) => extract_literal_text(cast.expr.as_ref()),
        _ => None,
    }
}

/// Renders a constant the way its key bytes are written on insert.
fn scalar_to_text(value: &ScalarValue) -> Option<String> {
    match value {
        ScalarValue::Utf8(Some(text))
        | ScalarValue::LargeUtf8(Some(text))
        | ScalarValue::Utf8View(Some(text)) => Some(text.clone()),
        ScalarValue::Int8(Some(v)) => Some(v.to_string()),
        ScalarValue::Int16(Some(v)) => Some(v.to_string()),
        ScalarValue::Int32(Some(v)) => Some(v.to_string()),
        ScalarValue::Int64(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt8(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt16(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt32(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt64(Some(v)) => Some(v.to_string()),
        ScalarValue::Boolean(Some(v)) => Some(v.to_string()),
        _ => None,
    }
}
