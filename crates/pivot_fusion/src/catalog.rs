//! Catalog and schema providers for attached level-pivot databases.
//!
//! Each attached database exposes a single schema (`main`). Tables are
//! created and dropped through the `level_pivot_*` utility functions, never
//! through SQL DDL, because the identity/attribute column split is derived
//! from the key pattern.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use datafusion::arrow::datatypes::DataType;
use datafusion::catalog::{CatalogProvider, SchemaProvider, TableProvider};
use datafusion::common::{not_impl_err, Result as DFResult};
use tracing::debug;

use crate::error::{PivotError, PivotResult};
use crate::provider::PivotTableProvider;
use crate::table::PivotTableEntry;
use crate::transaction::{PivotTransactionManager, TableMap};
use pivot_store::{StoreConnection, StoreOptions};

/// Catalog type tag reported for attached databases.
pub const CATALOG_TYPE: &str = "level_pivot";
/// Name of the single schema every attached database exposes.
pub const MAIN_SCHEMA: &str = "main";

/// Options accepted by `ATTACH` for a level-pivot database.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub read_only: bool,
    pub create_if_missing: bool,
    pub block_cache_size: u64,
    pub write_buffer_size: u32,
}

impl Default for AttachOptions {
    fn default() -> Self {
        let defaults = StoreOptions::new("");
        Self {
            read_only: defaults.read_only,
            create_if_missing: defaults.create_if_missing,
            block_cache_size: defaults.block_cache_size,
            write_buffer_size: defaults.write_buffer_size,
        }
    }
}

impl AttachOptions {
    /// Parses `key = value` attach options; keys are case-insensitive.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> PivotResult<Self> {
        let mut options = Self::default();
        for (key, value) in pairs {
            match key.to_ascii_lowercase().as_str() {
                "read_only" => options.read_only = parse_bool(key, value)?,
                "create_if_missing" => options.create_if_missing = parse_bool(key, value)?,
                "block_cache_size" => {
                    options.block_cache_size = value.parse().map_err(|_| {
                        PivotError::invalid_input(format!(
                            "attach option '{key}' expects a byte count, got '{value}'"
                        ))
                    })?;
                }
                "write_buffer_size" => {
                    options.write_buffer_size = value.parse().map_err(|_| {
                        PivotError::invalid_input(format!(
                            "attach option '{key}' expects a byte count, got '{value}'"
                        ))
                    })?;
                }
                other => {
                    return Err(PivotError::invalid_input(format!(
                        "unknown attach option '{other}'"
                    )));
                }
            }
        }
        Ok(options)
    }

    fn store_options(&self, path: &Path) -> StoreOptions {
        let mut store = StoreOptions::new(path);
        store.read_only = self.read_only;
        store.create_if_missing = self.create_if_missing;
        store.block_cache_size = self.block_cache_size;
        store.write_buffer_size = self.write_buffer_size;
        store
    }
}

fn parse_bool(key: &str, value: &str) -> PivotResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(PivotError::invalid_input(format!(
            "attach option '{key}' expects a boolean, got '{other}'"
        ))),
    }
}

/// One attached level-pivot database.
///
/// Owns the table map and the transaction manager; holds a counted handle to
/// the store connection shared with every table entry and in-flight operator.
pub struct PivotCatalog {
    connection: Arc<StoreConnection>,
    schema: Arc<PivotSchema>,
    transactions: Arc<PivotTransactionManager>,
}

impl PivotCatalog {
    /// Opens the store and wraps it in a catalog.
    pub fn open(path: &Path, options: &AttachOptions) -> PivotResult<Arc<Self>> {
        let connection = StoreConnection::open(&options.store_options(path))?;
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: Arc<StoreConnection>) -> Arc<Self> {
        let transactions = Arc::new(PivotTransactionManager::new());
        let schema = Arc::new(PivotSchema {
            tables: Arc::new(RwLock::new(TableMap::new())),
            transactions: Arc::clone(&transactions),
        });
        Arc::new(Self {
            connection,
            schema,
            transactions,
        })
    }

    pub fn catalog_type(&self) -> &'static str {
        CATALOG_TYPE
    }

    pub fn db_path(&self) -> &Path {
        self.connection.path()
    }

    pub fn connection(&self) -> &Arc<StoreConnection> {
        &self.connection
    }

    pub fn transactions(&self) -> &Arc<PivotTransactionManager> {
        &self.transactions
    }

    pub fn main_schema(&self) -> &Arc<PivotSchema> {
        &self.schema
    }

    /// Creates a pivot-mode table over this catalog's store.
    pub fn create_pivot_table(
        &self,
        table_name: &str,
        pattern: &str,
        column_names: &[String],
        column_types: &[DataType],
        column_json: &[bool],
    ) -> PivotResult<()> {
        let entry = PivotTableEntry::new_pivot(
            table_name,
            Arc::clone(&self.connection),
            pattern,
            column_names,
            column_types,
            column_json,
        )?;
        self.schema.add_table(Arc::new(entry))
    }

    /// Creates a raw-mode `(key, value)` table over this catalog's store.
    pub fn create_raw_table(
        &self,
        table_name: &str,
        column_names: &[String],
        column_types: &[DataType],
        column_json: &[bool],
    ) -> PivotResult<()> {
        let entry = PivotTableEntry::new_raw(
            table_name,
            Arc::clone(&self.connection),
            column_names,
            column_types,
            column_json,
        )?;
        self.schema.add_table(Arc::new(entry))
    }

    /// Drops a table by name.
    pub fn drop_table(&self, table_name: &str) -> PivotResult<()> {
        self.schema.remove_table(table_name)
    }
}

impl std::fmt::Debug for PivotCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PivotCatalog")
            .field("path", &self.connection.path())
            .finish()
    }
}

impl CatalogProvider for PivotCatalog {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema_names(&self) -> Vec<String> {
        vec![MAIN_SCHEMA.to_string()]
    }

    fn schema(&self, name: &str) -> Option<Arc<dyn SchemaProvider>> {
        if name == MAIN_SCHEMA || name == CATALOG_TYPE {
            Some(Arc::clone(&self.schema) as Arc<dyn SchemaProvider>)
        } else {
            None
        }
    }

    fn register_schema(
        &self,
        _name: &str,
        _schema: Arc<dyn SchemaProvider>,
    ) -> DFResult<Option<Arc<dyn SchemaProvider>>> {
        not_impl_err!("cannot create schemas in a level_pivot database")
    }

    fn deregister_schema(
        &self,
        _name: &str,
        _cascade: bool,
    ) -> DFResult<Option<Arc<dyn SchemaProvider>>> {
        not_impl_err!("cannot drop schemas in a level_pivot database")
    }
}

/// The single schema of an attached database.
pub struct PivotSchema {
    tables: Arc<RwLock<TableMap>>,
    transactions: Arc<PivotTransactionManager>,
}

impl PivotSchema {
    /// Shared table map; write operators classify keys against it.
    pub fn tables(&self) -> &Arc<RwLock<TableMap>> {
        &self.tables
    }

    pub fn table_entry(&self, name: &str) -> Option<Arc<PivotTableEntry>> {
        self.tables
            .read()
            .expect("table map lock poisoned")
            .get(name)
            .cloned()
    }

    /// Snapshot of the current table map.
    pub fn table_map(&self) -> TableMap {
        self.tables.read().expect("table map lock poisoned").clone()
    }

    fn add_table(&self, entry: Arc<PivotTableEntry>) -> PivotResult<()> {
        let mut tables = self.tables.write().expect("table map lock poisoned");
        let name = entry.name().to_string();
        if tables.contains_key(&name) {
            return Err(PivotError::invalid_input(format!(
                "table '{name}' already exists"
            )));
        }
        debug!(table = name.as_str(), mode = entry.mode().as_str(), "table created");
        tables.insert(name, entry);
        Ok(())
    }

    fn remove_table(&self, name: &str) -> PivotResult<()> {
        let mut tables = self.tables.write().expect("table map lock poisoned");
        if tables.remove(name).is_none() {
            return Err(PivotError::invalid_input(format!(
                "table '{name}' does not exist"
            )));
        }
        debug!(table = name, "table dropped");
        Ok(())
    }

    fn provider_for(&self, entry: Arc<PivotTableEntry>) -> Arc<dyn TableProvider> {
        Arc::new(PivotTableProvider::new(
            entry,
            Arc::clone(&self.tables),
            Arc::clone(&self.transactions),
        ))
    }
}

impl std::fmt::Debug for PivotSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().expect("table map lock poisoned");
        f.debug_struct("PivotSchema")
            .field("tables", &tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl SchemaProvider for PivotSchema {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn table_names(&self) -> Vec<String> {
        self.tables
            .read()
            .expect("table map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    async fn table(&self, name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        Ok(self.table_entry(name).map(|entry| self.provider_for(entry)))
    }

    fn register_table(
        &self,
        _name: String,
        _table: Arc<dyn TableProvider>,
    ) -> DFResult<Option<Arc<dyn TableProvider>>> {
        not_impl_err!("use level_pivot_create_table() to create tables in a level_pivot database")
    }

    fn deregister_table(&self, _name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        not_impl_err!("use level_pivot_drop_table() to drop tables in a level_pivot database")
    }

    fn table_exist(&self, name: &str) -> bool {
        self.tables
            .read()
            .expect("table map lock poisoned")
            .contains_key(name)
    }
}

/// Process-wide registry of attached databases.
///
/// The dirty-table listing walks it; the utility functions resolve catalog
/// names through it.
#[derive(Clone, Default)]
pub struct AttachedDatabases {
    inner: Arc<RwLock<BTreeMap<String, Arc<PivotCatalog>>>>,
}

impl AttachedDatabases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, catalog: Arc<PivotCatalog>) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), catalog);
    }

    pub fn deregister(&self, name: &str) -> Option<Arc<PivotCatalog>> {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PivotCatalog>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Name-ordered snapshot of all attached databases.
    pub fn snapshot(&self) -> Vec<(String, Arc<PivotCatalog>)> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(name, catalog)| (name.clone(), Arc::clone(catalog)))
            .collect()
    }
}

impl std::fmt::Debug for AttachedDatabases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("registry lock poisoned");
        f.debug_struct("AttachedDatabases")
            .field("databases", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}
