//! Pivot tables over an ordered key-value store, served to DataFusion.
//!
//! An attached store (an LSM-tree keyspace) is exposed as SQL tables in two
//! modes. Pivot mode reconstructs logical rows from runs of keys that share
//! an identity prefix, decomposed through a user-supplied key pattern. Raw
//! mode is a transparent `(key, value)` view. Scans stream in fixed-size
//! chunks with projection and identity-prefix filter narrowing; writes turn
//! row chunks into atomic store batches and feed the dirty-table tracker.
//!
//! This crate is the composition layer: it wires the pattern compiler,
//! parsers, scan engines, write operators, and catalog surface onto a
//! DataFusion `SessionContext`.

use std::path::Path;
use std::sync::Arc;

use datafusion::catalog::CatalogProvider;
use datafusion::prelude::SessionContext;
use tracing::info;

pub mod catalog;
pub mod error;
pub mod functions;
pub mod mutation;
pub mod parser;
pub mod pattern;
pub mod provider;
pub mod scan;
mod simd;
pub mod table;
pub mod transaction;
pub mod values;

pub use catalog::{AttachOptions, AttachedDatabases, PivotCatalog, CATALOG_TYPE, MAIN_SCHEMA};
pub use error::{PivotError, PivotResult};
pub use functions::register_table_functions;
pub use parser::{KeyParser, ParsedKey, ParsedKeyView};
pub use pattern::{KeyPattern, Segment};
pub use provider::PivotTableProvider;
pub use scan::{PivotScanState, RawScanState, ROW_ID_COLUMN, VECTOR_SIZE};
pub use simd::implementation_name as simd_implementation_name;
pub use table::{PivotTableEntry, TableKind, TableMode};
pub use transaction::{PivotTransaction, PivotTransactionManager};

/// Opens a store and registers it as a catalog named `name`.
///
/// The catalog lands both in the session context (for SQL name resolution)
/// and in the process-wide registry (for the dirty-table listing and the
/// utility functions).
pub fn attach_database(
    ctx: &SessionContext,
    registry: &AttachedDatabases,
    name: &str,
    path: impl AsRef<Path>,
    options: AttachOptions,
) -> PivotResult<Arc<PivotCatalog>> {
    let catalog = PivotCatalog::open(path.as_ref(), &options)?;
    registry.register(name, Arc::clone(&catalog));
    ctx.register_catalog(name, Arc::clone(&catalog) as Arc<dyn CatalogProvider>);
    info!(
        database = name,
        path = %path.as_ref().display(),
        read_only = options.read_only,
        "attached level_pivot database"
    );
    Ok(catalog)
}

/// Removes a database from the registry and returns its catalog.
///
/// Dropping the returned handle (and any session references) closes the
/// store once in-flight scans and batches finish.
pub fn detach_database(
    registry: &AttachedDatabases,
    name: &str,
) -> PivotResult<Arc<PivotCatalog>> {
    registry.deregister(name).ok_or_else(|| {
        PivotError::invalid_input(format!("no attached level_pivot database named '{name}'"))
    })
}
