//! Per-database transaction state and dirty-table tracking.
//!
//! A transaction exists per attached database and client session. It provides
//! no isolation: writes are visible immediately. Its only state is the set of
//! table names whose observable contents could have changed, maintained by
//! classifying every written key against the currently attached tables.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::table::{PivotTableEntry, TableKind};

/// Name-keyed table map of one attached database.
pub type TableMap = BTreeMap<String, Arc<PivotTableEntry>>;

/// Dirty-table state of one active transaction.
#[derive(Debug, Default)]
pub struct PivotTransaction {
    dirty: BTreeSet<String>,
    all_dirty: bool,
}

impl PivotTransaction {
    /// Dirty table names in byte order.
    pub fn dirty_tables(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }

    /// Classifies one written key against every attached table.
    ///
    /// A raw table is affected by any write. A pivot table is affected when
    /// the key parses under its pattern; a non-empty literal prefix rejects
    /// most foreign keys before the parse. Tracking is best-effort: tables
    /// already dirty are skipped, and once every table is dirty the whole
    /// check short-circuits.
    pub fn check_key(&mut self, key: &[u8], tables: &TableMap) {
        if self.all_dirty || tables.is_empty() {
            return;
        }

        for (name, entry) in tables {
            if self.dirty.contains(name) {
                continue;
            }
            let affected = match entry.kind() {
                TableKind::Raw => true,
                TableKind::Pivot { parser, .. } => {
                    // The literal-prefix check rejects most foreign keys
                    // before paying for a parse.
                    parser.starts_with_prefix(key) && parser.matches(key)
                }
            };
            if affected {
                trace!(table = name.as_str(), "table marked dirty");
                self.dirty.insert(name.clone());
            }
        }

        if self.dirty.len() == tables.len() {
            self.all_dirty = true;
        }
    }
}

/// Owns the current transaction of one attached database.
///
/// The host starts a transaction on `BEGIN` or on the first statement and
/// releases it on commit or rollback; writes arriving with no transaction
/// open start one implicitly.
#[derive(Debug, Default)]
pub struct PivotTransactionManager {
    current: Mutex<Option<PivotTransaction>>,
}

impl PivotTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fresh transaction, replacing any current one.
    pub fn begin(&self) {
        let mut current = self.current.lock().expect("transaction lock poisoned");
        *current = Some(PivotTransaction::default());
    }

    /// Releases the current transaction. There is nothing to persist; the
    /// store was written through as statements executed.
    pub fn commit(&self) {
        let mut current = self.current.lock().expect("transaction lock poisoned");
        *current = None;
    }

    /// Releases the current transaction without any undo: no isolation is
    /// provided, so rolled-back writes stay visible.
    pub fn rollback(&self) {
        let mut current = self.current.lock().expect("transaction lock poisoned");
        *current = None;
    }

    pub fn is_active(&self) -> bool {
        self.current
            .lock()
            .expect("transaction lock poisoned")
            .is_some()
    }

    /// Runs `body` against the current transaction, starting one on demand.
    pub fn with_current<T>(&self, body: impl FnOnce(&mut PivotTransaction) -> T) -> T {
        let mut current = self.current.lock().expect("transaction lock poisoned");
        body(current.get_or_insert_with(PivotTransaction::default))
    }

    /// Dirty table names of the active transaction; empty when none is open.
    pub fn dirty_tables(&self) -> Vec<String> {
        let current = self.current.lock().expect("transaction lock poisoned");
        current
            .as_ref()
            .map(|txn| txn.dirty_tables())
            .unwrap_or_default()
    }
}
