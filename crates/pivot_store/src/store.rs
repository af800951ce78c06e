//! Connection, iterator, and write-batch wrappers around one fjall partition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fjall::{Config, Keyspace, KvPair, PartitionCreateOptions, PartitionHandle, Snapshot};
use tracing::{debug, warn};

/// Partition that holds all user-visible keys of one attached database.
const DATA_PARTITION: &str = "data";

/// Errors surfaced by the storage façade.
///
/// Engine-level failures carry the failing key (hex) or the operation name so
/// the host can report which access went wrong.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open store at '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("get failed for key '{key}': {source}")]
    Get {
        key: String,
        #[source]
        source: fjall::Error,
    },
    #[error("put failed for key '{key}': {source}")]
    Put {
        key: String,
        #[source]
        source: fjall::Error,
    },
    #[error("delete failed for key '{key}': {source}")]
    Delete {
        key: String,
        #[source]
        source: fjall::Error,
    },
    #[error("write batch commit failed: {0}")]
    Commit(#[source] fjall::Error),
    #[error("cannot write to read-only connection")]
    ReadOnly,
}

/// Renders a key for error messages; hex keeps binary keys printable.
fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(text) => text.to_string(),
        Err(_) => key.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

/// Options applied when opening a store connection.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub read_only: bool,
    pub create_if_missing: bool,
    /// Shared block/blob cache size in bytes.
    pub block_cache_size: u64,
    /// Memtable size in bytes before a flush is triggered.
    pub write_buffer_size: u32,
}

impl StoreOptions {
    /// Defaults matching the engine's modest embedded footprint.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            create_if_missing: false,
            block_cache_size: 8 * 1024 * 1024,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Shared handle to one opened store.
///
/// The connection is reference-counted by the catalog, each table entry, and
/// any in-flight scan or write. Reads may run concurrently on distinct
/// iterators; writes funnel through [`StoreBatch`] or the point mutators.
pub struct StoreConnection {
    keyspace: Keyspace,
    data: PartitionHandle,
    path: PathBuf,
    read_only: bool,
}

impl StoreConnection {
    /// Opens (or creates) the store at `options.path`.
    pub fn open(options: &StoreOptions) -> Result<Arc<Self>, StoreError> {
        if !options.create_if_missing && !options.path.exists() {
            return Err(StoreError::Open {
                path: options.path.display().to_string(),
                source: "store does not exist and create_if_missing is false".into(),
            });
        }

        let keyspace = Config::new(&options.path)
            .cache_size(options.block_cache_size)
            .open()
            .map_err(|err| StoreError::Open {
                path: options.path.display().to_string(),
                source: Box::new(err),
            })?;

        let partition_options =
            PartitionCreateOptions::default().max_memtable_size(options.write_buffer_size);
        let data = keyspace
            .open_partition(DATA_PARTITION, partition_options)
            .map_err(|err| StoreError::Open {
                path: options.path.display().to_string(),
                source: Box::new(err),
            })?;

        debug!(
            path = %options.path.display(),
            read_only = options.read_only,
            "opened pivot store"
        );

        Ok(Arc::new(Self {
            keyspace,
            data,
            path: options.path.clone(),
            read_only: options.read_only,
        }))
    }

    /// Filesystem path this connection was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_write_allowed(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Point lookup; `None` when the key is absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.data.get(key) {
            Ok(value) => Ok(value.map(|slice| slice.to_vec())),
            Err(err) => Err(StoreError::Get {
                key: display_key(key),
                source: err,
            }),
        }
    }

    /// Unbatched single-key write.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_write_allowed()?;
        self.data.insert(key, value).map_err(|err| StoreError::Put {
            key: display_key(key),
            source: err,
        })
    }

    /// Unbatched single-key delete.
    pub fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        self.check_write_allowed()?;
        self.data.remove(key).map_err(|err| StoreError::Delete {
            key: display_key(key),
            source: err,
        })
    }

    /// Forward cursor over a snapshot taken now.
    ///
    /// The snapshot stays consistent for the iterator's lifetime regardless of
    /// concurrent writes through this or other connections.
    pub fn iter(&self) -> StoreIterator {
        StoreIterator::new(self.data.snapshot())
    }

    /// Creates a buffered write batch; fails on read-only connections.
    pub fn batch(self: &Arc<Self>) -> Result<StoreBatch, StoreError> {
        self.check_write_allowed()?;
        Ok(StoreBatch {
            connection: Arc::clone(self),
            batch: Some(self.keyspace.batch()),
            pending: 0,
        })
    }
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConnection")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Forward-only cursor in byte order.
///
/// Mirrors the LevelDB iterator shape: position with [`seek`](Self::seek) or
/// [`seek_to_first`](Self::seek_to_first), then step with
/// [`next`](Self::next) while [`valid`](Self::valid) holds.
pub struct StoreIterator {
    snapshot: Snapshot,
    current: Option<KvPair>,
    inner: Option<Box<dyn DoubleEndedIterator<Item = fjall::Result<KvPair>> + Send>>,
}

impl StoreIterator {
    fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            current: None,
            inner: None,
        }
    }

    /// Positions at the first key >= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.inner = Some(Box::new(self.snapshot.range(key.to_vec()..)));
        self.advance();
    }

    /// Positions at the smallest key in the store.
    pub fn seek_to_first(&mut self) {
        self.inner = Some(Box::new(self.snapshot.iter()));
        self.advance();
    }

    /// Steps to the next key; a no-op once the cursor is exhausted.
    pub fn next(&mut self) {
        self.advance();
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Key bytes at the current position. Panics if `!valid()`.
    pub fn key(&self) -> &[u8] {
        let (key, _) = self.current.as_ref().expect("iterator is not valid");
        key
    }

    /// Value bytes at the current position. Panics if `!valid()`.
    pub fn value(&self) -> &[u8] {
        let (_, value) = self.current.as_ref().expect("iterator is not valid");
        value
    }

    fn advance(&mut self) {
        self.current = match self.inner.as_mut().and_then(|iter| iter.next()) {
            Some(Ok(pair)) => Some(pair),
            Some(Err(err)) => {
                // An engine read error ends the cursor rather than poisoning
                // the scan; the host sees a truncated (not corrupted) result.
                warn!(error = ?err, "store iterator read failed");
                None
            }
            None => None,
        };
    }
}

/// Buffered mutations applied atomically on [`commit`](Self::commit).
///
/// Dropping the batch without committing discards every pending operation.
/// Commit durability is buffered (no fsync); crash recovery falls to the
/// engine's own journal.
pub struct StoreBatch {
    connection: Arc<StoreConnection>,
    batch: Option<fjall::Batch>,
    pending: usize,
}

impl StoreBatch {
    /// Buffers a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        if let Some(batch) = self.batch.as_mut() {
            batch.insert(&self.connection.data, key, value);
            self.pending += 1;
        }
    }

    /// Buffers a delete.
    pub fn del(&mut self, key: &[u8]) {
        if let Some(batch) = self.batch.as_mut() {
            batch.remove(&self.connection.data, key);
            self.pending += 1;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    pub fn has_pending(&self) -> bool {
        self.pending > 0
    }

    /// Applies all buffered operations atomically. Empty batches are a no-op.
    pub fn commit(mut self) -> Result<(), StoreError> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };
        if !self.has_pending() {
            return Ok(());
        }
        batch.commit().map_err(StoreError::Commit)
    }

    /// Drops all buffered operations without writing.
    pub fn discard(mut self) {
        self.batch = None;
        self.pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    fn open_temp(read_only: bool) -> Result<(TempDir, Arc<StoreConnection>)> {
        let dir = TempDir::new()?;
        let mut options = StoreOptions::new(dir.path().join("db"));
        options.create_if_missing = true;
        let connection = StoreConnection::open(&options)?;
        drop(connection);
        let mut options = StoreOptions::new(dir.path().join("db"));
        options.read_only = read_only;
        let connection = StoreConnection::open(&options)?;
        Ok((dir, connection))
    }

    #[test]
    fn open_requires_existing_path_unless_created() {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions::new(dir.path().join("missing"));
        let err = StoreConnection::open(&options).unwrap_err();
        assert!(matches!(err, StoreError::Open { .. }));
    }

    #[test]
    fn get_put_del_round_trip() -> Result<()> {
        let (_dir, store) = open_temp(false)?;
        assert_eq!(store.get(b"k1")?, None);
        store.put(b"k1", b"v1")?;
        assert_eq!(store.get(b"k1")?.as_deref(), Some(b"v1".as_slice()));
        store.del(b"k1")?;
        assert_eq!(store.get(b"k1")?, None);
        Ok(())
    }

    #[test]
    fn iterator_walks_in_byte_order_from_seek() -> Result<()> {
        let (_dir, store) = open_temp(false)?;
        for key in ["a##1", "a##2", "b##1", "c##9"] {
            store.put(key.as_bytes(), b"v")?;
        }

        let mut iter = store.iter();
        iter.seek(b"b");
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(seen, vec![b"b##1".to_vec(), b"c##9".to_vec()]);
        Ok(())
    }

    #[test]
    fn iterator_snapshot_ignores_later_writes() -> Result<()> {
        let (_dir, store) = open_temp(false)?;
        store.put(b"k1", b"v1")?;

        let mut iter = store.iter();
        store.put(b"k2", b"v2")?;

        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn batch_commit_is_atomic_and_drop_discards() -> Result<()> {
        let (_dir, store) = open_temp(false)?;

        let mut batch = store.batch()?;
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        assert_eq!(batch.pending_count(), 2);
        drop(batch);
        assert_eq!(store.get(b"k1")?, None);

        let mut batch = store.batch()?;
        batch.put(b"k1", b"v1");
        batch.del(b"k2");
        batch.commit()?;
        assert_eq!(store.get(b"k1")?.as_deref(), Some(b"v1".as_slice()));

        // Empty commit is a no-op.
        store.batch()?.commit()?;
        Ok(())
    }

    #[test]
    fn read_only_rejects_mutations() -> Result<()> {
        let (_dir, store) = open_temp(true)?;
        assert!(matches!(
            store.put(b"k", b"v").unwrap_err(),
            StoreError::ReadOnly
        ));
        assert!(matches!(store.del(b"k").unwrap_err(), StoreError::ReadOnly));
        assert!(matches!(store.batch().unwrap_err(), StoreError::ReadOnly));
        Ok(())
    }
}
