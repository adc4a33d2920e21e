//! Ordered key-value store with per-block write buffering
//!
//! The committed state is an immutable sorted map shared through an `Arc`.
//! A block works on a `BlockStore`: writes are buffered in an overlay, reads
//! see the block's own writes on top of the committed state, and nothing is
//! visible to others until `StateDb::commit`. Queries read a `Snapshot`, which
//! is unaffected by in-flight block writes.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, StakingError};
use crate::keys::prefix_end;

/// Key/value pair returned by range scans
pub type KvPair = (Vec<u8>, Vec<u8>);

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Scan direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Smallest key first
    Ascending,
    /// Largest key first
    Descending,
}

/// Read access to an ordered store
pub trait KvRead {
    /// Get a value
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Scan `[start, end)` in the given order; `None` means unbounded above
    fn range(&self, start: &[u8], end: Option<&[u8]>, order: Order) -> Vec<KvPair>;

    /// Whether a key is present
    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Scan every key starting with `prefix`
    fn prefix_scan(&self, prefix: &[u8], order: Order) -> Vec<KvPair> {
        let end = prefix_end(prefix);
        self.range(prefix, end.as_deref(), order)
    }
}

/// Write access to an ordered store
pub trait KvStore: KvRead {
    /// Set a value
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Delete a value
    fn delete(&mut self, key: &[u8]);
}

fn bounds<'a>(start: &'a [u8], end: Option<&'a [u8]>) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
    let upper = match end {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    (Bound::Included(start), upper)
}

fn scan_map(map: &Map, start: &[u8], end: Option<&[u8]>, order: Order) -> Vec<KvPair> {
    if let Some(end) = end {
        if end <= start {
            return Vec::new();
        }
    }
    let iter = map
        .range::<[u8], _>(bounds(start, end))
        .map(|(k, v)| (k.clone(), v.clone()));
    match order {
        Order::Ascending => iter.collect(),
        Order::Descending => iter.rev().collect(),
    }
}

/// Plain in-memory store, used directly in tests and tooling
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    map: Map,
}

impl MemStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KvRead for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn range(&self, start: &[u8], end: Option<&[u8]>, order: Order) -> Vec<KvPair> {
        scan_map(&self.map, start, end, order)
    }
}

impl KvStore for MemStore {
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.map.insert(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.map.remove(key);
    }
}

/// Read-only view of a committed version
#[derive(Debug, Clone)]
pub struct Snapshot {
    map: Arc<Map>,
    version: u64,
}

impl Snapshot {
    /// Committed version this snapshot reflects
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl KvRead for Snapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn range(&self, start: &[u8], end: Option<&[u8]>, order: Order) -> Vec<KvPair> {
        scan_map(&self.map, start, end, order)
    }
}

/// Write buffer of one block on top of a committed snapshot
#[derive(Debug, Clone)]
pub struct BlockStore {
    base: Snapshot,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl BlockStore {
    /// Start an empty overlay on top of `base`
    pub fn new(base: Snapshot) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    /// Number of buffered writes (sets and deletes)
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Version of the committed state this block builds on
    pub fn base_version(&self) -> u64 {
        self.base.version
    }
}

impl KvRead for BlockStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(value) => value.clone(),
            None => self.base.get(key),
        }
    }

    fn range(&self, start: &[u8], end: Option<&[u8]>, order: Order) -> Vec<KvPair> {
        if let Some(end) = end {
            if end <= start {
                return Vec::new();
            }
        }
        let mut merged: Map = self
            .base
            .map
            .range::<[u8], _>(bounds(start, end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in self.writes.range::<[u8], _>(bounds(start, end)) {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        match order {
            Order::Ascending => merged.into_iter().collect(),
            Order::Descending => merged.into_iter().rev().collect(),
        }
    }
}

impl KvStore for BlockStore {
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }
}

struct Committed {
    map: Arc<Map>,
    version: u64,
}

/// Committed chain state with snapshot isolation for readers
///
/// There is a single logical writer (block processing); the lock only guards
/// publication of a new version.
pub struct StateDb {
    committed: RwLock<Committed>,
}

impl StateDb {
    /// Create an empty database at version 0
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(Committed {
                map: Arc::new(Map::new()),
                version: 0,
            }),
        }
    }

    /// Snapshot of the latest committed version
    pub fn snapshot(&self) -> Snapshot {
        let committed = self.committed.read();
        Snapshot {
            map: Arc::clone(&committed.map),
            version: committed.version,
        }
    }

    /// Latest committed version
    pub fn version(&self) -> u64 {
        self.committed.read().version
    }

    /// Open a write buffer for the next block
    pub fn begin(&self) -> BlockStore {
        BlockStore::new(self.snapshot())
    }

    /// Apply a block's buffered writes atomically and publish a new version
    ///
    /// Fails without applying anything if another block committed since
    /// `store` was opened.
    pub fn commit(&self, store: BlockStore, height: u64) -> Result<u64> {
        let mut committed = self.committed.write();
        if store.base.version != committed.version {
            return Err(StakingError::StaleCommit {
                height,
                base: store.base.version,
                current: committed.version,
            });
        }

        let write_count = store.writes.len();
        // The base snapshot must be released before make_mut, otherwise the
        // map is always cloned.
        let BlockStore { base, writes } = store;
        drop(base);

        let map = Arc::make_mut(&mut committed.map);
        for (key, value) in writes {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        committed.version += 1;

        debug!("Applied {} writes for block {}", write_count, height);
        info!(
            "Committed block {} as state version {}",
            height, committed.version
        );
        Ok(committed.version)
    }
}

impl Default for StateDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_store_range() {
        let mut store = MemStore::new();
        store.set(b"a/1".to_vec(), vec![1]);
        store.set(b"a/2".to_vec(), vec![2]);
        store.set(b"b/1".to_vec(), vec![3]);

        let asc = store.prefix_scan(b"a/", Order::Ascending);
        assert_eq!(asc.len(), 2);
        assert_eq!(asc[0].1, vec![1]);

        let desc = store.prefix_scan(b"a/", Order::Descending);
        assert_eq!(desc[0].1, vec![2]);
    }

    #[test]
    fn test_block_store_reads_own_writes() {
        let db = StateDb::new();
        let mut block = db.begin();
        block.set(b"k".to_vec(), vec![1]);
        assert_eq!(block.get(b"k"), Some(vec![1]));

        // Not visible before commit
        assert_eq!(db.snapshot().get(b"k"), None);

        db.commit(block, 1).unwrap();
        assert_eq!(db.snapshot().get(b"k"), Some(vec![1]));
    }

    #[test]
    fn test_block_store_merged_range() {
        let db = StateDb::new();
        let mut block = db.begin();
        block.set(b"p/1".to_vec(), vec![1]);
        block.set(b"p/3".to_vec(), vec![3]);
        db.commit(block, 1).unwrap();

        let mut block = db.begin();
        block.delete(b"p/1");
        block.set(b"p/2".to_vec(), vec![2]);
        let keys: Vec<Vec<u8>> = block
            .prefix_scan(b"p/", Order::Ascending)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"p/2".to_vec(), b"p/3".to_vec()]);
    }

    #[test]
    fn test_snapshot_isolation() {
        let db = StateDb::new();
        let mut block = db.begin();
        block.set(b"k".to_vec(), vec![1]);
        db.commit(block, 1).unwrap();

        let snapshot = db.snapshot();
        let mut block = db.begin();
        block.set(b"k".to_vec(), vec![2]);
        db.commit(block, 2).unwrap();

        assert_eq!(snapshot.get(b"k"), Some(vec![1]));
        assert_eq!(snapshot.version(), 1);
        assert_eq!(db.snapshot().get(b"k"), Some(vec![2]));
    }

    #[test]
    fn test_stale_commit_rejected() {
        let db = StateDb::new();
        let first = db.begin();
        let second = db.begin();
        db.commit(first, 1).unwrap();
        assert!(db.commit(second, 1).is_err());
        assert_eq!(db.version(), 1);
    }

    #[test]
    fn test_dropped_block_discards_writes() {
        let db = StateDb::new();
        let mut block = db.begin();
        block.set(b"k".to_vec(), vec![1]);
        drop(block);
        assert_eq!(db.snapshot().get(b"k"), None);
    }
}
