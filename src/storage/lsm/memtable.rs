//! Memtable: in-memory write buffer of one tuple store
//!
//! Tuples are kept sorted by (key asc, version desc) so a flush can stream
//! them straight into an SSTable. Writing the same key and version twice
//! replaces the first entry.

use crate::types::{Hyperrectangle, Tuple};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

type MemKey = (String, Reverse<i64>);

/// In-memory write buffer
pub struct Memtable {
    data: RwLock<BTreeMap<MemKey, Tuple>>,

    /// Current size in bytes
    size: AtomicUsize,

    max_entries: usize,
    max_bytes: usize,
}

impl Memtable {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            max_entries,
            max_bytes,
        }
    }

    /// Insert a tuple, O(log n)
    pub fn put(&self, tuple: Tuple) {
        let entry_size = tuple.size();
        let key = (tuple.key().to_string(), Reverse(tuple.version()));

        let mut data = self.data.write();
        if let Some(old) = data.insert(key, tuple) {
            self.size.fetch_sub(old.size(), Ordering::Relaxed);
        }
        self.size.fetch_add(entry_size, Ordering::Relaxed);
    }

    /// All versions of `key`, newest first
    pub fn get(&self, key: &str) -> Vec<Tuple> {
        let data = self.data.read();
        let start = (key.to_string(), Reverse(i64::MAX));
        let end = (key.to_string(), Reverse(i64::MIN));
        data.range((Bound::Included(start), Bound::Included(end)))
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// All versions whose box intersects `bbox`
    pub fn query_box(&self, bbox: &Hyperrectangle) -> Vec<Tuple> {
        self.data
            .read()
            .values()
            .filter(|t| t.bounding_box().intersects(bbox))
            .cloned()
            .collect()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_entries || self.size() >= self.max_bytes
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the content (for flushing)
    pub fn sorted_tuples(&self) -> Vec<Tuple> {
        self.data.read().values().cloned().collect()
    }
}
