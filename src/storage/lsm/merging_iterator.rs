//! K-way merge over sorted tuple streams
//!
//! A min-heap holds the head of every source. Each call to `next()` returns
//! all versions of the smallest key (newest first), so the caller can apply
//! a duplicate resolver per key. A version present in several sources (same
//! key and version) is returned once. The first read error ends the merge.

use crate::types::Tuple;
use crate::Result;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

pub type TupleSource = Box<dyn Iterator<Item = Result<Tuple>> + Send>;

struct HeapItem {
    tuple: Tuple,
    source_id: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // key asc, version desc, then the earlier source first
        self.tuple
            .storage_order(&other.tuple)
            .then(self.source_id.cmp(&other.source_id))
    }
}

pub struct MergingIterator {
    heap: BinaryHeap<Reverse<HeapItem>>,
    sources: Vec<TupleSource>,
    failed: bool,
}

impl MergingIterator {
    pub fn new(sources: Vec<TupleSource>) -> Result<Self> {
        let mut iter = Self {
            heap: BinaryHeap::new(),
            sources,
            failed: false,
        };
        for source_id in 0..iter.sources.len() {
            iter.refill_from_source(source_id)?;
        }
        Ok(iter)
    }

    fn refill_from_source(&mut self, source_id: usize) -> Result<()> {
        if let Some(source) = self.sources.get_mut(source_id) {
            if let Some(next) = source.next() {
                self.heap.push(Reverse(HeapItem {
                    tuple: next?,
                    source_id,
                }));
            }
        }
        Ok(())
    }

    fn next_group(&mut self) -> Result<Option<Vec<Tuple>>> {
        let Some(Reverse(first)) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill_from_source(first.source_id)?;

        let mut group = vec![first.tuple];
        loop {
            let same_key = match self.heap.peek() {
                Some(Reverse(item)) => item.tuple.key() == group[0].key(),
                None => false,
            };
            if !same_key {
                break;
            }

            if let Some(Reverse(item)) = self.heap.pop() {
                self.refill_from_source(item.source_id)?;
                let duplicate = group
                    .last()
                    .map(|last| last.version() == item.tuple.version())
                    .unwrap_or(false);
                if !duplicate {
                    group.push(item.tuple);
                }
            }
        }
        Ok(Some(group))
    }
}

impl Iterator for MergingIterator {
    type Item = Result<Vec<Tuple>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_group() {
            Ok(Some(group)) => Some(Ok(group)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
