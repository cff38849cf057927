//! Versioned records
//!
//! A `Tuple` is immutable once written. Tuples order by key ascending and,
//! for equal keys, by version descending (newest first).

use super::Hyperrectangle;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Record kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TupleKind {
    Normal,
    /// Tombstone: overrides older versions until purged
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tuple {
    key: String,
    bounding_box: Hyperrectangle,
    value: Vec<u8>,
    version: i64,
    kind: TupleKind,
}

/// Microseconds since the unix epoch
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

impl Tuple {
    /// New tuple versioned with the current time
    pub fn new(key: impl Into<String>, bounding_box: Hyperrectangle, value: impl Into<Vec<u8>>) -> Self {
        Self::with_version(key, bounding_box, value, now_micros())
    }

    pub fn with_version(
        key: impl Into<String>,
        bounding_box: Hyperrectangle,
        value: impl Into<Vec<u8>>,
        version: i64,
    ) -> Self {
        Self {
            key: key.into(),
            bounding_box,
            value: value.into(),
            version,
            kind: TupleKind::Normal,
        }
    }

    /// Deletion marker for `key`
    pub fn tombstone(key: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            bounding_box: Hyperrectangle::full_space(),
            value: Vec::new(),
            version,
            kind: TupleKind::Deleted,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bounding_box(&self) -> &Hyperrectangle {
        &self.bounding_box
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn kind(&self) -> TupleKind {
        self.kind
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == TupleKind::Deleted
    }

    /// Approximate in-memory footprint, used for write buffer accounting
    pub fn size(&self) -> usize {
        self.key.len() + self.bounding_box.encoded_len() + self.value.len() + 18
    }

    /// Storage order: key ascending, version descending
    pub fn storage_order(&self, other: &Tuple) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.version.cmp(&self.version))
    }
}
