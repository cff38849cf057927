//! Tuple-level optimistic locks
//!
//! A lock guards one key of one table for one client connection. Locking
//! never waits: a key that is already locked, or whose stored version is
//! newer than the version the client based its change on, fails at once and
//! the client retries the whole operation with fresh data.

use crate::{Result, StorageError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;

/// Identifies the connection holding a lock
pub type OwnerId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub table: String,
    pub key: String,
}

impl LockKey {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub owner: OwnerId,
    /// Request sequence number that took the lock
    pub sequence: u16,
    pub version: i64,
}

pub struct LockManager {
    locks: DashMap<LockKey, LockEntry>,
}

impl LockManager {
    pub fn new() -> Self {
        Self { locks: DashMap::new() }
    }

    /// Lock `table`/`key` for `owner`
    ///
    /// `newest_stored` is the newest version of the key in the local store.
    /// A lock request for an older version fails with
    /// [`StorageError::Outdated`] and leaves the lock table unchanged.
    pub fn lock_tuple(
        &self,
        owner: OwnerId,
        sequence: u16,
        table: &str,
        key: &str,
        version: i64,
        newest_stored: Option<i64>,
    ) -> Result<()> {
        if let Some(stored) = newest_stored {
            if stored > version {
                tracing::debug!(table, key, version, stored, "lock request for outdated version");
                return Err(StorageError::Outdated(format!(
                    "{}/{}: requested version {} but {} is stored",
                    table, key, version, stored
                )));
            }
        }

        match self.locks.entry(LockKey::new(table, key)) {
            Entry::Occupied(held) => Err(StorageError::Lock(format!(
                "{}/{} is locked by connection {} (sequence {})",
                table,
                key,
                held.get().owner,
                held.get().sequence
            ))),
            Entry::Vacant(slot) => {
                slot.insert(LockEntry {
                    owner,
                    sequence,
                    version,
                });
                Ok(())
            }
        }
    }

    pub fn is_locked(&self, table: &str, key: &str) -> bool {
        self.locks.contains_key(&LockKey::new(table, key))
    }

    pub fn lock_holder(&self, table: &str, key: &str) -> Option<LockEntry> {
        self.locks.get(&LockKey::new(table, key)).map(|e| e.value().clone())
    }

    /// Release one lock; only the owner can release it
    pub fn unlock_tuple(&self, owner: OwnerId, table: &str, key: &str) -> bool {
        self.locks
            .remove_if(&LockKey::new(table, key), |_, entry| entry.owner == owner)
            .is_some()
    }

    /// Release every lock of `owner`, e.g. when its connection closes
    pub fn release_all(&self, owner: OwnerId) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, entry| entry.owner != owner);
        let released = before.saturating_sub(self.locks.len());
        if released > 0 {
            tracing::debug!(owner, released, "released locks of connection");
        }
        released
    }

    /// Release the locks `owner` took with request `sequence`
    pub fn release_sequence(&self, owner: OwnerId, sequence: u16) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_, entry| !(entry.owner == owner && entry.sequence == sequence));
        before.saturating_sub(self.locks.len())
    }

    pub fn stats(&self) -> LockManagerStats {
        let owners: HashSet<OwnerId> = self.locks.iter().map(|e| e.value().owner).collect();
        LockManagerStats {
            total_locks: self.locks.len() as u64,
            owners: owners.len() as u64,
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockManagerStats {
    pub total_locks: u64,
    pub owners: u64,
}
