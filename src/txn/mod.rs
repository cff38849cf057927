//! Tuple locking

pub mod lock_manager;

pub use lock_manager::{LockEntry, LockKey, LockManager, LockManagerStats, OwnerId};
