//! GeoStore
//!
//! Distributed key-value store for tuples with multi-dimensional bounding
//! boxes.
//!
//! ## Architecture
//! - Storage: one LSM tuple store per table region (memtable + sorted runs),
//!   merged by a background compaction engine per storage directory
//! - Distribution: k-d tree of regions per distribution group, split and
//!   merged by size
//! - Server: per-connection request dispatch with a bounded query pool
//! - Client: futures that fan a logical operation out to all responsible
//!   nodes and reconcile their answers

pub mod client;
pub mod config;
pub mod distribution;
pub mod network;
pub mod server;
pub mod storage;
pub mod txn;
pub mod types;

mod error;

pub use client::GeoStoreClient;
pub use config::{StoreConfig, TupleStoreConfiguration};
pub use error::{FutureError, Result, StorageError};
pub use storage::{TupleStoreManager, TupleStoreManagerRegistry};
pub use types::{Hyperrectangle, Tuple, TupleStoreName};
