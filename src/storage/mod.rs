//! Storage layer
//!
//! One LSM tuple store per table (or table region), managed by the registry

pub mod lsm;
pub mod registry;

pub use lsm::{SortedRun, TupleStoreManager};
pub use registry::TupleStoreManagerRegistry;
