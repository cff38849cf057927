//! Client futures
//!
//! - [`NetworkOperationFuture`]: one request on one connection
//! - [`OperationFuture`]: several requests forming one logical operation
//! - [`TupleListFuture`]: query results of several replicas and regions
//! - [`ThreadedResultIterator`]: streaming over paged query results

mod duplicate_tracker;
mod list_future;
mod network_future;
mod operation_future;
mod threaded_iterator;

pub use duplicate_tracker::EntityDuplicateTracker;
pub use list_future::{QueryTarget, TupleListFuture};
pub use network_future::NetworkOperationFuture;
pub use operation_future::{OperationFuture, RetryPolicy, TOTAL_RETRIES};
pub use threaded_iterator::{ThreadedResultIterator, QUEUE_CAPACITY};
