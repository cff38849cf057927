//! Storage node request handling
//!
//! ## Architecture
//! - **ServerContext**: registry, table catalog, lock table and dispatch
//!   table shared by all connections
//! - **ClientConnectionHandler**: one per client connection, with its own
//!   bounded query pool and maintenance thread
//! - **DispatchTable**: request kind to handler function, built once

mod context;
mod dispatch;
mod handler;
mod maintenance;
mod query;
mod query_pool;

pub use context::ServerContext;
pub use dispatch::{DispatchTable, DispatchTableBuilder, RequestHandler};
pub use handler::{ClientConnectionHandler, ResponseWriter, QUERY_IDLE_TIMEOUT};
pub use maintenance::MaintenanceThread;
pub use query::{PagedQuery, QueryRegistry};
pub use query_pool::QueryPool;
