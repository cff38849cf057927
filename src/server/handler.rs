//! Server side of one client connection
//!
//! ## Request flow
//! 1. decode the request package; a frame that cannot be decoded closes
//!    the connection
//! 2. queries go to the bounded query pool; a full pool answers
//!    `TooManyQueries` at once
//! 3. all other requests are dispatched in the caller's thread
//! 4. responses are written at once, or batched for compression when the
//!    client asked for it
//!
//! Closing the connection releases all of its tuple locks.

use super::context::ServerContext;
use super::maintenance::MaintenanceThread;
use super::query::QueryRegistry;
use super::query_pool::QueryPool;
use crate::network::package::{ErrorCode, RequestPackage, ResponseFrame, ResponsePackage};
use crate::network::Response;
use crate::txn::OwnerId;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Query cursors untouched this long are dropped
pub const QUERY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Sink for the frames sent to the client
pub trait ResponseWriter: Send + Sync {
    fn write_frame(&self, frame: &ResponseFrame) -> Result<()>;

    fn close(&self);
}

pub struct ClientConnectionHandler {
    id: OwnerId,
    context: Arc<ServerContext>,
    writer: Arc<dyn ResponseWriter>,
    pool: QueryPool,
    queries: QueryRegistry,
    pending_compression: Mutex<Vec<ResponsePackage>>,
    maintenance: Mutex<Option<MaintenanceThread>>,
    open: AtomicBool,
}

impl ClientConnectionHandler {
    pub fn new(context: Arc<ServerContext>, writer: Arc<dyn ResponseWriter>) -> Result<Arc<Self>> {
        let id = context.next_connection_id();
        let config = context.config();
        let pool = QueryPool::new(
            &format!("conn-{}", id),
            config.max_queries_per_connection,
            config.query_queue_capacity,
        )?;
        let interval = config.maintenance_interval();

        let handler = Arc::new(Self {
            id,
            context,
            writer,
            pool,
            queries: QueryRegistry::new(),
            pending_compression: Mutex::new(Vec::new()),
            maintenance: Mutex::new(None),
            open: AtomicBool::new(true),
        });

        let maintenance = MaintenanceThread::start(Arc::downgrade(&handler), interval)?;
        *handler.maintenance.lock() = Some(maintenance);

        tracing::debug!(connection = id, "client connection opened");
        Ok(handler)
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn queries(&self) -> &QueryRegistry {
        &self.queries
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Handle one encoded request package
    ///
    /// An error means the frame was unreadable and the connection is closed.
    pub fn handle_bytes(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(StorageError::Shutdown);
        }

        match RequestPackage::from_bytes(bytes) {
            Ok(package) => {
                self.handle_package(package);
                Ok(())
            }
            Err(e) => {
                tracing::error!(connection = self.id, error = %e, "undecodable request, closing connection");
                self.close();
                Err(e)
            }
        }
    }

    pub fn handle_package(self: &Arc<Self>, package: RequestPackage) {
        let RequestPackage {
            sequence,
            compress_response,
            body,
        } = package;
        let kind = body.kind();

        if !kind.is_query() {
            let response = self.context.dispatch().dispatch(self, sequence, body);
            self.send_response(ResponsePackage::new(sequence, response), compress_response);
            return;
        }

        let handler = Arc::clone(self);
        let submitted = self.pool.try_submit(move || {
            let response = handler.context.dispatch().dispatch(&handler, sequence, body);
            handler.send_response(ResponsePackage::new(sequence, response), compress_response);
        });

        if let Err(e) = submitted {
            tracing::warn!(connection = self.id, sequence, error = %e, "query rejected");
            let code = match e {
                StorageError::ResourceExhausted(_) => ErrorCode::TooManyQueries,
                _ => ErrorCode::Generic,
            };
            self.send_response(
                ResponsePackage::new(sequence, Response::error(code, e.to_string())),
                compress_response,
            );
        }
    }

    fn send_response(&self, package: ResponsePackage, compress: bool) {
        if compress {
            self.pending_compression.lock().push(package);
            return;
        }
        if let Err(e) = self.writer.write_frame(&ResponseFrame::Single(package)) {
            tracing::warn!(connection = self.id, error = %e, "failed to write response");
        }
    }

    /// Write all responses waiting for compression as one frame
    pub fn flush_pending_compression(&self) -> usize {
        let packages = std::mem::take(&mut *self.pending_compression.lock());
        if packages.is_empty() {
            return 0;
        }

        let result = ResponseFrame::compress(&packages).and_then(|frame| self.writer.write_frame(&frame));
        if let Err(e) = result {
            tracing::warn!(connection = self.id, packages = packages.len(), error = %e, "failed to write compressed responses");
        }
        packages.len()
    }

    /// One maintenance round
    pub fn run_maintenance(&self) {
        self.flush_pending_compression();
        let expired = self.queries.expire_idle(QUERY_IDLE_TIMEOUT);
        if expired > 0 {
            tracing::debug!(connection = self.id, expired, "idle queries dropped");
        }
    }

    /// Stop all background work and release the locks of this connection
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(maintenance) = self.maintenance.lock().take() {
            maintenance.shutdown();
        }
        self.pool.shutdown();
        self.flush_pending_compression();
        self.queries.clear();

        let released = self.context.locks().release_all(self.id);
        self.writer.close();
        tracing::debug!(connection = self.id, released_locks = released, "client connection closed");
    }
}

impl Drop for ClientConnectionHandler {
    fn drop(&mut self) {
        self.close();
    }
}
