//! Query futures whose result is a list of tuples
//!
//! Each slot is the answer of one replica of one region. The simple
//! iterator waits for all slots, pulls the remaining pages of paged slots,
//! resolves versions per key and repairs replicas that missed a tuple they
//! are responsible for. The threaded iterator streams paged results
//! instead of collecting them.

use super::duplicate_tracker::EntityDuplicateTracker;
use super::network_future::NetworkOperationFuture;
use super::operation_future::{OperationFuture, RetryPolicy};
use super::threaded_iterator::ThreadedResultIterator;
use crate::error::FutureError;
use crate::network::package::Request;
use crate::network::Response;
use crate::storage::lsm::DuplicateResolver;
use crate::types::{Hyperrectangle, Tuple, TupleStoreName};
use ahash::AHashSet;
use std::sync::Arc;
use std::time::Duration;

/// Store and space a result slot is responsible for
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTarget {
    pub table: TupleStoreName,
    pub bbox: Hyperrectangle,
}

pub struct TupleListFuture {
    operation: OperationFuture,
    targets: Vec<QueryTarget>,
    resolver: Arc<dyn DuplicateResolver>,
    timeout: Duration,
}

impl TupleListFuture {
    pub fn new(
        slots: Vec<(Arc<NetworkOperationFuture>, QueryTarget)>,
        resolver: Arc<dyn DuplicateResolver>,
        timeout: Duration,
    ) -> Self {
        let (futures, targets) = slots.into_iter().unzip();
        Self {
            operation: OperationFuture::new(futures, RetryPolicy::AllFutures),
            targets,
            resolver,
            timeout,
        }
    }

    pub fn execute(&self) {
        self.operation.execute();
    }

    pub fn operation(&self) -> &OperationFuture {
        &self.operation
    }

    pub fn is_done(&self) -> bool {
        self.operation.is_done()
    }

    pub fn is_failed(&self) -> bool {
        self.operation.is_failed()
    }

    pub fn get_all_messages(&self) -> String {
        self.operation.get_all_messages()
    }

    pub fn wait_for_all(&self) -> Result<(), FutureError> {
        self.operation.wait_for_all(self.timeout)
    }

    /// Tuples of the first page of `slot`
    pub fn tuples(&self, slot: usize) -> Result<Vec<Tuple>, FutureError> {
        match self.operation.get(slot, self.timeout)? {
            Response::Tuples { tuples, .. } => Ok(tuples),
            other => Err(FutureError::Failed(format!("unexpected response {:?}", other))),
        }
    }

    /// Whether `slot` delivered its whole result in the first page
    pub fn is_complete_result(&self, slot: usize) -> bool {
        matches!(
            self.operation.futures().get(slot).and_then(|f| f.response()),
            Some(Response::Tuples { complete: true, .. })
        )
    }

    /// Stream all pages of all slots
    pub fn threaded_iterator(&self) -> crate::Result<ThreadedResultIterator> {
        ThreadedResultIterator::new(self.operation.futures(), self.timeout)
    }

    /// Wait for every slot and return the resolved, repaired result
    pub fn simple_iterator(&self) -> Result<std::vec::IntoIter<Tuple>, FutureError> {
        self.wait_for_all()?;
        if self.is_failed() {
            return Err(FutureError::Failed(self.get_all_messages()));
        }

        let mut per_slot = Vec::with_capacity(self.targets.len());
        for slot in 0..self.targets.len() {
            per_slot.push(self.all_pages(slot)?);
        }

        let mut all: Vec<Tuple> = per_slot.iter().flatten().cloned().collect();
        all.sort_by(|a, b| a.storage_order(b));

        let mut resolved = Vec::with_capacity(all.len());
        let mut group: Vec<Tuple> = Vec::new();
        for tuple in all {
            if group.first().is_some_and(|g| g.key() != tuple.key()) {
                self.resolver.resolve(&mut group);
                resolved.append(&mut group);
            }
            group.push(tuple);
        }
        self.resolver.resolve(&mut group);
        resolved.append(&mut group);

        self.read_repair(&resolved, &per_slot);

        let mut tracker = EntityDuplicateTracker::new();
        resolved.retain(|t| !tracker.is_already_seen(t));
        Ok(resolved.into_iter())
    }

    /// Tuples of every page of `slot`, fetching the pages after the first
    fn all_pages(&self, slot: usize) -> Result<Vec<Tuple>, FutureError> {
        let future = &self.operation.futures()[slot];
        let (mut tuples, mut complete) = match self.operation.get(slot, self.timeout)? {
            Response::Tuples { tuples, complete } => (tuples, complete),
            other => return Err(FutureError::Failed(format!("unexpected response {:?}", other))),
        };

        let mut pages = 1;
        while !complete {
            let query = future
                .sequence()
                .ok_or_else(|| FutureError::Failed(format!("slot {} is paged but has no query id", slot)))?;
            let page = NetworkOperationFuture::new(future.connection().clone(), move || Request::NextPage { query });
            page.execute();
            match page.get(self.timeout)? {
                Response::Tuples { tuples: more, complete: last } => {
                    tuples.extend(more);
                    complete = last;
                }
                other => return Err(FutureError::Failed(format!("unexpected response {:?}", other))),
            }
            pages += 1;
        }

        if pages > 1 {
            tracing::debug!(slot, pages, tuples = tuples.len(), "paged slot collected");
        }
        Ok(tuples)
    }

    /// Re-insert tuples into responsible replicas that did not return them
    ///
    /// The inserts are not awaited; a failed repair is logged and the next
    /// read tries again.
    fn read_repair(&self, resolved: &[Tuple], per_slot: &[Vec<Tuple>]) -> usize {
        let returned: Vec<AHashSet<(&str, i64)>> = per_slot
            .iter()
            .map(|tuples| tuples.iter().map(|t| (t.key(), t.version())).collect())
            .collect();

        let mut repairs = 0;
        for tuple in resolved {
            for (slot, target) in self.targets.iter().enumerate() {
                if !target.bbox.intersects(tuple.bounding_box()) {
                    continue;
                }
                if returned[slot].contains(&(tuple.key(), tuple.version())) {
                    continue;
                }

                let connection = self.operation.futures()[slot].connection().clone();
                let table = target.table.clone();
                let missing = tuple.clone();
                let key = missing.key().to_string();
                let repair = NetworkOperationFuture::new(connection, move || Request::InsertTuple {
                    table: table.clone(),
                    tuple: missing.clone(),
                });
                repair.on_done(move |f| {
                    if f.is_failed() {
                        tracing::warn!(
                            key = %key,
                            connection = f.connection().name(),
                            message = ?f.message(),
                            "read repair failed"
                        );
                    }
                });
                repair.execute();
                repairs += 1;
            }
        }

        if repairs > 0 {
            tracing::debug!(repairs, "read repair sent");
        }
        repairs
    }
}
