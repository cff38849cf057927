//! Streaming iterator over several paged result slots
//!
//! One producer thread per slot pushes the tuples of its first page and of
//! every following page into a bounded queue. Each producer ends with a
//! `Done` marker, also when a page request fails, so the consumer knows
//! when all slots are exhausted. Tuples already returned are dropped.
//! Producers wait for pages in short slices so `close` does not have to sit
//! out a page timeout.

use super::duplicate_tracker::EntityDuplicateTracker;
use super::network_future::NetworkOperationFuture;
use crate::network::package::Request;
use crate::error::FutureError;
use crate::network::Response;
use crate::types::Tuple;
use crate::{Result, StorageError};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Capacity of the queue between producers and the consumer
pub const QUEUE_CAPACITY: usize = 25;

/// Longest wait of a producer before it looks at the close flag again
const CLOSE_CHECK_INTERVAL: Duration = Duration::from_millis(20);

enum QueueItem {
    Tuple(Tuple),
    Done,
}

/// Sends the `Done` marker when the producer ends, however it ends
struct DoneGuard {
    sender: Sender<QueueItem>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.sender.send(QueueItem::Done);
    }
}

struct Producer {
    slot: usize,
    future: Arc<NetworkOperationFuture>,
    timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl Producer {
    fn run(self, sender: Sender<QueueItem>) {
        let guard = DoneGuard { sender };

        let mut response = self.wait(&self.future);
        loop {
            let (tuples, complete) = match response {
                Ok(Response::Tuples { tuples, complete }) => (tuples, complete),
                Ok(other) => {
                    tracing::warn!(slot = self.slot, response = ?other, "unexpected response to query");
                    return;
                }
                Err(FutureError::Cancelled) => return,
                Err(e) => {
                    tracing::warn!(
                        slot = self.slot,
                        connection = self.future.connection().name(),
                        error = %e,
                        "result page failed, slot ends early"
                    );
                    return;
                }
            };

            for tuple in tuples {
                if guard.sender.send(QueueItem::Tuple(tuple)).is_err() {
                    return;
                }
            }

            if complete || self.closed.load(Ordering::Acquire) {
                return;
            }

            let Some(query) = self.future.sequence() else {
                tracing::warn!(slot = self.slot, "query without sequence id, cannot page");
                return;
            };
            let page = NetworkOperationFuture::new(self.future.connection().clone(), move || Request::NextPage {
                query,
            });
            page.execute();
            response = self.wait(&page);
        }
    }

    /// Response of `future`, or `Cancelled` as soon as the iterator is closed
    fn wait(&self, future: &NetworkOperationFuture) -> std::result::Result<Response, FutureError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(FutureError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match future.wait_for_completion(remaining.min(CLOSE_CHECK_INTERVAL)) {
                Ok(()) => return future.get(Duration::ZERO),
                Err(FutureError::Timeout(_)) if Instant::now() < deadline => {}
                Err(FutureError::Timeout(_)) => {
                    return Err(FutureError::Timeout(self.timeout.as_millis() as u64));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct ThreadedResultIterator {
    receiver: Option<Receiver<QueueItem>>,
    producers: usize,
    finished: usize,
    handles: Vec<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
    tracker: EntityDuplicateTracker,
    next: Option<Tuple>,
}

impl ThreadedResultIterator {
    /// Start one producer per executed query future
    pub fn new(futures: &[Arc<NetworkOperationFuture>], page_timeout: Duration) -> Result<Self> {
        let (sender, receiver) = channel::bounded(QUEUE_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let mut iterator = Self {
            receiver: Some(receiver),
            producers: futures.len(),
            finished: 0,
            handles: Vec::with_capacity(futures.len()),
            closed: closed.clone(),
            tracker: EntityDuplicateTracker::new(),
            next: None,
        };

        for (slot, future) in futures.iter().enumerate() {
            let producer = Producer {
                slot,
                future: future.clone(),
                timeout: page_timeout,
                closed: closed.clone(),
            };
            let sender = sender.clone();
            let spawned = thread::Builder::new()
                .name(format!("result-producer-{}", slot))
                .spawn(move || producer.run(sender));

            match spawned {
                Ok(handle) => iterator.handles.push(handle),
                Err(e) => {
                    // producers that never started count as finished
                    iterator.producers = iterator.handles.len();
                    iterator.close();
                    return Err(StorageError::Io(e));
                }
            }
        }
        Ok(iterator)
    }

    /// Wait for the next new tuple; false once every producer is done
    pub fn has_next(&mut self) -> bool {
        if self.next.is_some() {
            return true;
        }

        let Some(receiver) = self.receiver.as_ref() else {
            return false;
        };

        while self.finished < self.producers {
            match receiver.recv() {
                Ok(QueueItem::Tuple(tuple)) => {
                    if self.tracker.is_already_seen(&tuple) {
                        continue;
                    }
                    self.next = Some(tuple);
                    return true;
                }
                Ok(QueueItem::Done) => self.finished += 1,
                Err(_) => self.finished = self.producers,
            }
        }
        false
    }

    /// The tuple found by the last successful [`has_next`](Self::has_next)
    pub fn next_tuple(&mut self) -> Result<Tuple> {
        self.next
            .take()
            .ok_or_else(|| StorageError::IllegalState("next_tuple() called without has_next()".into()))
    }

    /// Stop the producers and wait for their threads
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        // blocked producers see a disconnected queue
        self.receiver = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("result producer panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_none()
    }
}

impl Iterator for ThreadedResultIterator {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        if self.has_next() {
            self.next.take()
        } else {
            None
        }
    }
}

impl Drop for ThreadedResultIterator {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            tracing::debug!("result iterator dropped without close");
        }
        self.close();
    }
}
