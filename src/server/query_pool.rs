//! Bounded worker pool for the queries of one connection
//!
//! A fixed number of workers take jobs from a bounded queue. Jobs beyond the
//! queue capacity are rejected, never queued unbounded.

use crate::{Result, StorageError};
use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct QueryPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicUsize>,
}

impl QueryPool {
    pub fn new(name: &str, threads: usize, queue_capacity: usize) -> Result<Self> {
        if threads == 0 {
            return Err(StorageError::InvalidArgument("query pool needs at least one thread".into()));
        }

        let (sender, receiver) = channel::bounded::<Job>(queue_capacity);
        let running = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads {
            let receiver = receiver.clone();
            let running = running.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-query-{}", name, i))
                .spawn(move || {
                    for job in receiver.iter() {
                        running.fetch_add(1, Ordering::SeqCst);
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!("query job panicked");
                        }
                        running.fetch_sub(1, Ordering::SeqCst);
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            running,
        })
    }

    /// Queue `job`, failing with `ResourceExhausted` when the queue is full
    pub fn try_submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(StorageError::Shutdown);
        };

        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(StorageError::ResourceExhausted(format!(
                "{} queries running, queue of {} is full",
                self.running.load(Ordering::SeqCst),
                sender.capacity().unwrap_or(0)
            ))),
            Err(TrySendError::Disconnected(_)) => Err(StorageError::Shutdown),
        }
    }

    /// Jobs currently executing
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Reject new jobs, finish the queued ones and join the workers
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current && worker.join().is_err() {
                tracing::error!("query worker panicked");
            }
        }
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_overflow_is_rejected() {
        let pool = QueryPool::new("test", 1, 1).unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        pool.try_submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.running(), 1);

        // one job waits in the queue, the next one is rejected
        pool.try_submit(|| {}).unwrap();
        assert!(matches!(pool.try_submit(|| {}), Err(StorageError::ResourceExhausted(_))));

        release_tx.send(()).unwrap();
        pool.shutdown();
        assert!(matches!(pool.try_submit(|| {}), Err(StorageError::Shutdown)));
    }

    #[test]
    fn test_queued_jobs_finish_on_shutdown() {
        let pool = QueryPool::new("test", 2, 16).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = done.clone();
            pool.try_submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = QueryPool::new("test", 1, 4).unwrap();
        pool.try_submit(|| panic!("boom")).unwrap();
        let (tx, rx) = bounded(1);
        pool.try_submit(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
