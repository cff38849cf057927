//! Client side of a connection to a storage node

use super::package::{Request, ResponsePackage, SequenceId};
use super::Response;
use crate::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Receives the outcome of one request
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, response: Response);

    /// The request never reached the server or the connection broke
    fn on_failure(&self, message: String);
}

/// Transport to one storage node
pub trait ClientConnection: Send + Sync {
    /// Human readable peer name, used in error messages
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Send `request`; `listener` is completed once the response arrives
    fn send_request(
        &self,
        request: Request,
        compress_response: bool,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<SequenceId>;

    /// Close the connection and fail every pending request
    fn close(&self);
}

/// Requests waiting for a response, by sequence id
#[derive(Default)]
pub struct PendingCalls {
    next_sequence: AtomicU16,
    pending: DashMap<SequenceId, Arc<dyn ResponseListener>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under a fresh sequence id
    pub fn register(&self, listener: Arc<dyn ResponseListener>) -> SequenceId {
        loop {
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            // ids wrap around; skip ids still in flight
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.pending.entry(sequence) {
                slot.insert(listener);
                return sequence;
            }
        }
    }

    pub fn complete(&self, package: ResponsePackage) {
        match self.pending.remove(&package.sequence) {
            Some((_, listener)) => listener.on_response(package.body),
            None => tracing::warn!(sequence = package.sequence, "response for unknown request"),
        }
    }

    pub fn fail(&self, sequence: SequenceId, message: &str) {
        if let Some((_, listener)) = self.pending.remove(&sequence) {
            listener.on_failure(message.to_string());
        }
    }

    pub fn fail_all(&self, message: &str) {
        let sequences: Vec<SequenceId> = self.pending.iter().map(|e| *e.key()).collect();
        for sequence in sequences {
            self.fail(sequence, message);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ResponseListener for Recorder {
        fn on_response(&self, response: Response) {
            self.events.lock().push(format!("{:?}", response));
        }

        fn on_failure(&self, message: String) {
            self.events.lock().push(message);
        }
    }

    #[test]
    fn test_pending_calls_route_by_sequence() {
        let calls = PendingCalls::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let s1 = calls.register(first.clone());
        let s2 = calls.register(second.clone());
        assert_ne!(s1, s2);

        calls.complete(ResponsePackage::new(s2, Response::Success));
        assert_eq!(*second.events.lock(), vec!["Success".to_string()]);
        assert!(first.events.lock().is_empty());

        calls.fail_all("connection reset");
        assert_eq!(*first.events.lock(), vec!["connection reset".to_string()]);
        assert!(calls.is_empty());

        // late responses are dropped
        calls.complete(ResponsePackage::new(s1, Response::Success));
        assert_eq!(first.events.lock().len(), 1);
    }
}
