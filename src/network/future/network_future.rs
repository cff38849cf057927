//! Future for one request on one connection
//!
//! ## State
//! `Pending -> (result set | failed) -> done`. Every thread blocked in
//! [`NetworkOperationFuture::get`] wakes when the future is done. An error
//! response from the server marks the future failed; the response is kept
//! so the error code stays inspectable.
//!
//! A future can be executed again (retry). Responses that belong to an
//! older execution are ignored.

use crate::error::FutureError;
use crate::network::connection::{ClientConnection, ResponseListener};
use crate::network::package::{Request, SequenceId};
use crate::network::Response;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

type DoneCallback = Box<dyn FnOnce(&NetworkOperationFuture) + Send>;

#[derive(Default)]
struct FutureState {
    execution: u32,
    sequence: Option<SequenceId>,
    done: bool,
    failed: bool,
    cancelled: bool,
    response: Option<Response>,
    message: Option<String>,
    started: Option<Instant>,
    completed: Option<Instant>,
    callbacks: Vec<DoneCallback>,
}

pub struct NetworkOperationFuture {
    connection: Arc<dyn ClientConnection>,
    request: Box<dyn Fn() -> Request + Send + Sync>,
    compress_response: bool,
    state: Mutex<FutureState>,
    done: Condvar,
}

impl NetworkOperationFuture {
    pub fn new(
        connection: Arc<dyn ClientConnection>,
        request: impl Fn() -> Request + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            request: Box::new(request),
            compress_response: false,
            state: Mutex::new(FutureState::default()),
            done: Condvar::new(),
        })
    }

    /// Same as `new`, but the server may batch and compress the response
    pub fn compressed(
        connection: Arc<dyn ClientConnection>,
        request: impl Fn() -> Request + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            request: Box::new(request),
            compress_response: true,
            state: Mutex::new(FutureState::default()),
            done: Condvar::new(),
        })
    }

    /// Send the request (again); resets the previous outcome
    pub fn execute(self: &Arc<Self>) {
        let execution = {
            let mut state = self.state.lock();
            state.execution += 1;
            state.sequence = None;
            state.done = false;
            state.failed = false;
            state.cancelled = false;
            state.response = None;
            state.message = None;
            state.started = Some(Instant::now());
            state.completed = None;
            state.execution
        };

        let listener = Arc::new(ExecutionListener {
            future: Arc::downgrade(self),
            execution,
        });

        match self
            .connection
            .send_request((self.request)(), self.compress_response, listener)
        {
            Ok(sequence) => {
                let mut state = self.state.lock();
                if state.execution == execution && state.sequence.is_none() {
                    state.sequence = Some(sequence);
                }
            }
            Err(e) => self.complete(execution, None, Some(format!("send failed: {}", e))),
        }
    }

    fn complete(&self, execution: u32, response: Option<Response>, failure: Option<String>) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.execution != execution || state.done {
                return;
            }

            match (&response, failure) {
                (_, Some(message)) => {
                    state.failed = true;
                    state.message = Some(message);
                }
                (Some(Response::Error { code, message }), None) => {
                    state.failed = true;
                    state.message = Some(format!("{}: {}", code, message));
                }
                _ => {}
            }

            state.response = response;
            state.done = true;
            state.completed = Some(Instant::now());
            std::mem::take(&mut state.callbacks)
        };
        self.done.notify_all();

        for callback in callbacks {
            callback(self);
        }
    }

    /// Run `callback` once the current execution is done
    pub fn on_done(&self, callback: impl FnOnce(&NetworkOperationFuture) + Send + 'static) {
        {
            let mut state = self.state.lock();
            if !state.done {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Stop all waiters; they return [`FutureError::Cancelled`]
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.done.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn message(&self) -> Option<String> {
        self.state.lock().message.clone()
    }

    /// Sequence id of the current execution
    pub fn sequence(&self) -> Option<SequenceId> {
        self.state.lock().sequence
    }

    pub fn executions(&self) -> u32 {
        self.state.lock().execution
    }

    pub fn connection(&self) -> &Arc<dyn ClientConnection> {
        &self.connection
    }

    /// Time from execution to completion
    pub fn completion_time(&self) -> Option<Duration> {
        let state = self.state.lock();
        match (state.started, state.completed) {
            (Some(started), Some(completed)) => Some(completed.duration_since(started)),
            _ => None,
        }
    }

    /// Block until done or `timeout` elapsed
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<(), FutureError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        // wakeups without completion just recompute the remaining time
        while !state.done {
            if state.cancelled {
                return Err(FutureError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FutureError::Timeout(timeout.as_millis() as u64));
            }
            self.done.wait_for(&mut state, deadline - now);
        }
        Ok(())
    }

    /// The response; a failed future returns [`FutureError::Failed`]
    pub fn get(&self, timeout: Duration) -> Result<Response, FutureError> {
        self.wait_for_completion(timeout)?;

        let state = self.state.lock();
        if state.failed {
            return Err(FutureError::Failed(
                state.message.clone().unwrap_or_else(|| "unknown failure".into()),
            ));
        }
        state
            .response
            .clone()
            .ok_or_else(|| FutureError::Failed("completed without response".into()))
    }

    /// The raw response, also for failed futures with an error response
    pub fn response(&self) -> Option<Response> {
        self.state.lock().response.clone()
    }
}

struct ExecutionListener {
    future: Weak<NetworkOperationFuture>,
    execution: u32,
}

impl ResponseListener for ExecutionListener {
    fn on_response(&self, response: Response) {
        if let Some(future) = self.future.upgrade() {
            future.complete(self.execution, Some(response), None);
        }
    }

    fn on_failure(&self, message: String) {
        if let Some(future) = self.future.upgrade() {
            future.complete(self.execution, None, Some(message));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::connection::PendingCalls;
    use crate::network::package::{ErrorCode, ResponsePackage};
    use crate::{Result, StorageError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    /// Connection whose responses are injected by the test
    #[derive(Default)]
    pub(crate) struct ManualConnection {
        pub calls: PendingCalls,
        pub broken: AtomicBool,
        pub sent: Mutex<Vec<(SequenceId, Request)>>,
    }

    impl ManualConnection {
        pub fn respond(&self, sequence: SequenceId, response: Response) {
            self.calls.complete(ResponsePackage::new(sequence, response));
        }

        pub fn last_sequence(&self) -> SequenceId {
            self.sent.lock().last().map(|(s, _)| *s).unwrap()
        }
    }

    impl ClientConnection for ManualConnection {
        fn name(&self) -> &str {
            "manual"
        }

        fn is_open(&self) -> bool {
            !self.broken.load(Ordering::SeqCst)
        }

        fn send_request(
            &self,
            request: Request,
            _compress_response: bool,
            listener: Arc<dyn ResponseListener>,
        ) -> Result<SequenceId> {
            if !self.is_open() {
                return Err(StorageError::Shutdown);
            }
            let sequence = self.calls.register(listener);
            self.sent.lock().push((sequence, request));
            Ok(sequence)
        }

        fn close(&self) {
            self.broken.store(true, Ordering::SeqCst);
            self.calls.fail_all("closed");
        }
    }

    #[test]
    fn test_get_blocks_until_response() {
        let connection = Arc::new(ManualConnection::default());
        let future = NetworkOperationFuture::new(connection.clone(), || Request::Keepalive);
        future.execute();
        assert!(!future.is_done());

        let sequence = future.sequence().unwrap();
        let responder = {
            let connection = connection.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                connection.respond(sequence, Response::Success);
            })
        };

        assert_eq!(future.get(Duration::from_secs(5)).unwrap(), Response::Success);
        assert!(future.is_done());
        assert!(!future.is_failed());
        assert!(future.completion_time().is_some());
        responder.join().unwrap();
    }

    #[test]
    fn test_timeout_is_not_failure() {
        let connection = Arc::new(ManualConnection::default());
        let future = NetworkOperationFuture::new(connection, || Request::Keepalive);
        future.execute();

        assert_eq!(future.get(Duration::from_millis(30)), Err(FutureError::Timeout(30)));
        assert!(!future.is_done());
        assert!(!future.is_failed());
    }

    #[test]
    fn test_error_response_marks_failed() {
        let connection = Arc::new(ManualConnection::default());
        let future = NetworkOperationFuture::new(connection.clone(), || Request::Keepalive);
        future.execute();

        connection.respond(
            future.sequence().unwrap(),
            Response::error(ErrorCode::OutdatedVersion, "stored 7"),
        );
        assert!(future.is_failed());
        assert!(matches!(future.get(Duration::ZERO), Err(FutureError::Failed(m)) if m.contains("stored 7")));
        assert!(matches!(
            future.response(),
            Some(Response::Error { code: ErrorCode::OutdatedVersion, .. })
        ));
    }

    #[test]
    fn test_send_failure_completes_failed() {
        let connection = Arc::new(ManualConnection::default());
        connection.close();
        let future = NetworkOperationFuture::new(connection, || Request::Keepalive);
        future.execute();

        assert!(future.is_done());
        assert!(future.is_failed());
    }

    #[test]
    fn test_stale_execution_is_ignored() {
        let connection = Arc::new(ManualConnection::default());
        let future = NetworkOperationFuture::new(connection.clone(), || Request::Keepalive);
        future.execute();
        let first = future.sequence().unwrap();
        future.execute();
        let second = future.sequence().unwrap();

        connection.respond(first, Response::error(ErrorCode::Generic, "old"));
        assert!(!future.is_done());
        connection.respond(second, Response::Success);
        assert!(future.is_done() && !future.is_failed());
        assert_eq!(future.executions(), 2);
    }

    #[test]
    fn test_cancel_wakes_waiters() {
        let connection = Arc::new(ManualConnection::default());
        let future = NetworkOperationFuture::new(connection, || Request::Keepalive);
        future.execute();

        let waiter = {
            let future = future.clone();
            thread::spawn(move || future.wait_for_completion(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        future.cancel();
        assert_eq!(waiter.join().unwrap(), Err(FutureError::Cancelled));
    }

    #[test]
    fn test_on_done_callback() {
        let connection = Arc::new(ManualConnection::default());
        let future = NetworkOperationFuture::new(connection.clone(), || Request::Keepalive);
        future.execute();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        future.on_done(move |f| flag.store(f.is_failed(), Ordering::SeqCst));
        connection.respond(future.sequence().unwrap(), Response::error(ErrorCode::Generic, "x"));
        assert!(fired.load(Ordering::SeqCst));
    }
}
