//! One logical operation spread over several network futures

use super::network_future::NetworkOperationFuture;
use crate::error::FutureError;
use crate::network::Response;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Executions allowed per future, the first one included
pub const TOTAL_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry only the futures that failed
    OneFuture,
    /// Retry every future as soon as one failed
    AllFutures,
}

pub struct OperationFuture {
    futures: Vec<Arc<NetworkOperationFuture>>,
    policy: RetryPolicy,
}

impl OperationFuture {
    pub fn new(futures: Vec<Arc<NetworkOperationFuture>>, policy: RetryPolicy) -> Self {
        Self { futures, policy }
    }

    pub fn single(future: Arc<NetworkOperationFuture>) -> Self {
        Self::new(vec![future], RetryPolicy::OneFuture)
    }

    pub fn execute(&self) {
        for future in &self.futures {
            future.execute();
        }
    }

    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    pub fn futures(&self) -> &[Arc<NetworkOperationFuture>] {
        &self.futures
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// True when every future is done
    pub fn is_done(&self) -> bool {
        self.futures.iter().all(|f| f.is_done())
    }

    /// True when any future failed
    pub fn is_failed(&self) -> bool {
        self.futures.iter().any(|f| f.is_failed())
    }

    /// Wait for each future in turn; `timeout` bounds the whole wait
    pub fn wait_for_all(&self, timeout: Duration) -> Result<(), FutureError> {
        let deadline = Instant::now() + timeout;
        for future in &self.futures {
            let remaining = deadline.saturating_duration_since(Instant::now());
            future
                .wait_for_completion(remaining)
                .map_err(|e| match e {
                    FutureError::Timeout(_) => FutureError::Timeout(timeout.as_millis() as u64),
                    other => other,
                })?;
        }
        Ok(())
    }

    pub fn get(&self, index: usize, timeout: Duration) -> Result<Response, FutureError> {
        self.futures
            .get(index)
            .ok_or_else(|| FutureError::Failed(format!("no future with index {}", index)))?
            .get(timeout)
    }

    /// Failure messages of all futures, each tagged with its connection
    pub fn get_all_messages(&self) -> String {
        self.futures
            .iter()
            .filter_map(|f| {
                f.message()
                    .map(|m| format!("[connection={}, message={}]", f.connection().name(), m))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Execute failed futures again according to the retry policy
    ///
    /// Returns false when nothing was retried, either because nothing
    /// failed or because the retry budget is used up.
    pub fn retry_failed(&self) -> bool {
        let failed: Vec<&Arc<NetworkOperationFuture>> =
            self.futures.iter().filter(|f| f.is_failed()).collect();
        if failed.is_empty() {
            return false;
        }

        let to_retry: Vec<&Arc<NetworkOperationFuture>> = match self.policy {
            RetryPolicy::OneFuture => failed,
            RetryPolicy::AllFutures => self.futures.iter().collect(),
        };

        if to_retry.iter().any(|f| f.executions() >= TOTAL_RETRIES) {
            tracing::warn!(messages = %self.get_all_messages(), "giving up after {} executions", TOTAL_RETRIES);
            return false;
        }

        for future in to_retry {
            tracing::debug!(connection = future.connection().name(), "retrying request");
            future.execute();
        }
        true
    }
}
