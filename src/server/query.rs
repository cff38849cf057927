//! Server side state of paged queries
//!
//! A query is evaluated once; its result is handed out page by page. The
//! cursor is kept under the sequence id of the request that started the
//! query until the last page was sent or the client cancels it.

use crate::network::package::SequenceId;
use crate::network::Response;
use crate::types::Tuple;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub struct PagedQuery {
    remaining: VecDeque<Tuple>,
    page_size: usize,
    last_access: Instant,
}

impl PagedQuery {
    /// `page_size = 0` sends the whole result as one page
    pub fn new(tuples: Vec<Tuple>, page_size: usize) -> Self {
        Self {
            remaining: tuples.into(),
            page_size,
            last_access: Instant::now(),
        }
    }

    pub fn next_page(&mut self) -> Response {
        self.last_access = Instant::now();
        let take = if self.page_size == 0 {
            self.remaining.len()
        } else {
            self.page_size.min(self.remaining.len())
        };
        let tuples: Vec<Tuple> = self.remaining.drain(..take).collect();
        Response::Tuples {
            tuples,
            complete: self.remaining.is_empty(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_access.elapsed()
    }
}

#[derive(Default)]
pub struct QueryRegistry {
    queries: Mutex<HashMap<SequenceId, PagedQuery>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First page of `query`; the cursor is kept if more pages follow
    pub fn start(&self, sequence: SequenceId, mut query: PagedQuery) -> Response {
        let page = query.next_page();
        if !query.is_complete() {
            self.queries.lock().insert(sequence, query);
        }
        page
    }

    /// Next page of the query started by `sequence`
    pub fn next_page(&self, sequence: SequenceId) -> Option<Response> {
        let mut queries = self.queries.lock();
        let query = queries.get_mut(&sequence)?;
        let page = query.next_page();
        if query.is_complete() {
            queries.remove(&sequence);
        }
        Some(page)
    }

    pub fn cancel(&self, sequence: SequenceId) -> bool {
        self.queries.lock().remove(&sequence).is_some()
    }

    /// Drop cursors the client did not touch for `max_idle`
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let mut queries = self.queries.lock();
        let before = queries.len();
        queries.retain(|_, q| q.idle_time() < max_idle);
        before - queries.len()
    }

    pub fn clear(&self) {
        self.queries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
