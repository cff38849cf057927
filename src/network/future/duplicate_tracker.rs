use crate::types::Tuple;
use ahash::AHashSet;

/// Remembers the (key, version) pairs already handed out to a caller
#[derive(Debug, Default)]
pub struct EntityDuplicateTracker {
    seen: AHashSet<(String, i64)>,
}

impl EntityDuplicateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if an equal tuple was seen before; records the tuple otherwise
    pub fn is_already_seen(&mut self, tuple: &Tuple) -> bool {
        !self.seen.insert((tuple.key().to_string(), tuple.version()))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
