//! Suppresses messages that arrive more than once, e.g. when a peer resends
//! after a connection swap.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::config::DEFAULT_DUPLICATE_DETECTOR_CAPACITY;

/// Remembers the most recent message ids.
pub struct DuplicateDetector {
    seen: LruCache<String, ()>,
}

impl DuplicateDetector {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// Record `message_id`; returns true if it was already seen.
    pub fn check_and_add(&mut self, message_id: &str) -> bool {
        if self.seen.get(message_id).is_some() {
            return true;
        }
        self.seen.put(message_id.to_string(), ());
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_DETECTOR_CAPACITY)
    }
}
