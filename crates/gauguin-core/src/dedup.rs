use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const CHANNEL_MESSAGE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const MEDIA_GROUP_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Time-bounded "already seen" set.
///
/// Entries are never swept; a stale entry is overwritten the next time its key
/// is checked.
pub struct DedupStore<K> {
    seen: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash> DedupStore<K> {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `key` was marked within `ttl`; otherwise marks it now
    /// and returns `false`. Check and mark happen under one lock.
    pub fn mark_and_check(&self, key: K, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(marked_at) = seen.get(&key) {
            if now.duration_since(*marked_at) <= ttl {
                return true;
            }
        }
        seen.insert(key, now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash> Default for DedupStore<K> {
    fn default() -> Self {
        Self::new()
    }
}
