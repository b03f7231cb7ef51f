use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const DISCUSSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Where a channel post's comment thread lives in the linked discussion group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscussionRef {
    pub discussion_chat_id: i64,
    pub discussion_message_id: i64,
    pub created_at: Instant,
}

/// Rendezvous table keyed by (channel chat id, channel message id), filled
/// by auto-forwards arriving in the discussion group.
pub struct DiscussionMap {
    ttl: Duration,
    entries: Mutex<HashMap<(i64, i64), DiscussionRef>>,
}

impl DiscussionMap {
    pub fn new() -> Self {
        Self::with_ttl(DISCUSSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Last write wins.
    pub fn put(
        &self,
        channel_id: i64,
        channel_message_id: i64,
        discussion_chat_id: i64,
        discussion_message_id: i64,
    ) {
        let entry = DiscussionRef {
            discussion_chat_id,
            discussion_message_id,
            created_at: Instant::now(),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((channel_id, channel_message_id), entry);
    }

    pub fn get(&self, channel_id: i64, channel_message_id: i64) -> Option<DiscussionRef> {
        let key = (channel_id, channel_message_id);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = *entries.get(&key)?;
        if entry.created_at.elapsed() > self.ttl {
            entries.remove(&key);
            return None;
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DiscussionMap {
    fn default() -> Self {
        Self::new()
    }
}
