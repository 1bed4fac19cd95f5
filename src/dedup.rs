//! Notification deduplication with a TTL window.
//!
//! Best-effort only: the cache is in-memory, bounded by an LRU, and lost
//! on restart. Correctness of the pipeline never depends on it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct DedupEntry {
    last_sent: DateTime<Utc>,
    count: u64,
}

/// Suppresses repeat notifications for the same event id inside a window.
pub struct NotifyDeduplicator {
    cache: Mutex<LruCache<String, DedupEntry>>,
    window: ChronoDuration,
}

impl NotifyDeduplicator {
    pub fn new(window_ms: u64, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            window: ChronoDuration::milliseconds(window_ms as i64),
        }
    }

    /// Returns true when a notification for this event id should go out;
    /// false when one was already sent inside the window.
    pub fn should_notify(&self, event_id: &str) -> bool {
        let now = Utc::now();
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(_) => return true,
        };

        if let Some(entry) = cache.get_mut(event_id) {
            if now - entry.last_sent >= self.window {
                entry.last_sent = now;
                entry.count += 1;
                true
            } else {
                entry.count += 1;
                false
            }
        } else {
            cache.put(
                event_id.to_string(),
                DedupEntry {
                    last_sent: now,
                    count: 1,
                },
            );
            true
        }
    }

    /// Occurrences observed for an event id, suppressed ones included.
    pub fn occurrence_count(&self, event_id: &str) -> u64 {
        self.cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(event_id).map(|e| e.count))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
