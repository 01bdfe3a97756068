//! Duplicate detection over a bounded time window.
//!
//! Each duplicate-detection-enabled entity owns one detector keyed by
//! message id. A publish whose id was seen within the window is an
//! idempotent no-op; otherwise the id is recorded with an expiry of
//! `now + window`. Messages without a message id bypass detection.
//!
//! Eviction is lazy on the publish path (expired entries at the front of
//! the insertion-ordered queue are dropped before the lookup) and also
//! runs from the broker's periodic sweep. Neither path blocks a publish
//! on a full scan: entries are insertion-ordered and expire in order, so
//! eviction stops at the first live entry.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::trace;

struct DedupInner {
    /// Message id → expiry.
    seen: HashMap<String, Instant>,
    /// Insertion order; expiries are monotonic because the window is fixed.
    order: VecDeque<(Instant, String)>,
}

/// Bounded-time-window message-id cache for one entity.
pub struct DuplicateDetector {
    window: Duration,
    inner: Mutex<DedupInner>,
}

impl DuplicateDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(DedupInner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a message id, reporting whether it was already seen within
    /// the window. A duplicate hit does not extend the original window.
    pub async fn observe(&self, message_id: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Self::evict(&mut inner, now);

        if inner.seen.contains_key(message_id) {
            trace!(message_id, "duplicate message id within detection window");
            return true;
        }

        let expires_at = now + self.window;
        inner.seen.insert(message_id.to_string(), expires_at);
        inner.order.push_back((expires_at, message_id.to_string()));
        false
    }

    /// Evicts expired entries. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().await;
        Self::evict(&mut inner, Instant::now())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.seen.len()
    }

    fn evict(inner: &mut DedupInner, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((expires_at, _)) = inner.order.front() {
            if *expires_at > now {
                break;
            }
            let (_, id) = inner.order.pop_front().unwrap();
            inner.seen.remove(&id);
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_observation_is_not_duplicate() {
        let detector = DuplicateDetector::new(Duration::from_secs(10));
        assert!(!detector.observe("m-1").await);
        assert!(detector.observe("m-1").await);
        assert!(!detector.observe("m-2").await);
    }

    #[tokio::test]
    async fn test_entries_expire_after_window() {
        let detector = DuplicateDetector::new(Duration::from_millis(30));
        assert!(!detector.observe("m-1").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        // The window has passed; the same id is fresh again.
        assert!(!detector.observe("m-1").await);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_entries() {
        let detector = DuplicateDetector::new(Duration::from_millis(20));
        detector.observe("a").await;
        detector.observe("b").await;
        assert_eq!(detector.len().await, 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(detector.sweep().await, 2);
        assert_eq!(detector.len().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_does_not_extend_window() {
        let detector = DuplicateDetector::new(Duration::from_millis(50));
        assert!(!detector.observe("m-1").await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Still inside the window: duplicate, but no refresh.
        assert!(detector.observe("m-1").await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Past the original window despite the recent hit.
        assert!(!detector.observe("m-1").await);
    }
}
