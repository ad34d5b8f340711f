//! Coalescing work queue.
//!
//! Semantics mirror the classic controller work queue: duplicate keys
//! collapse while queued, a key being processed never runs concurrently
//! with itself, and a key dirtied during processing re-enters the queue
//! when its worker calls [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use super::backoff::RateLimiter;

/// Coalescing, rate-limited work queue of resource keys.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: RateLimiter,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::with_limiter(RateLimiter::new())
    }

    pub fn with_limiter(limiter: RateLimiter) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                limiter,
            }),
        }
    }

    /// Enqueue a key. Duplicates of a queued key collapse; a key being
    /// processed is marked dirty and re-enters on `done`.
    pub fn add(&self, key: &str) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Enqueue after a delay.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueue with the per-key exponential backoff.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.limiter.when(key);
        trace!(key = %key, delay_ms = delay.as_millis() as u64, "Requeue with backoff");
        self.add_after(key, delay);
    }

    /// Clear the backoff history for a key after a successful sync.
    pub fn forget(&self, key: &str) {
        self.inner.limiter.forget(key);
    }

    /// Number of retries recorded for a key.
    pub fn retries(&self, key: &str) -> u32 {
        self.inner.limiter.retries(key)
    }

    /// Pop the next key, waiting until one is available. Returns None once
    /// the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a notify_waiters() between
            // the check and the await cannot be lost.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Wake another waiter in case more items remain.
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark processing finished. A key dirtied meanwhile re-enters the
    /// queue immediately.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting work and wake all waiters; `get` drains what is
    /// queued and then returns None.
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shutting_down = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Queued (not in-flight) item count.
    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_keys_collapse() {
        let queue = WorkQueue::new();
        queue.add("default/web-1");
        queue.add("default/web-1");
        queue.add("default/web-1");
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.unwrap();
        assert_eq!(key, "default/web-1");
        assert!(queue.is_empty());
        queue.done(&key);
    }

    #[tokio::test]
    async fn test_key_dirtied_during_processing_reenters() {
        let queue = WorkQueue::new();
        queue.add("default/web-1");

        let key = queue.get().await.unwrap();
        // Burst of updates while the worker holds the key: they collapse
        // and do not run concurrently.
        queue.add("default/web-1");
        queue.add("default/web-1");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        let again = queue.get().await.unwrap();
        assert_eq!(again, "default/web-1");
        queue.done(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_after_delays_delivery() {
        let queue = WorkQueue::new();
        queue.add_after("default/web-1", Duration::from_millis(50));
        assert!(queue.is_empty());

        // Delivered once the timer fires; get() blocks until then.
        let key = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .expect("delayed add must be delivered")
            .unwrap();
        assert_eq!(key, "default/web-1");
        queue.done(&key);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_ends() {
        let queue = WorkQueue::new();
        queue.add("a/a");
        queue.add("b/b");
        queue.shut_down();

        // Existing items drain.
        assert!(queue.get().await.is_some());
        assert!(queue.get().await.is_some());
        // Then the queue reports exhaustion.
        assert!(queue.get().await.is_none());

        // New work is refused.
        queue.add("c/c");
        assert!(queue.get().await.is_none());
    }
}
