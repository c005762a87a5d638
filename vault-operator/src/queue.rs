//! Keyed, deduplicating, rate-limited work queue (C3).
//!
//! Mirrors client-go's `workqueue.RateLimitingInterface`: `add`/`addRateLimited`
//! collapse duplicate keys into a single pending entry, `get`/`done` prevent a key
//! from being processed twice concurrently, and the rate limiter tracks per-key
//! failure counts independently of the FIFO itself (§9: "rate-limited retry
//! should be implemented as a pure scheduling policy over keys, not by sleeping
//! in the worker").

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use futures::StreamExt;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::time::DelayQueue;

/// Starting backoff for a freshly-failing key.
pub const BASE_DELAY: Duration = Duration::from_millis(5);
/// Consecutive `add_rate_limited` calls for one key before it is forgotten and dropped.
pub const MAX_RETRIES: u32 = 15;

/// The delay for the `retry`-th (0-based) consecutive failure of a key.
pub fn backoff_for(retry: u32) -> Duration {
    let exp = retry.min(30);
    BASE_DELAY.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
}

struct Inner<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    retries: HashMap<K, u32>,
    shutting_down: bool,
}

/// A keyed rate-limited FIFO with exactly one logical worker per key in flight.
pub struct WorkQueue<K> {
    inner: Arc<Mutex<Inner<K>>>,
    notify: Arc<Notify>,
    schedule_tx: mpsc::UnboundedSender<(K, Duration)>,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Builds a new queue and spawns its delay-timer task. The task exits when
    /// every clone of the returned `WorkQueue` is dropped.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            retries: HashMap::new(),
            shutting_down: false,
        }));
        let notify = Arc::new(Notify::new());
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::timer_task(schedule_rx, inner.clone(), notify.clone()));

        WorkQueue {
            inner,
            notify,
            schedule_tx,
        }
    }

    async fn timer_task(
        mut schedule_rx: mpsc::UnboundedReceiver<(K, Duration)>,
        inner: Arc<Mutex<Inner<K>>>,
        notify: Arc<Notify>,
    ) {
        let mut delay_queue: DelayQueue<K> = DelayQueue::new();
        loop {
            tokio::select! {
                maybe = schedule_rx.recv() => {
                    match maybe {
                        Some((key, delay)) => {
                            delay_queue.insert(key, delay);
                        }
                        None => return,
                    }
                }
                expired = delay_queue.next() => {
                    if let Some(expired) = expired {
                        let key = expired.into_inner();
                        let mut g = inner.lock().await;
                        Self::push_ready(&mut g, key);
                        drop(g);
                        notify.notify_one();
                    }
                }
            }
        }
    }

    fn push_ready(g: &mut Inner<K>, key: K) {
        if g.processing.contains(&key) {
            g.dirty.insert(key);
        } else if g.queued.insert(key.clone()) {
            g.queue.push_back(key);
        }
    }

    /// Enqueues `key` immediately. Collapses with any already-pending or
    /// in-flight entry for the same key.
    pub async fn add(&self, key: K) {
        let mut g = self.inner.lock().await;
        Self::push_ready(&mut g, key);
        drop(g);
        self.notify.notify_one();
    }

    /// Schedules `key` after the next exponential-backoff delay for its current
    /// failure count. After `MAX_RETRIES` consecutive calls the key is forgotten
    /// and dropped without being rescheduled; a subsequent plain `add` or
    /// `add_rate_limited` starts a fresh count.
    pub async fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut g = self.inner.lock().await;
            let count = *g.retries.get(&key).unwrap_or(&0);
            if count >= MAX_RETRIES {
                g.retries.remove(&key);
                tracing::warn!(key = ?key, "dropping key after {MAX_RETRIES} consecutive failures");
                None
            } else {
                g.retries.insert(key.clone(), count + 1);
                Some(backoff_for(count))
            }
        };
        if let Some(delay) = delay {
            let _ = self.schedule_tx.send((key, delay));
        }
    }

    /// Blocks until a key is ready, marking it as processing. Returns `None`
    /// once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut g = self.inner.lock().await;
                if let Some(key) = g.queue.pop_front() {
                    g.queued.remove(&key);
                    g.processing.insert(key.clone());
                    return Some(key);
                }
                if g.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as no longer being processed. If it was marked dirty while
    /// in flight (another `add` arrived during processing), it is requeued.
    pub async fn done(&self, key: &K) {
        let mut g = self.inner.lock().await;
        g.processing.remove(key);
        if g.dirty.remove(key) {
            let key = key.clone();
            Self::push_ready(&mut g, key);
            drop(g);
            self.notify.notify_one();
        }
    }

    /// Resets the failure count for `key`, so the next `add_rate_limited` call
    /// starts again at the base delay.
    pub async fn forget(&self, key: &K) {
        let mut g = self.inner.lock().await;
        g.retries.remove(key);
    }

    /// Stops accepting new work and wakes every blocked `get` caller.
    pub async fn shutdown(&self) {
        let mut g = self.inner.lock().await;
        g.shutting_down = true;
        drop(g);
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    async fn retry_count(&self, key: &K) -> Option<u32> {
        self.inner.lock().await.retries.get(key).copied()
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn backoff_schedule_matches_spec() {
        assert_eq!(backoff_for(0), StdDuration::from_millis(5));
        assert_eq!(backoff_for(1), StdDuration::from_millis(10));
        assert_eq!(backoff_for(2), StdDuration::from_millis(20));
        // retry=14 is the 15th consecutive failure: 5ms * 2^14 ~= 82s.
        assert_eq!(backoff_for(14), StdDuration::from_millis(81_920));
    }

    #[tokio::test]
    async fn add_collapses_duplicate_pending_keys() {
        let q: WorkQueue<String> = WorkQueue::new();
        q.add("a".to_string()).await;
        q.add("a".to_string()).await;
        q.add("b".to_string()).await;
        assert_eq!(q.get().await, Some("a".to_string()));
        assert_eq!(q.get().await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn concurrent_add_while_processing_requeues_on_done() {
        let q: WorkQueue<String> = WorkQueue::new();
        q.add("a".to_string()).await;
        let key = q.get().await.unwrap();
        assert_eq!(key, "a");
        // A second event for the same key arrives while it is in flight.
        q.add("a".to_string()).await;
        q.done(&key).await;
        // The dirty mark means "a" is requeued exactly once, not left stuck.
        assert_eq!(q.get().await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn sixteenth_consecutive_failure_is_forgotten() {
        let q: WorkQueue<String> = WorkQueue::new();
        for _ in 0..MAX_RETRIES {
            q.add_rate_limited("a".to_string()).await;
        }
        assert_eq!(q.retry_count(&"a".to_string()).await, Some(MAX_RETRIES));
        // The 16th call observes count == MAX_RETRIES and drops instead of scheduling.
        q.add_rate_limited("a".to_string()).await;
        assert_eq!(q.retry_count(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn forget_resets_failure_count() {
        let q: WorkQueue<String> = WorkQueue::new();
        q.add_rate_limited("a".to_string()).await;
        q.add_rate_limited("a".to_string()).await;
        assert_eq!(q.retry_count(&"a".to_string()).await, Some(2));
        q.forget(&"a".to_string()).await;
        assert_eq!(q.retry_count(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn shutdown_unblocks_pending_get() {
        let q: WorkQueue<String> = WorkQueue::new();
        let q2 = std::sync::Arc::new(q);
        let waiter = q2.clone();
        let handle = tokio::spawn(async move { waiter.get().await });
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        q2.shutdown().await;
        assert_eq!(handle.await.unwrap(), None);
    }
}
