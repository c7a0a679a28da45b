//! Rate limited, deduplicating work queue.
//!
//! A key handed out by [`WorkQueue::get`] is "processing" until [`WorkQueue::done`]
//! is called. Adds for a processing key are parked and delivered once, after `done`,
//! so two workers never hold the same key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, sleep};
use tracing::*;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl ExponentialBackoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map_or(self.max, |d| d.min(self.max))
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl WorkQueue {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    pub async fn add(&self, key: &str) {
        let mut state = self.shared.state.lock().await;
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            // delivered again by done()
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Add after the key's current backoff, then grow the backoff
    pub async fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.shared.state.lock().await;
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = self.shared.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(&key).await;
        });
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            // registered before the state check, so neither notify_one nor
            // notify_waiters can slip in between
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Notify keeps a single permit; pass it on while work remains
                    if !state.queue.is_empty() {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    pub async fn done(&self, key: &str) {
        let mut state = self.shared.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Reset the key's backoff
    pub async fn forget(&self, key: &str) {
        self.shared.state.lock().await.failures.remove(key);
    }

    pub async fn num_requeues(&self, key: &str) -> u32 {
        self.shared.state.lock().await.failures.get(key).copied().unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn shut_down(&self) {
        let mut state = self.shared.state.lock().await;
        if !state.shutting_down {
            debug!(pending = state.queue.len(), "shutting down work queue");
        }
        state.shutting_down = true;
        drop(state);
        self.shared.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().await.shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = WorkQueue::default();
        q.add("ns/a").await;
        q.add("ns/a").await;
        q.add("ns/b").await;
        assert_eq!(q.len().await, 2);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        assert_eq!(q.get().await.as_deref(), Some("ns/b"));
    }

    #[tokio::test]
    async fn adds_while_processing_are_delivered_once_after_done() {
        let q = WorkQueue::default();
        q.add("ns/a").await;
        let key = q.get().await.unwrap();
        q.add("ns/a").await;
        q.add("ns/a").await;
        // parked, not handed to another worker
        assert_eq!(q.len().await, 0);
        q.done(&key).await;
        assert_eq!(q.len().await, 1);
        let again = q.get().await.unwrap();
        assert_eq!(again, "ns/a");
        q.done(&again).await;
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn never_two_workers_on_one_key() {
        let q = WorkQueue::default();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        q.add("ns/a").await;
        let mut workers = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            let runs = runs.clone();
            workers.push(tokio::spawn(async move {
                while let Some(key) = q.get().await {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    q.done(&key).await;
                }
            }));
        }
        // two more notifications while the first run may be in flight
        q.add("ns/a").await;
        q.add("ns/a").await;
        while runs.load(Ordering::SeqCst) == 0 || !q.is_empty().await {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down().await;
        for w in workers {
            w.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        let total = runs.load(Ordering::SeqCst);
        assert!((1..=2).contains(&total), "ran {total} times");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_and_forget_resets() {
        let q = WorkQueue::default();
        q.add_rate_limited("ns/a").await;
        assert_eq!(q.len().await, 0);
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.num_requeues("ns/a").await, 1);

        let key = q.get().await.unwrap();
        q.add_rate_limited(&key).await;
        q.done(&key).await;
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.len().await, 0, "second failure waits 10ms");
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.len().await, 1);

        q.forget("ns/a").await;
        assert_eq!(q.num_requeues("ns/a").await, 0);
    }

    #[test]
    fn backoff_is_capped() {
        let b = ExponentialBackoff::default();
        assert_eq!(b.delay(0), Duration::from_millis(5));
        assert_eq!(b.delay(3), Duration::from_millis(40));
        assert_eq!(b.delay(40), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn every_idle_worker_is_woken() {
        let q = WorkQueue::default();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        q.add("ns/a").await;
        q.add("ns/b").await;

        let mut got = Vec::new();
        for w in waiters {
            let key = tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("worker left parked")
                .unwrap();
            got.push(key.unwrap());
        }
        got.sort();
        assert_eq!(got, ["ns/a", "ns/b"]);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = WorkQueue::default();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down().await;
        assert_eq!(waiter.await.unwrap(), None);
        q.add("ns/a").await;
        assert!(q.is_empty().await);
    }
}
