//! Deduplicating, rate-limited work queue.
//!
//! Keys identify objects, not work items: adding a key that is already queued
//! is a no-op, and a key added while a worker is processing it is queued again
//! once that worker calls [`WorkQueue::done`]. Rapid successive changes to the
//! same object therefore collapse into a single reconcile pass, and one key is
//! never processed by two workers at once.
//!
//! [`WorkQueue::forget`] also cancels delayed adds of the key that are still
//! waiting, so a key that was given up on stays out of the queue until it is
//! added again directly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

pub mod backoff;
pub mod monitor;

pub use backoff::{backoff_delay, ExponentialBackoff};
pub use monitor::{MonitorConfig, QueueMonitor};

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Keys waiting for a worker.
    pub pending: usize,
    /// Keys currently held by a worker.
    pub processing: usize,
    /// Keys with at least one recorded failure.
    pub backing_off: usize,
    /// Keys accepted since the queue was created.
    pub total_added: u64,
}

struct QueueState<K> {
    /// Keys in the order they will be handed out.
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while processing).
    dirty: HashSet<K>,
    /// Keys currently held by a worker.
    processing: HashSet<K>,
    /// Keys with delayed adds in flight: (epoch, outstanding timers).
    delayed: HashMap<K, (u64, usize)>,
    shutting_down: bool,
    total_added: u64,
}

/// Work queue shared by the event source and the reconcile workers.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: ExponentialBackoff<K>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue whose rate-limited requeues back off from `base` up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: HashMap::new(),
                shutting_down: false,
                total_added: 0,
            }),
            notify: Notify::new(),
            backoff: ExponentialBackoff::new(base, max),
        }
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        state.total_added += 1;
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed, unless it is forgotten first.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let epoch = {
            let mut state = self.state.lock();
            let entry = state.delayed.entry(key.clone()).or_insert((0, 0));
            entry.1 += 1;
            entry.0
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.finish_delayed(&key, epoch) {
                queue.add(key);
            }
        });
    }

    /// Account for a fired delayed add. Returns false when `key` was forgotten
    /// after the add was scheduled.
    fn finish_delayed(&self, key: &K, epoch: u64) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.delayed.get_mut(key) else {
            return false;
        };
        let current = entry.0 == epoch;
        entry.1 = entry.1.saturating_sub(1);
        if entry.1 == 0 {
            state.delayed.remove(key);
        }
        current
    }

    /// Requeue `key` after its backoff delay. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = self.backoff.when(&key);
        self.add_after(key, delay);
        delay
    }

    /// Number of rate-limited requeues of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.backoff.num_requeues(key)
    }

    /// Stop tracking failures for `key` and drop its pending delayed adds.
    pub fn forget(&self, key: &K) {
        self.backoff.forget(key);
        if let Some(entry) = self.state.lock().delayed.get_mut(key) {
            entry.0 += 1;
        }
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing; requeues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys. Pending keys are dropped; workers blocked in
    /// [`WorkQueue::get`] return `None`.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            pending: state.queue.len(),
            processing: state.processing.len(),
            backing_off: self.backoff.len(),
            total_added: state.total_added,
        }
    }
}
