//! Rate-limited work queue of package keys.
//!
//! # Architecture
//!
//! Keys are deduplicated while they wait: adding a key that is already
//! queued is a no-op. A key being processed is never handed to a second
//! worker; if it is added again meanwhile it is marked dirty and requeued
//! when the worker calls [`WorkQueue::done`].
//!
//! Failed keys come back through [`WorkQueue::add_rate_limited`], delayed
//! by an exponential backoff that grows with the key's failure count until
//! [`WorkQueue::forget`] resets it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, queued or not.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shut_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Requeue `key` after its backoff delay and count the failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_default();
            let delay = backoff(self.base_delay, self.max_delay, *failures);
            *failures += 1;
            delay
        };
        debug!(%key, ?delay, "requeueing after backoff");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Times `key` went through [`add_rate_limited`](Self::add_rate_limited)
    /// since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Next key to process. Waits for one; `None` once the queue is shut
    /// down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` processed, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    base.checked_mul(1u32.checked_shl(failures).unwrap_or(u32::MAX))
        .map_or(max, |d| d.min(max))
}
