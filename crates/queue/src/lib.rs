//! secmeta work queue.
//!
//! `ChangeQueue` holds resource keys, never payloads. A key is pending at most
//! once (dirty set), processed by at most one worker at a time (processing set),
//! and a key added while it is being processed is parked until `done`.
//! Failed keys come back through `add_rate_limited` after a per-key exponential
//! delay.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

mod limiter;
mod pool;

pub use limiter::{RateLimiter, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
pub use pool::{SyncHandler, WorkerPool};

/// Bounds on what a queue key must support.
pub trait QueueKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static> QueueKey for T {}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    waiting: FxHashMap<K, Instant>,
    limiter: RateLimiter<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
}

/// Deduplicating, single-flight, rate-limited queue of keys. Cheap to clone.
pub struct ChangeQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for ChangeQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K: QueueKey> ChangeQueue<K> {
    pub fn new(name: impl Into<String>) -> Self { Self::with_limiter(name, RateLimiter::default()) }

    pub fn with_limiter(name: impl Into<String>, limiter: RateLimiter<K>) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            limiter,
            shutting_down: false,
        };
        Self { inner: Arc::new(Inner { name: name.into(), state: Mutex::new(state), notify: Notify::new() }) }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Enqueue `key` unless it is already pending. Keys in flight are parked until `done`.
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down || !st.dirty.insert(key.clone()) {
            return;
        }
        if st.processing.contains(&key) {
            return;
        }
        st.queue.push_back(key);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        // pass the wakeup on; notify_one only stores a single permit
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `key` finished; re-queues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if !st.shutting_down && st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Reset the retry counter of `key`.
    pub fn forget(&self, key: &K) { self.lock().limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.lock().limiter.retries(key) }

    /// Re-enqueue `key` after its backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.lock().limiter.when(&key);
        counter!("secmeta_queue_retries_total", 1u64, "queue" => self.inner.name.clone());
        self.add_after(key, delay);
    }

    /// Enqueue `key` once `delay` has passed. A pending earlier deadline for the same key wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            if st.waiting.get(&key).is_some_and(|at| *at <= ready_at) {
                return;
            }
            st.waiting.insert(key.clone(), ready_at);
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let due = {
                let mut st = this.lock();
                if st.waiting.get(&key) == Some(&ready_at) {
                    st.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                this.add(key);
            }
        });
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Close the queue: pending and delayed keys are dropped and every `get` returns `None`.
    /// Work already handed out finishes normally.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let dropped = st.queue.len() + st.waiting.len();
        st.queue.clear();
        st.dirty.clear();
        st.waiting.clear();
        let in_flight = st.processing.len();
        drop(st);
        self.inner.notify.notify_waiters();
        info!(queue = %self.inner.name, dropped, in_flight, "queue shut down");
    }
}

impl<K: QueueKey> fmt::Debug for ChangeQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("ChangeQueue")
            .field("name", &self.inner.name)
            .field("pending", &st.queue.len())
            .field("processing", &st.processing.len())
            .field("waiting", &st.waiting.len())
            .finish()
    }
}
