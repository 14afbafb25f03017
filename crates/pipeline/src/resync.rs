use std::time::Duration;

use metrics::counter;
use secmeta_core::{CacheObject, ResourceKey};
use secmeta_queue::ChangeQueue;
use secmeta_store::ResourceCache;
use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info};

/// Requeues every cached resource once per period so drift in the objects we
/// deployed gets repaired even when the resource itself never changes.
pub struct PeriodicResync<T> {
    cache: ResourceCache<T>,
    queue: ChangeQueue<ResourceKey>,
    period: Duration,
}

impl<T: CacheObject> PeriodicResync<T> {
    pub fn new(cache: ResourceCache<T>, queue: ChangeQueue<ResourceKey>, period: Duration) -> Self { Self { cache, queue, period } }

    /// Queue all cached keys; returns how many.
    pub fn tick_once(&self) -> usize {
        let items = self.cache.list();
        for item in &items {
            self.queue.add(item.key());
        }
        counter!("secmeta_resync_requeued_total", items.len() as u64, "queue" => self.queue.name().to_string());
        debug!(queue = self.queue.name(), requeued = items.len(), "resync tick");
        items.len()
    }

    /// Sleep one period, requeue, repeat. Returns once `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = self.queue.name(), period_secs = self.period.as_secs(), "resync started");
        let mut ticker = interval_at(tokio::time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => { self.tick_once(); }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(queue = self.queue.name(), "resync stopped");
    }
}
