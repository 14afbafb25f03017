use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{ChangeQueue, QueueKey};

/// Reconciles one key against current state. Must be idempotent: the same key
/// may be handed over again after a failure or a later change.
#[async_trait::async_trait]
pub trait SyncHandler<K>: Send + Sync {
    async fn sync(&self, key: &K) -> anyhow::Result<()>;
}

/// Fixed number of workers draining one queue into one handler.
pub struct WorkerPool<K, H> {
    queue: ChangeQueue<K>,
    handler: Arc<H>,
    workers: usize,
}

impl<K: QueueKey, H: SyncHandler<K> + 'static> WorkerPool<K, H> {
    pub fn new(queue: ChangeQueue<K>, handler: Arc<H>, workers: usize) -> Self {
        Self { queue, handler, workers: workers.max(1) }
    }

    /// Spawn the workers. They exit once the queue is shut down.
    pub fn spawn(self) -> JoinSet<()> {
        let mut set = JoinSet::new();
        info!(queue = %self.queue.name(), workers = self.workers, "starting workers");
        for id in 0..self.workers {
            let queue = self.queue.clone();
            let handler = Arc::clone(&self.handler);
            set.spawn(async move { run_worker(id, queue, handler).await });
        }
        set
    }

    /// Spawn the workers and wait until all of them exit.
    pub async fn run(self) {
        let mut set = self.spawn();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn run_worker<K: QueueKey, H: SyncHandler<K>>(id: usize, queue: ChangeQueue<K>, handler: Arc<H>) {
    while let Some(key) = queue.get().await {
        process_one(&queue, handler.as_ref(), key).await;
    }
    debug!(queue = %queue.name(), worker = id, "worker exiting");
}

/// One `get → sync → forget|retry → done` cycle.
async fn process_one<K: QueueKey, H: SyncHandler<K> + ?Sized>(queue: &ChangeQueue<K>, handler: &H, key: K) {
    let t0 = Instant::now();
    let engine = queue.name().to_string();
    match handler.sync(&key).await {
        Ok(()) => {
            queue.forget(&key);
            counter!("secmeta_sync_total", 1u64, "engine" => engine.clone());
            debug!(queue = %engine, key = %key, took_ms = t0.elapsed().as_millis() as u64, "synced");
        }
        Err(e) => {
            counter!("secmeta_sync_errors_total", 1u64, "engine" => engine.clone());
            warn!(queue = %engine, key = %key, retries = queue.num_requeues(&key), error = %format!("{e:#}"), "sync failed; requeueing with backoff");
            queue.add_rate_limited(key.clone());
        }
    }
    histogram!("secmeta_sync_ms", t0.elapsed().as_secs_f64() * 1000.0, "engine" => engine);
    queue.done(&key);
}
