//! Engine assembly: store → cache → queue → workers, plus the periodic tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::Client;
use secmeta_annotate::{ImageAnnotator, PeriodicAnnotator, PodAnnotator, Policies, DIGEST_INDEX};
use secmeta_apply::KubeDeployer;
use secmeta_core::{ResourceKey, WatchedResource};
use secmeta_kubehub::{image_store, pipeline_store, pod_store};
use secmeta_pipeline::{KubeStatusWriter, PeriodicResync, PipelineSyncHandler};
use secmeta_queue::{ChangeQueue, WorkerPool};
use secmeta_scan::{HttpScanService, ScanService};
use secmeta_schema::{spec_changed, ScanPipelineSpec};
use secmeta_store::{CacheBuilder, CacheTask, ResourceCache};
use secmeta_sync::{DumpKind, ImageSyncHandler, PeriodicDumper, PodSyncHandler};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::EngineConfig;

/// A started engine and everything needed to stop it.
pub struct Engine {
    name: &'static str,
    queue: ChangeQueue<ResourceKey>,
    workers: JoinSet<()>,
    periodic: JoinSet<()>,
    cache: CacheTask,
    stop_tx: watch::Sender<bool>,
}

impl Engine {
    /// Close the queue so workers drain, stop periodic tasks, then end the watch.
    pub async fn stop(mut self) {
        info!(engine = self.name, "shutting down");
        self.queue.shut_down();
        let _ = self.stop_tx.send(true);
        while let Some(res) = self.workers.join_next().await {
            if let Err(e) = res {
                warn!(engine = self.name, error = %e, "worker ended abnormally");
            }
        }
        while let Some(res) = self.periodic.join_next().await {
            if let Err(e) = res {
                warn!(engine = self.name, error = %e, "periodic task ended abnormally");
            }
        }
        self.cache.stop().await;
        info!(engine = self.name, "stopped");
    }
}

/// Wait for the first listing; stops the cache and fails when it does not land in time.
async fn initial_sync<T>(cfg: &EngineConfig, cache: &ResourceCache<T>, task: CacheTask) -> Result<CacheTask> {
    match cache.wait_synced_within(cfg.startup_timeout).await {
        Ok(()) => {
            info!(cache = cache.name(), items = cache.len(), "cache synced");
            Ok(task)
        }
        Err(e) => {
            task.stop().await;
            Err(e).with_context(|| format!("initial sync of {}", cache.name()))
        }
    }
}

fn scan_client(cfg: &EngineConfig) -> Result<Arc<dyn ScanService>> {
    let client = HttpScanService::new(&cfg.scan_url, cfg.http_timeout).with_context(|| format!("scan service at {}", cfg.scan_url))?;
    Ok(Arc::new(client))
}

pub async fn start_pod_processor(cfg: Arc<EngineConfig>, client: Client) -> Result<Engine> {
    let scan = scan_client(&cfg)?;
    let store = Arc::new(pod_store(client, cfg.namespace.clone()));
    let queue = ChangeQueue::new("pods");
    let q = queue.clone();
    let (cache, task) = CacheBuilder::new("pods")
        .needs_update(WatchedResource::needs_update)
        .index(DIGEST_INDEX, |p: &WatchedResource| p.digests())
        .on_change(move |_, key| q.add(key.clone()))
        .start(Arc::clone(&store));
    let task = initial_sync(&cfg, &cache, task).await?;
    let handler = Arc::new(PodSyncHandler::new(cache.clone(), Arc::clone(&scan)));
    let workers = WorkerPool::new(queue.clone(), handler, cfg.threadiness).spawn();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut periodic = JoinSet::new();
    let annotator = PodAnnotator::new(cache.clone(), store, Arc::clone(&scan), Policies::for_flavor(cfg.flavor));
    periodic.spawn(PeriodicAnnotator::new(Arc::new(annotator), cfg.annotation_interval).run(stop_rx.clone()));
    if let Some(period) = cfg.dump_interval {
        periodic.spawn(PeriodicDumper::new(DumpKind::Pods, cache, scan, period).run(stop_rx));
    }
    info!(namespace = ?cfg.namespace, flavor = %cfg.flavor, workers = cfg.threadiness, "pod processor started");
    Ok(Engine { name: "pod-processor", queue, workers, periodic, cache: task, stop_tx })
}

pub async fn start_image_processor(cfg: Arc<EngineConfig>, client: Client) -> Result<Engine> {
    let scan = scan_client(&cfg)?;
    let store = Arc::new(image_store(client));
    let queue = ChangeQueue::new("images");
    let q = queue.clone();
    let (cache, task) = CacheBuilder::new("images")
        .needs_update(WatchedResource::needs_update)
        .on_change(move |_, key| q.add(key.clone()))
        .start(Arc::clone(&store));
    let task = initial_sync(&cfg, &cache, task).await?;
    let handler = Arc::new(ImageSyncHandler::new(cache.clone(), Arc::clone(&scan)));
    let workers = WorkerPool::new(queue.clone(), handler, cfg.threadiness).spawn();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut periodic = JoinSet::new();
    let annotator = ImageAnnotator::new(cache.clone(), store, Arc::clone(&scan), Policies::for_flavor(cfg.flavor));
    periodic.spawn(PeriodicAnnotator::new(Arc::new(annotator), cfg.annotation_interval).run(stop_rx.clone()));
    if let Some(period) = cfg.dump_interval {
        periodic.spawn(PeriodicDumper::new(DumpKind::Images, cache, scan, period).run(stop_rx));
    }
    info!(flavor = %cfg.flavor, workers = cfg.threadiness, "image processor started");
    Ok(Engine { name: "image-processor", queue, workers, periodic, cache: task, stop_tx })
}

pub async fn start_pipeline_controller(cfg: Arc<EngineConfig>, client: Client, defaults: ScanPipelineSpec, resync: Duration) -> Result<Engine> {
    let store = Arc::new(pipeline_store(client.clone(), cfg.namespace.clone()));
    let queue = ChangeQueue::new("scanpipelines");
    let q = queue.clone();
    let (cache, task) = CacheBuilder::new("scanpipelines")
        .needs_update(spec_changed)
        .on_change(move |_, key| q.add(key.clone()))
        .start(store);
    let task = initial_sync(&cfg, &cache, task).await?;
    let handler = Arc::new(PipelineSyncHandler::new(
        cache.clone(),
        Arc::new(KubeDeployer::new(client.clone())),
        Arc::new(KubeStatusWriter::new(client)),
        defaults,
    ));
    let workers = WorkerPool::new(queue.clone(), handler, cfg.threadiness).spawn();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut periodic = JoinSet::new();
    periodic.spawn(PeriodicResync::new(cache, queue.clone(), resync).run(stop_rx));
    info!(namespace = ?cfg.namespace, workers = cfg.threadiness, resync_secs = resync.as_secs(), "pipeline controller started");
    Ok(Engine { name: "pipeline-controller", queue, workers, periodic, cache: task, stop_tx })
}
