//! secmeta sync: translate cached images and pods into scan-service notifications.
//!
//! Handlers never mutate resources. Each `sync` makes at most one outbound call:
//! a delete notification when the key has left the cache, an upsert otherwise.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use metrics::counter;
use secmeta_core::{ResourceKey, WatchedResource};
use secmeta_queue::SyncHandler;
use secmeta_scan::{ContainerRecord, ImageRecord, PodRecord, ScanService};
use secmeta_store::ResourceCache;
use tracing::{debug, warn};

mod dump;

pub use dump::{DumpKind, PeriodicDumper};

pub fn image_record(image: &WatchedResource) -> Option<ImageRecord> { image.image.as_ref().map(ImageRecord::from) }

/// Pod record with the containers whose image resolved to a digest.
pub fn pod_record(pod: &WatchedResource) -> PodRecord {
    let containers = pod
        .containers
        .iter()
        .filter_map(|c| c.image.as_ref().map(|i| ContainerRecord { name: c.container.clone(), image: ImageRecord::from(i) }))
        .collect();
    PodRecord {
        name: pod.key.name.clone(),
        namespace: pod.key.namespace().unwrap_or_default().to_string(),
        uid: pod.uid.clone(),
        labels: pod.labels.clone(),
        containers,
    }
}

pub struct ImageSyncHandler {
    cache: ResourceCache<WatchedResource>,
    scan: Arc<dyn ScanService>,
}

impl ImageSyncHandler {
    pub fn new(cache: ResourceCache<WatchedResource>, scan: Arc<dyn ScanService>) -> Self { Self { cache, scan } }
}

#[async_trait::async_trait]
impl SyncHandler<ResourceKey> for ImageSyncHandler {
    async fn sync(&self, key: &ResourceKey) -> Result<()> {
        let Some(image) = self.cache.get(key) else {
            debug!(key = %key, "image gone; notifying scan service");
            self.scan.delete_image(&key.name).await.with_context(|| format!("delete_image {key}"))?;
            counter!("secmeta_notifications_total", 1u64, "kind" => "image", "op" => "delete");
            return Ok(());
        };
        let record = image_record(&image).ok_or_else(|| anyhow!("image {key} has no digest-pinned reference"))?;
        self.scan.upsert_image(&record).await.with_context(|| format!("upsert_image {key}"))?;
        counter!("secmeta_notifications_total", 1u64, "kind" => "image", "op" => "upsert");
        Ok(())
    }
}

pub struct PodSyncHandler {
    cache: ResourceCache<WatchedResource>,
    scan: Arc<dyn ScanService>,
}

impl PodSyncHandler {
    pub fn new(cache: ResourceCache<WatchedResource>, scan: Arc<dyn ScanService>) -> Self { Self { cache, scan } }
}

#[async_trait::async_trait]
impl SyncHandler<ResourceKey> for PodSyncHandler {
    async fn sync(&self, key: &ResourceKey) -> Result<()> {
        let Some(pod) = self.cache.get(key) else {
            debug!(key = %key, "pod gone; notifying scan service");
            self.scan.delete_pod(&key.to_string()).await.with_context(|| format!("delete_pod {key}"))?;
            counter!("secmeta_notifications_total", 1u64, "kind" => "pod", "op" => "delete");
            return Ok(());
        };
        let record = pod_record(&pod);
        if record.containers.len() < pod.containers.len() {
            warn!(key = %key, resolved = record.containers.len(), total = pod.containers.len(), "some container images are not digest pinned yet");
        }
        self.scan.upsert_pod(&record).await.with_context(|| format!("upsert_pod {key}"))?;
        counter!("secmeta_notifications_total", 1u64, "kind" => "pod", "op" => "upsert");
        Ok(())
    }
}
