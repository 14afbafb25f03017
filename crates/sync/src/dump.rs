use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use secmeta_core::WatchedResource;
use secmeta_scan::{ScanError, ScanService};
use secmeta_store::ResourceCache;
use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{image_record, pod_record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Images,
    Pods,
}

impl DumpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpKind::Images => "images",
            DumpKind::Pods => "pods",
        }
    }
}

/// Periodically replaces the scan service's inventory with the full cache
/// contents, so records whose delete notification was lost get dropped.
pub struct PeriodicDumper {
    kind: DumpKind,
    cache: ResourceCache<WatchedResource>,
    scan: Arc<dyn ScanService>,
    period: Duration,
}

impl PeriodicDumper {
    pub fn new(kind: DumpKind, cache: ResourceCache<WatchedResource>, scan: Arc<dyn ScanService>, period: Duration) -> Self {
        Self { kind, cache, scan, period }
    }

    /// Send one full inventory. Returns how many records were sent; an unsynced
    /// cache sends nothing.
    pub async fn dump_once(&self) -> Result<usize, ScanError> {
        if !self.cache.has_synced() {
            debug!(kind = self.kind.as_str(), "cache not synced; skipping dump");
            return Ok(0);
        }
        let items = self.cache.list();
        let sent = match self.kind {
            DumpKind::Pods => {
                let pods: Vec<_> = items.iter().map(|p| pod_record(p)).collect();
                self.scan.replace_pods(&pods).await?;
                pods.len()
            }
            DumpKind::Images => {
                let images: Vec<_> = items.iter().filter_map(|i| image_record(i)).collect();
                self.scan.replace_images(&images).await?;
                images.len()
            }
        };
        counter!("secmeta_dumps_total", 1u64, "kind" => self.kind.as_str());
        Ok(sent)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.kind.as_str();
        info!(kind, period_secs = self.period.as_secs(), "inventory dumper started");
        let mut ticker = interval_at(tokio::time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => match self.dump_once().await {
                    Ok(n) => info!(kind, records = n, "inventory dumped"),
                    Err(e) => warn!(kind, op = "replace_inventory", error = %e, "inventory dump failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(kind, "inventory dumper stopped");
    }
}
