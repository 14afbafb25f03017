use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use metrics::{counter, histogram};
use secmeta_core::{Labels, ResourceKey, ScanResults, WatchedResource};
use secmeta_scan::{ScanError, ScanService};
use secmeta_store::{MetadataPatcher, ResourceCache, Snapshot};
use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::policy::{EqualityPolicy, ImageFacts, PodFacts, Policies, Slot};

/// Secondary index on the pod cache: content digest → pods running it.
pub const DIGEST_INDEX: &str = "digest";

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Cached resources that scan results apply to.
    pub matched: usize,
    pub patched: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Desired metadata for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Desired {
    pub labels: Labels,
    pub annotations: Labels,
}

impl Desired {
    pub fn is_empty(&self) -> bool { self.labels.is_empty() && self.annotations.is_empty() }

    fn extend(&mut self, labels: Labels, annotations: Labels) {
        self.labels.extend(labels);
        self.annotations.extend(annotations);
    }
}

/// The patch to send, or `None` when `current` already satisfies `desired`.
///
/// Each unsatisfied map is sent as `current ∪ desired` with desired values
/// winning; a satisfied map is left out of the patch.
pub fn plan_patch(current: &WatchedResource, desired: &Desired, equality: &dyn EqualityPolicy) -> Option<(Labels, Labels)> {
    let merge = |have: &Labels, want: &Labels| {
        if equality.contains(have, want) {
            return Labels::new();
        }
        let mut out = have.clone();
        out.extend(want.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    };
    let labels = merge(&current.labels, &desired.labels);
    let annotations = merge(&current.annotations, &desired.annotations);
    if labels.is_empty() && annotations.is_empty() {
        None
    } else {
        Some((labels, annotations))
    }
}

fn now_timestamp() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true) }

/// One poll-and-diff pass over a cache.
#[async_trait::async_trait]
pub trait Annotate: Send + Sync + 'static {
    fn kind(&self) -> &'static str;
    async fn tick(&self) -> Result<TickReport, ScanError>;
}

/// State shared by both annotators.
struct Engine {
    cache: ResourceCache<WatchedResource>,
    patcher: Arc<dyn MetadataPatcher>,
    scan: Arc<dyn ScanService>,
    policies: Policies,
}

impl Engine {
    async fn fetch(&self, kind: &'static str) -> Result<ScanResults, ScanError> {
        self.scan.scan_results().await.map_err(|e| {
            counter!("secmeta_annotate_errors_total", 1u64, "kind" => kind, "stage" => "fetch");
            e
        })
    }

    async fn apply(&self, kind: &'static str, current: &WatchedResource, desired: &Desired, report: &mut TickReport) {
        report.matched += 1;
        let Some((labels, annotations)) = plan_patch(current, desired, self.policies.equality.as_ref()) else {
            report.unchanged += 1;
            return;
        };
        debug!(kind, key = %current.key, labels = labels.len(), annotations = annotations.len(), "metadata out of date");
        match self.patcher.patch_metadata(&current.key, &labels, &annotations).await {
            Ok(()) => {
                report.patched += 1;
                counter!("secmeta_annotate_patches_total", 1u64, "kind" => kind);
                info!(kind, key = %current.key, "annotated");
            }
            Err(e) => {
                report.failed += 1;
                counter!("secmeta_annotate_errors_total", 1u64, "kind" => kind, "stage" => "patch");
                warn!(kind, key = %current.key, op = "patch_metadata", error = %e, "annotation patch failed");
            }
        }
    }
}

/// Annotates image objects with the findings for their own digest.
pub struct ImageAnnotator {
    engine: Engine,
}

impl ImageAnnotator {
    pub fn new(cache: ResourceCache<WatchedResource>, patcher: Arc<dyn MetadataPatcher>, scan: Arc<dyn ScanService>, policies: Policies) -> Self {
        Self { engine: Engine { cache, patcher, scan, policies } }
    }

    fn desired(&self, results: &ScanResults, idx: usize, timestamp: &str) -> Desired {
        let facts = ImageFacts { scanned: &results.images[idx], server_version: &results.hub_version, scanner_version: &results.scanner_version };
        let policy = self.engine.policies.annotations.as_ref();
        Desired { labels: policy.image_labels(&facts, Slot::Image), annotations: policy.image_annotations(&facts, Slot::Image, timestamp) }
    }
}

#[async_trait::async_trait]
impl Annotate for ImageAnnotator {
    fn kind(&self) -> &'static str { "image" }

    async fn tick(&self) -> Result<TickReport, ScanError> {
        let results = self.engine.fetch(self.kind()).await?;
        let snap = self.engine.cache.current();
        let timestamp = now_timestamp();
        let mut report = TickReport::default();
        for (idx, scanned) in results.images.iter().enumerate() {
            let key = ResourceKey::cluster(format!("sha256:{}", scanned.content_digest));
            let Some(cached) = snap.get(&key) else {
                debug!(image = %scanned.name, digest = %scanned.content_digest, "scanned image not cached");
                continue;
            };
            match &cached.image {
                Some(r) if r.digest == scanned.content_digest => {}
                other => {
                    warn!(key = %key, scanned = %scanned.content_digest, cached = ?other.as_ref().map(|r| &r.digest), "digest mismatch; skipping image");
                    continue;
                }
            }
            let desired = self.desired(&results, idx, &timestamp);
            self.engine.apply(self.kind(), &cached, &desired, &mut report).await;
        }
        Ok(report)
    }
}

/// Annotates pods with pod-level findings and, per container, the findings of
/// the image it runs.
pub struct PodAnnotator {
    engine: Engine,
}

impl PodAnnotator {
    /// The pod cache must carry the [`DIGEST_INDEX`] index.
    pub fn new(cache: ResourceCache<WatchedResource>, patcher: Arc<dyn MetadataPatcher>, scan: Arc<dyn ScanService>, policies: Policies) -> Self {
        Self { engine: Engine { cache, patcher, scan, policies } }
    }

    fn candidates(snap: &Snapshot<WatchedResource>, results: &ScanResults) -> BTreeSet<ResourceKey> {
        let mut keys: BTreeSet<ResourceKey> = results.pods.iter().map(|p| ResourceKey::namespaced(p.namespace.clone(), p.name.clone())).collect();
        for image in &results.images {
            keys.extend(snap.by_index(DIGEST_INDEX, &image.content_digest).iter().map(|p| p.key.clone()));
        }
        keys
    }

    /// Pod-level entries when the pod itself was scanned, plus `image<N>` entries
    /// for every container whose image has results.
    pub fn desired(&self, pod: &WatchedResource, results: &ScanResults, timestamp: &str) -> Desired {
        let policy = self.engine.policies.annotations.as_ref();
        let mut out = Desired::default();
        let (server_version, scanner_version) = (results.hub_version.as_str(), results.scanner_version.as_str());
        if let Some(ns) = pod.key.namespace() {
            if let Some(scanned) = results.find_pod(ns, &pod.key.name) {
                let facts = PodFacts { scanned, server_version, scanner_version };
                out.extend(policy.pod_labels(&facts), policy.pod_annotations(&facts, timestamp));
            }
        }
        for (index, container) in pod.containers.iter().enumerate() {
            let Some(image) = &container.image else { continue };
            let Some(scanned) = results.find_image(image) else { continue };
            let facts = ImageFacts { scanned, server_version, scanner_version };
            let slot = Slot::Container { index, image_name: &image.name };
            out.extend(policy.image_labels(&facts, slot), policy.image_annotations(&facts, slot, timestamp));
        }
        out
    }
}

#[async_trait::async_trait]
impl Annotate for PodAnnotator {
    fn kind(&self) -> &'static str { "pod" }

    async fn tick(&self) -> Result<TickReport, ScanError> {
        let results = self.engine.fetch(self.kind()).await?;
        let snap = self.engine.cache.current();
        let timestamp = now_timestamp();
        let mut report = TickReport::default();
        for key in Self::candidates(&snap, &results) {
            let Some(pod) = snap.get(&key) else {
                debug!(key = %key, "scanned pod not cached");
                continue;
            };
            let desired = self.desired(&pod, &results, &timestamp);
            if desired.is_empty() {
                continue;
            }
            self.engine.apply(self.kind(), &pod, &desired, &mut report).await;
        }
        Ok(report)
    }
}

/// Drives an annotator on a fixed period until shutdown is signalled.
pub struct PeriodicAnnotator<A> {
    annotator: Arc<A>,
    period: Duration,
}

impl<A: Annotate> PeriodicAnnotator<A> {
    pub fn new(annotator: Arc<A>, period: Duration) -> Self { Self { annotator, period } }

    /// One tick with logging and timing; errors abort only this tick.
    pub async fn tick_once(&self) -> Option<TickReport> {
        let kind = self.annotator.kind();
        let t0 = Instant::now();
        let out = match self.annotator.tick().await {
            Ok(report) => {
                info!(kind, matched = report.matched, patched = report.patched, unchanged = report.unchanged, failed = report.failed, took_ms = t0.elapsed().as_millis() as u64, "annotation tick");
                Some(report)
            }
            Err(e) => {
                error!(kind, op = "scan_results", error = %e, "annotation tick aborted");
                None
            }
        };
        histogram!("secmeta_annotate_tick_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
        out
    }

    /// Sleep one period, tick, repeat. Returns once `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.annotator.kind();
        info!(kind, period_secs = self.period.as_secs(), "annotator started");
        let mut ticker = interval_at(tokio::time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => { self.tick_once().await; }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(kind, "annotator stopped");
    }
}
