#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use secmeta_annotate::{Annotate, Flavor, ImageAnnotator, PeriodicAnnotator, PodAnnotator, Policies, DIGEST_INDEX};
use secmeta_core::{AnnotationRecord, ContainerImageRef, ImageRef, ResourceKey, ResourceKind, ScanResults, ScannedImage, ScannedPod, SummaryEntry, WatchedResource};
use secmeta_scan::{ImageRecord, PodRecord, ScanError, ScanService};
use secmeta_store::memory::MemoryStore;
use secmeta_store::{CacheBuilder, CacheTask, MetadataPatcher, ResourceCache};

/// Scan service whose aggregate results are scripted; `Err(status)` simulates an HTTP failure.
#[derive(Default)]
struct FakeScan {
    next: Mutex<Option<Result<ScanResults, u16>>>,
    calls: Mutex<usize>,
}

impl FakeScan {
    fn respond(&self, r: Result<ScanResults, u16>) { *self.next.lock().unwrap() = Some(r); }
}

#[async_trait::async_trait]
impl ScanService for FakeScan {
    async fn scan_results(&self) -> secmeta_scan::Result<ScanResults> {
        *self.calls.lock().unwrap() += 1;
        match self.next.lock().unwrap().clone() {
            Some(Ok(r)) => Ok(r),
            Some(Err(status)) => Err(ScanError::Status { method: "GET", url: "fake/scanresults".into(), status }),
            None => Ok(ScanResults::default()),
        }
    }
    async fn upsert_image(&self, _: &ImageRecord) -> secmeta_scan::Result<()> { Ok(()) }
    async fn delete_image(&self, _: &str) -> secmeta_scan::Result<()> { Ok(()) }
    async fn upsert_pod(&self, _: &PodRecord) -> secmeta_scan::Result<()> { Ok(()) }
    async fn delete_pod(&self, _: &str) -> secmeta_scan::Result<()> { Ok(()) }
    async fn replace_images(&self, _: &[ImageRecord]) -> secmeta_scan::Result<()> { Ok(()) }
    async fn replace_pods(&self, _: &[PodRecord]) -> secmeta_scan::Result<()> { Ok(()) }
}

fn pod(ns: &str, name: &str, images: &[(&str, &str)]) -> WatchedResource {
    let mut p = WatchedResource::new(ResourceKind::Pod, ResourceKey::namespaced(ns, name));
    for (i, (image, digest)) in images.iter().enumerate() {
        p.containers.push(ContainerImageRef::new(format!("c{i}"), Some(ImageRef::new(*image, *digest))));
    }
    p
}

fn image(digest: &str, name: &str, own_digest: &str) -> WatchedResource {
    let mut i = WatchedResource::new(ResourceKind::Image, ResourceKey::cluster(format!("sha256:{digest}")));
    i.image = Some(ImageRef::new(name, own_digest));
    i
}

fn scanned_image(name: &str, digest: &str, vulns: u64, policy: u64) -> ScannedImage {
    ScannedImage {
        name: name.into(),
        content_digest: digest.into(),
        vulnerability_count: vulns,
        policy_violation_count: policy,
        overall_status: "IN_VIOLATION".into(),
        components_url: "http://hub/c/1".into(),
    }
}

fn results(images: Vec<ScannedImage>, pods: Vec<ScannedPod>) -> ScanResults {
    ScanResults { hub_version: "2024.1".into(), scanner_version: "7.0".into(), pods, images }
}

async fn start_cache(store: &Arc<MemoryStore<WatchedResource>>) -> (ResourceCache<WatchedResource>, CacheTask) {
    let (cache, task) = CacheBuilder::new("test")
        .needs_update(WatchedResource::needs_update)
        .index(DIGEST_INDEX, |p: &WatchedResource| p.digests())
        .start(Arc::clone(store));
    assert!(cache.wait_synced().await);
    (cache, task)
}

async fn eventually(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn pod_annotator(cache: &ResourceCache<WatchedResource>, store: &Arc<MemoryStore<WatchedResource>>, scan: &Arc<FakeScan>) -> PodAnnotator {
    let patcher: Arc<dyn MetadataPatcher> = store.clone();
    PodAnnotator::new(cache.clone(), patcher, scan.clone(), Policies::for_flavor(Flavor::Blackduck))
}

const VULN_KEY: &str = "image0.quality.image.openshift.io/vulnerability.blackduck";

#[tokio::test]
async fn container_findings_land_on_pod_once() {
    let key = ResourceKey::namespaced("ns1", "pod1");
    let store = Arc::new(MemoryStore::with_items([pod("ns1", "pod1", &[("img1", "AAA")])]));
    let (cache, task) = start_cache(&store).await;
    let scan = Arc::new(FakeScan::default());
    scan.respond(Ok(results(vec![scanned_image("img1", "AAA", 5, 0)], vec![])));
    let annotator = pod_annotator(&cache, &store, &scan);

    let first = annotator.tick().await.unwrap();
    assert_eq!((first.matched, first.patched), (1, 1));
    let patched = store.peek(&key).unwrap();
    let record = AnnotationRecord::from_json(&patched.annotations[VULN_KEY]).unwrap();
    assert!(!record.compliant);
    assert_eq!(record.summary, vec![SummaryEntry::new("high", "5", 1)]);
    assert_eq!(patched.labels["com.blackducksoftware.image0.vulnerabilities"], "5");
    assert!(!patched.annotations.contains_key("quality.pod.openshift.io/vulnerability.blackduck"));

    eventually("cache sees patch", || cache.get(&key).is_some_and(|p| p.annotations.contains_key(VULN_KEY))).await;
    let second = annotator.tick().await.unwrap();
    assert_eq!((second.patched, second.unchanged), (0, 1));
    assert_eq!(store.patch_count(), 1);
    task.stop().await;
}

#[tokio::test]
async fn scanned_pod_adds_pod_level_records_and_keeps_foreign_keys() {
    let key = ResourceKey::namespaced("ns1", "pod1");
    let mut p = pod("ns1", "pod1", &[("sidecar", "ZZZ"), ("img1", "AAA")]);
    p.annotations.insert("team".into(), "payments".into());
    p.labels.insert("app".into(), "checkout".into());
    let store = Arc::new(MemoryStore::with_items([p]));
    let (cache, task) = start_cache(&store).await;
    let scan = Arc::new(FakeScan::default());
    let scanned_pod = ScannedPod { name: "pod1".into(), namespace: "ns1".into(), policy_violation_count: 2, vulnerability_count: 0, overall_status: "IN_VIOLATION".into() };
    scan.respond(Ok(results(vec![scanned_image("img1", "AAA", 1, 0)], vec![scanned_pod])));

    let report = pod_annotator(&cache, &store, &scan).tick().await.unwrap();
    assert_eq!(report.patched, 1);
    let got = store.peek(&key).unwrap();
    assert_eq!(got.annotations["team"], "payments");
    assert_eq!(got.labels["app"], "checkout");
    assert!(got.annotations.contains_key("image1.quality.image.openshift.io/vulnerability.blackduck"));
    assert!(!got.annotations.contains_key(VULN_KEY));
    let policy = AnnotationRecord::from_json(&got.annotations["quality.pod.openshift.io/policy.blackduck"]).unwrap();
    assert!(!policy.compliant);
    assert_eq!(got.labels["com.blackducksoftware.pod.policy-violations"], "2");
    task.stop().await;
}

#[tokio::test]
async fn unauthorized_tick_patches_nothing_then_recovers() {
    let store = Arc::new(MemoryStore::with_items([pod("ns1", "pod1", &[("img1", "AAA")])]));
    let (cache, task) = start_cache(&store).await;
    let scan = Arc::new(FakeScan::default());
    let periodic = PeriodicAnnotator::new(Arc::new(pod_annotator(&cache, &store, &scan)), Duration::from_secs(30));

    scan.respond(Err(401));
    assert_eq!(periodic.tick_once().await, None);
    assert_eq!(store.patch_count(), 0);

    scan.respond(Ok(results(vec![scanned_image("img1", "AAA", 5, 0)], vec![])));
    let report = periodic.tick_once().await.unwrap();
    assert_eq!(report.patched, 1);
    assert_eq!(store.patch_count(), 1);
    task.stop().await;
}

#[tokio::test]
async fn patch_failures_are_contained_per_resource() {
    let store = Arc::new(MemoryStore::with_items([pod("ns1", "a", &[("img1", "AAA")]), pod("ns2", "b", &[("img1", "AAA")])]));
    let (cache, task) = start_cache(&store).await;
    let scan = Arc::new(FakeScan::default());
    scan.respond(Ok(results(vec![scanned_image("img1", "AAA", 5, 0)], vec![])));
    store.set_fail_patches(true);

    let report = pod_annotator(&cache, &store, &scan).tick().await.unwrap();
    assert_eq!((report.matched, report.failed, report.patched), (2, 2, 0));
    task.stop().await;
}

#[tokio::test]
async fn image_annotator_checks_digest_and_skips_unknown() {
    let store = Arc::new(MemoryStore::with_items([image("AAA", "img1", "AAA"), image("BBB", "img2", "CCC")]));
    let (cache, task) = start_cache(&store).await;
    let scan = Arc::new(FakeScan::default());
    scan.respond(Ok(results(
        vec![scanned_image("img1", "AAA", 5, 1), scanned_image("img2", "BBB", 1, 0), scanned_image("img3", "DDD", 0, 0)],
        vec![],
    )));
    let patcher: Arc<dyn MetadataPatcher> = store.clone();
    let annotator = ImageAnnotator::new(cache.clone(), patcher, scan.clone(), Policies::for_flavor(Flavor::Platform));

    let report = annotator.tick().await.unwrap();
    assert_eq!((report.matched, report.patched), (1, 1));
    let got = store.peek(&ResourceKey::cluster("sha256:AAA")).unwrap();
    assert_eq!(got.labels["image.vulnerabilities"], "5");
    assert_eq!(got.annotations["project-endpoint"], "http://hub/c/1");
    assert_eq!(got.annotations["server-version"], "2024.1");
    assert!(store.peek(&ResourceKey::cluster("sha256:BBB")).unwrap().labels.is_empty());
    task.stop().await;
}

#[tokio::test]
async fn periodic_run_stops_on_shutdown() {
    let store = Arc::new(MemoryStore::with_items([pod("ns1", "pod1", &[("img1", "AAA")])]));
    let (cache, task) = start_cache(&store).await;
    let scan = Arc::new(FakeScan::default());
    scan.respond(Ok(results(vec![scanned_image("img1", "AAA", 5, 0)], vec![])));
    let periodic = PeriodicAnnotator::new(Arc::new(pod_annotator(&cache, &store, &scan)), Duration::from_millis(20));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(periodic.run(rx));

    eventually("first periodic patch", || store.patch_count() == 1).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(*scan.calls.lock().unwrap() >= 1);
    task.stop().await;
}
