use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secmeta_apply::{check_namespace_claim, Component, ComponentKind, DeployError, Deployer, Owner, OWNER_LABEL};
use secmeta_core::ResourceKey;
use secmeta_pipeline::{PeriodicResync, PipelineSyncHandler, StatusWriter};
use secmeta_queue::{ChangeQueue, SyncHandler, WorkerPool};
use secmeta_schema::{builtin_defaults, spec_changed, PipelineState, ScanPipeline, ScanPipelineSpec, ScanPipelineStatus};
use secmeta_store::memory::MemoryStore;
use secmeta_store::{CacheBuilder, ResourceCache};
use tokio::sync::watch;

type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Deploy(usize),
    ScaleToZero(String),
    Teardown(String),
}

/// Tracks live namespaces and their labels the way the cluster would.
#[derive(Default)]
struct FakeDeployer {
    ops: Mutex<Vec<Op>>,
    fail_deploy: Mutex<bool>,
    namespaces: Mutex<BTreeMap<String, Labels>>,
}

impl FakeDeployer {
    fn ops(&self) -> Vec<Op> { self.ops.lock().unwrap().clone() }
    fn fail(&self, on: bool) { *self.fail_deploy.lock().unwrap() = on; }
    fn deploys(&self) -> usize { self.ops().iter().filter(|o| matches!(o, Op::Deploy(_))).count() }
    fn add_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.namespaces.lock().unwrap().insert(name.into(), labels);
    }
    fn namespace(&self, name: &str) -> Option<Labels> { self.namespaces.lock().unwrap().get(name).cloned() }
    fn delete_namespace(&self, name: &str) { self.namespaces.lock().unwrap().remove(name); }
}

fn manifest_labels(c: &Component) -> Labels {
    c.manifest
        .pointer("/metadata/labels")
        .and_then(|l| l.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string()))).collect())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl Deployer for FakeDeployer {
    async fn deploy(&self, components: &[Component]) -> Result<(), DeployError> {
        if *self.fail_deploy.lock().unwrap() {
            return Err(DeployError::Api { op: "apply", target: "Deployment prod/secmeta-core".into(), message: "quota exceeded".into() });
        }
        for c in components.iter().filter(|c| c.kind == ComponentKind::Namespace) {
            let mut live = self.namespaces.lock().unwrap();
            check_namespace_claim(c, live.get(&c.name))?;
            live.insert(c.name.clone(), manifest_labels(c));
        }
        self.ops.lock().unwrap().push(Op::Deploy(components.len()));
        Ok(())
    }

    async fn exists(&self, component: &Component) -> Result<bool, DeployError> {
        match component.kind {
            ComponentKind::Namespace => Ok(self.namespace(&component.name).is_some()),
            _ => Ok(true),
        }
    }

    async fn scale_to_zero(&self, owner: &Owner) -> Result<usize, DeployError> {
        self.ops.lock().unwrap().push(Op::ScaleToZero(owner.label_value()));
        Ok(3)
    }

    async fn teardown(&self, owner: &Owner) -> Result<usize, DeployError> {
        self.ops.lock().unwrap().push(Op::Teardown(owner.label_value()));
        let mut live = self.namespaces.lock().unwrap();
        let before = live.len();
        live.retain(|_, labels| labels.get(OWNER_LABEL) != Some(&owner.label_value()));
        Ok(before - live.len())
    }
}

/// Applies written status back onto the store, the way the apiserver would.
struct StoreStatus {
    store: Arc<MemoryStore<ScanPipeline>>,
    writes: Mutex<Vec<ScanPipelineStatus>>,
}

impl StoreStatus {
    fn writes(&self) -> Vec<ScanPipelineStatus> { self.writes.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl StatusWriter for StoreStatus {
    async fn write_status(&self, key: &ResourceKey, status: &ScanPipelineStatus) -> anyhow::Result<()> {
        self.writes.lock().unwrap().push(status.clone());
        self.store.modify(key, |p| p.status = Some(status.clone()))?;
        Ok(())
    }
}

fn pipeline(desired: Option<&str>) -> ScanPipeline {
    let spec = ScanPipelineSpec { desired_state: desired.map(str::to_string), ..Default::default() };
    let mut p = ScanPipeline::new("prod", spec);
    p.metadata.namespace = Some("ops".into());
    p
}

fn key() -> ResourceKey { ResourceKey::namespaced("ops", "prod") }

struct Harness {
    store: Arc<MemoryStore<ScanPipeline>>,
    cache: ResourceCache<ScanPipeline>,
    deployer: Arc<FakeDeployer>,
    status: Arc<StoreStatus>,
    handler: PipelineSyncHandler,
}

async fn harness(items: Vec<ScanPipeline>) -> Harness {
    let store = Arc::new(MemoryStore::with_items(items));
    let (cache, _task) = CacheBuilder::new("pipelines").start(Arc::clone(&store));
    assert!(cache.wait_synced().await);
    let deployer = Arc::new(FakeDeployer::default());
    let status = Arc::new(StoreStatus { store: Arc::clone(&store), writes: Mutex::new(Vec::new()) });
    let handler = PipelineSyncHandler::new(cache.clone(), deployer.clone(), status.clone(), builtin_defaults());
    Harness { store, cache, deployer, status, handler }
}

async fn eventually(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the cache reflects what was just written to the store.
async fn settle(h: &Harness, cache_has: impl Fn(&ScanPipeline) -> bool) {
    eventually("cache to catch up", || h.cache.get(&key()).map(|p| cache_has(&p)).unwrap_or(false)).await;
}

fn running(status: &StoreStatus) -> bool { status.writes().last().and_then(|s| s.state) == Some(PipelineState::Running) }

#[tokio::test]
async fn empty_desired_state_deploys_and_reports_running() {
    let h = harness(vec![pipeline(None)]).await;
    h.handler.sync(&key()).await.unwrap();
    assert_eq!(h.deployer.ops(), vec![Op::Deploy(9)]);
    let writes = h.status.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].state, Some(PipelineState::Running));
    assert!(writes[0].error_message.is_empty());
    assert_eq!(writes[0].internal_host_list[0], "secmeta-core.prod.svc:3001");
    assert_eq!(h.deployer.namespace("prod").unwrap().get(OWNER_LABEL).map(String::as_str), Some("ops.prod"));
}

#[tokio::test]
async fn unchanged_status_is_not_rewritten() {
    let h = harness(vec![pipeline(Some("Start"))]).await;
    h.handler.sync(&key()).await.unwrap();
    settle(&h, |p| p.status.is_some()).await;
    h.handler.sync(&key()).await.unwrap();
    assert_eq!(h.deployer.ops(), vec![Op::Deploy(9), Op::Deploy(9)]);
    assert_eq!(h.status.writes().len(), 1);
}

#[tokio::test]
async fn deploy_failure_reports_error_and_asks_for_retry() {
    let h = harness(vec![pipeline(None)]).await;
    h.deployer.fail(true);
    let err = h.handler.sync(&key()).await.unwrap_err();
    assert!(format!("{err:#}").contains("quota exceeded"));
    let writes = h.status.writes();
    assert_eq!(writes[0].state, Some(PipelineState::Error));
    assert!(writes[0].error_message.contains("quota exceeded"));

    settle(&h, |p| p.status.as_ref().and_then(|s| s.state) == Some(PipelineState::Error)).await;
    h.deployer.fail(false);
    h.handler.sync(&key()).await.unwrap();
    assert_eq!(h.status.writes().last().unwrap().state, Some(PipelineState::Running));
}

#[tokio::test]
async fn stop_scales_owned_workloads_to_zero() {
    let h = harness(vec![pipeline(Some("Stop"))]).await;
    h.handler.sync(&key()).await.unwrap();
    assert_eq!(h.deployer.ops(), vec![Op::ScaleToZero("ops.prod".into())]);
    assert_eq!(h.status.writes()[0].state, Some(PipelineState::Stopped));
}

#[tokio::test]
async fn config_errors_land_in_status_without_retry() {
    let mut bad = pipeline(Some("Pause"));
    bad.spec.namespace = Some("Upper_Case".into());
    let h = harness(vec![bad]).await;
    h.handler.sync(&key()).await.unwrap();
    let writes = h.status.writes();
    assert_eq!(writes[0].state, Some(PipelineState::Error));
    assert!(writes[0].error_message.contains("Pause"));
    assert!(h.deployer.ops().is_empty());

    h.store.modify(&key(), |p| p.spec.desired_state = None).unwrap();
    settle(&h, |p| p.spec.desired_state.is_none()).await;
    h.handler.sync(&key()).await.unwrap();
    assert!(h.status.writes().last().unwrap().error_message.contains("Upper_Case"));
    assert!(h.deployer.ops().is_empty());
}

#[tokio::test]
async fn deleted_pipeline_is_torn_down_idempotently() {
    let h = harness(vec![]).await;
    h.handler.sync(&key()).await.unwrap();
    h.handler.sync(&key()).await.unwrap();
    assert_eq!(h.deployer.ops(), vec![Op::Teardown("ops.prod".into()), Op::Teardown("ops.prod".into())]);
    assert!(h.status.writes().is_empty());
}

#[tokio::test]
async fn existing_namespace_is_never_claimed_or_torn_down() {
    let h = harness(vec![pipeline(None)]).await;
    h.deployer.add_namespace("prod", &[("team", "payments")]);
    h.handler.sync(&key()).await.unwrap();
    let writes = h.status.writes();
    assert_eq!(writes[0].state, Some(PipelineState::Error));
    assert!(writes[0].error_message.contains("already exists"), "{}", writes[0].error_message);
    assert!(h.deployer.ops().is_empty());
    assert_eq!(h.deployer.namespace("prod").unwrap().get(OWNER_LABEL), None);

    h.store.remove(&key());
    eventually("pipeline to leave the cache", || h.cache.get(&key()).is_none()).await;
    h.handler.sync(&key()).await.unwrap();
    assert_eq!(h.deployer.ops(), vec![Op::Teardown("ops.prod".into())]);
    assert_eq!(h.deployer.namespace("prod").unwrap().get("team").map(String::as_str), Some("payments"));
}

#[tokio::test]
async fn own_namespace_is_refused() {
    let mut p = pipeline(None);
    p.spec.namespace = Some("ops".into());
    let h = harness(vec![p]).await;
    h.handler.sync(&key()).await.unwrap();
    assert!(h.status.writes()[0].error_message.contains("reserved"));
    assert!(h.deployer.ops().is_empty());
}

#[tokio::test]
async fn periodic_resync_restores_deleted_components() {
    let store = Arc::new(MemoryStore::with_items([pipeline(None)]));
    let queue = ChangeQueue::new("scanpipelines");
    let q = queue.clone();
    let (cache, task) = CacheBuilder::new("pipelines").needs_update(spec_changed).on_change(move |_, key| q.add(key.clone())).start(Arc::clone(&store));
    assert!(cache.wait_synced().await);
    let deployer = Arc::new(FakeDeployer::default());
    let status = Arc::new(StoreStatus { store: Arc::clone(&store), writes: Mutex::new(Vec::new()) });
    let handler = Arc::new(PipelineSyncHandler::new(cache.clone(), deployer.clone(), status.clone(), builtin_defaults()));
    let mut workers = WorkerPool::new(queue.clone(), handler, 2).spawn();
    let (stop_tx, stop_rx) = watch::channel(false);
    let resync = tokio::spawn(PeriodicResync::new(cache.clone(), queue.clone(), Duration::from_millis(50)).run(stop_rx));

    eventually("first rollout", || deployer.namespace("prod").is_some() && running(&status)).await;
    let first = deployer.deploys();
    deployer.delete_namespace("prod");
    eventually("namespace to come back", || deployer.namespace("prod").is_some()).await;
    assert!(deployer.deploys() > first);
    assert!(running(&status));

    queue.shut_down();
    stop_tx.send(true).unwrap();
    while workers.join_next().await.is_some() {}
    resync.await.unwrap();
    task.stop().await;
}

#[tokio::test]
async fn resync_tick_queues_every_cached_pipeline() {
    let mut other = pipeline(None);
    other.metadata.name = Some("staging".into());
    let h = harness(vec![pipeline(None), other]).await;
    let queue = ChangeQueue::new("scanpipelines");
    let resync = PeriodicResync::new(h.cache.clone(), queue.clone(), Duration::from_secs(60));
    assert_eq!(resync.tick_once(), 2);
    assert_eq!(queue.len(), 2);
    // keys already waiting are not queued twice
    assert_eq!(resync.tick_once(), 2);
    assert_eq!(queue.len(), 2);
}
