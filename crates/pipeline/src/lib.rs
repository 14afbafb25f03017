//! secmeta pipeline: drives each ScanPipeline resource towards its desired state.
//!
//! `Start` (or nothing) deploys the planned components and reports `Running`,
//! `Stop` scales owned deployments to zero and reports `Stopped`, and a deleted
//! resource has everything it owned torn down. Failures land in the status.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use secmeta_apply::{plan_components, Deployer, Owner};
use secmeta_core::ResourceKey;
use secmeta_queue::SyncHandler;
use secmeta_schema::{with_defaults, DesiredState, PipelineState, ScanPipeline, ScanPipelineSpec, ScanPipelineStatus};
use secmeta_store::ResourceCache;
use tracing::{debug, info, warn};

mod resync;
mod status;

pub use resync::PeriodicResync;
pub use status::{KubeStatusWriter, StatusWriter};

pub struct PipelineSyncHandler {
    cache: ResourceCache<ScanPipeline>,
    deployer: Arc<dyn Deployer>,
    status: Arc<dyn StatusWriter>,
    defaults: Arc<ScanPipelineSpec>,
}

impl PipelineSyncHandler {
    pub fn new(cache: ResourceCache<ScanPipeline>, deployer: Arc<dyn Deployer>, status: Arc<dyn StatusWriter>, defaults: ScanPipelineSpec) -> Self {
        Self { cache, deployer, status, defaults: Arc::new(defaults) }
    }

    fn owner(key: &ResourceKey) -> Owner { Owner::new(key.namespace().unwrap_or("default"), key.name.clone()) }

    /// Write `next` unless the resource already reports it.
    async fn report(&self, key: &ResourceKey, current: Option<&ScanPipelineStatus>, next: ScanPipelineStatus) -> Result<()> {
        if current == Some(&next) {
            debug!(key = %key, state = ?next.state, "status unchanged");
            return Ok(());
        }
        let state = next.state.map(|s| s.as_str()).unwrap_or("Unknown");
        self.status.write_status(key, &next).await.with_context(|| format!("writing status of {key}"))?;
        counter!("secmeta_pipeline_state_total", 1u64, "state" => state);
        info!(key = %key, state, message = %next.error_message, "pipeline status updated");
        Ok(())
    }

    fn failed(message: impl Into<String>) -> ScanPipelineStatus {
        ScanPipelineStatus { state: Some(PipelineState::Error), error_message: message.into(), internal_host_list: Vec::new() }
    }

    async fn start(&self, key: &ResourceKey, owner: &Owner, spec: &ScanPipelineSpec, current: Option<&ScanPipelineStatus>) -> Result<()> {
        let plan = match plan_components(owner, spec) {
            Ok(p) => p,
            Err(e) if e.is_config() => {
                warn!(key = %key, error = %e, "pipeline configuration rejected");
                return self.report(key, current, Self::failed(e.to_string())).await;
            }
            Err(e) => {
                self.report(key, current, Self::failed(e.to_string())).await?;
                return Err(anyhow!(e).context(format!("planning {key}")));
            }
        };
        if let Some(ns) = plan.namespace_component() {
            match self.deployer.exists(ns).await {
                Ok(false) => info!(key = %key, namespace = %plan.namespace, "creating pipeline"),
                Ok(true) => debug!(key = %key, namespace = %plan.namespace, "updating pipeline"),
                Err(e) => debug!(key = %key, error = %e, "existence check failed; applying anyway"),
            }
        }
        match self.deployer.deploy(&plan.components).await {
            Ok(()) => {}
            Err(e) if e.is_permanent() => {
                warn!(key = %key, error = %e, "pipeline cannot be deployed");
                return self.report(key, current, Self::failed(e.to_string())).await;
            }
            Err(e) => {
                self.report(key, current, Self::failed(e.to_string())).await?;
                return Err(anyhow!(e).context(format!("deploying {key}")));
            }
        }
        let running = ScanPipelineStatus { state: Some(PipelineState::Running), error_message: String::new(), internal_host_list: plan.internal_hosts };
        self.report(key, current, running).await
    }

    async fn stop(&self, key: &ResourceKey, owner: &Owner, current: Option<&ScanPipelineStatus>) -> Result<()> {
        if let Err(e) = self.deployer.scale_to_zero(owner).await {
            self.report(key, current, Self::failed(e.to_string())).await?;
            return Err(anyhow!(e).context(format!("stopping {key}")));
        }
        let stopped = ScanPipelineStatus { state: Some(PipelineState::Stopped), ..Default::default() };
        self.report(key, current, stopped).await
    }
}

#[async_trait::async_trait]
impl SyncHandler<ResourceKey> for PipelineSyncHandler {
    async fn sync(&self, key: &ResourceKey) -> Result<()> {
        let t0 = Instant::now();
        let owner = Self::owner(key);
        let Some(obj) = self.cache.get(key) else {
            let deleted = self.deployer.teardown(&owner).await.with_context(|| format!("tearing down {key}"))?;
            info!(key = %key, deleted, "pipeline removed");
            return Ok(());
        };
        let current = obj.status.as_ref();
        let spec = match with_defaults(&obj.spec, &self.defaults) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %key, error = %e, "pipeline spec does not merge with defaults");
                return self.report(key, current, Self::failed(e.to_string())).await;
            }
        };
        let result = match spec.desired() {
            Ok(DesiredState::Start) => self.start(key, &owner, &spec, current).await,
            Ok(DesiredState::Stop) => self.stop(key, &owner, current).await,
            Err(e) => {
                warn!(key = %key, error = %e, "unknown desired state");
                self.report(key, current, Self::failed(e.to_string())).await
            }
        };
        histogram!("secmeta_pipeline_sync_ms", t0.elapsed().as_secs_f64() * 1000.0);
        result
    }
}
