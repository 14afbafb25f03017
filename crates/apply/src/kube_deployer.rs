use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::Client;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::{check_namespace_claim, Component, ComponentKind, DeployError, Deployer, Owner, FIELD_MANAGER};

fn api_resource(kind: ComponentKind) -> ApiResource {
    match kind {
        ComponentKind::Namespace => ApiResource::erase::<Namespace>(&()),
        ComponentKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
        ComponentKind::Secret => ApiResource::erase::<Secret>(&()),
        ComponentKind::Service => ApiResource::erase::<Service>(&()),
        ComponentKind::Deployment => ApiResource::erase::<Deployment>(&()),
    }
}

fn is_not_found(e: &kube::Error) -> bool { matches!(e, kube::Error::Api(ae) if ae.code == 404) }

fn api_error(op: &'static str, target: impl ToString, e: kube::Error) -> DeployError {
    DeployError::Api { op, target: target.to_string(), message: e.to_string() }
}

/// Deployer backed by the cluster API.
#[derive(Clone)]
pub struct KubeDeployer {
    client: Client,
}

impl KubeDeployer {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api_for(&self, c: &Component) -> Api<DynamicObject> {
        let ar = api_resource(c.kind);
        match &c.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl Deployer for KubeDeployer {
    async fn deploy(&self, components: &[Component]) -> Result<(), DeployError> {
        let t0 = Instant::now();
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        for c in components {
            if c.kind == ComponentKind::Namespace {
                let live = Api::<Namespace>::all(self.client.clone()).get_opt(&c.name).await.map_err(|e| api_error("get", c, e))?;
                check_namespace_claim(c, live.as_ref().and_then(|ns| ns.metadata.labels.as_ref()))?;
            }
            let api = self.api_for(c);
            match api.patch(&c.name, &pp, &Patch::Apply(&c.manifest)).await {
                Ok(_) => {
                    debug!(component = %c, "applied");
                    counter!("secmeta_deploy_applied_total", 1u64, "kind" => c.kind.as_str());
                }
                Err(e) => {
                    counter!("secmeta_deploy_errors_total", 1u64, "kind" => c.kind.as_str());
                    return Err(api_error("apply", c, e));
                }
            }
        }
        histogram!("secmeta_deploy_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(components = components.len(), took_ms = %t0.elapsed().as_millis(), "pipeline components applied");
        Ok(())
    }

    async fn exists(&self, component: &Component) -> Result<bool, DeployError> {
        let found = self.api_for(component).get_opt(&component.name).await.map_err(|e| api_error("get", component, e))?;
        Ok(found.is_some())
    }

    async fn scale_to_zero(&self, owner: &Owner) -> Result<usize, DeployError> {
        let lp = ListParams::default().labels(&owner.selector());
        let list = Api::<Deployment>::all(self.client.clone()).list(&lp).await.map_err(|e| api_error("list", "deployments", e))?;
        let payload = serde_json::json!({"spec": {"replicas": 0}});
        let pp = PatchParams::default();
        let mut scaled = 0usize;
        for d in list.items {
            let (Some(ns), Some(name)) = (d.metadata.namespace.as_deref(), d.metadata.name.as_deref()) else { continue };
            if d.spec.as_ref().and_then(|s| s.replicas) == Some(0) {
                continue;
            }
            let api = Api::<Deployment>::namespaced(self.client.clone(), ns);
            match api.patch_scale(name, &pp, &Patch::Merge(&payload)).await {
                Ok(_) => {
                    scaled += 1;
                    continue;
                }
                Err(e) if is_not_found(&e) => continue,
                Err(e) => warn!(namespace = ns, name, error = %e, "patch_scale failed; falling back to spec.replicas"),
            }
            match api.patch(name, &pp, &Patch::Merge(&payload)).await {
                Ok(_) => scaled += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(api_error("scale", format!("{ns}/{name}"), e)),
            }
        }
        info!(owner = %owner.label_value(), scaled, "pipeline scaled to zero");
        Ok(scaled)
    }

    async fn teardown(&self, owner: &Owner) -> Result<usize, DeployError> {
        let lp = ListParams::default().labels(&owner.selector());
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces.list(&lp).await.map_err(|e| api_error("list", "namespaces", e))?;
        let mut deleted = 0usize;
        for ns in list.items {
            let Some(name) = ns.metadata.name.as_deref() else { continue };
            if ns.metadata.deletion_timestamp.is_some() {
                continue;
            }
            match namespaces.delete(name, &DeleteParams::background()).await {
                Ok(_) => deleted += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(api_error("delete", format!("Namespace {name}"), e)),
            }
        }
        info!(owner = %owner.label_value(), deleted, "pipeline torn down");
        Ok(deleted)
    }
}
