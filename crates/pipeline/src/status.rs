use anyhow::Result;
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use secmeta_core::ResourceKey;
use secmeta_schema::{ScanPipeline, ScanPipelineStatus};
use tracing::debug;

/// Persists the observed state of a pipeline.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write_status(&self, key: &ResourceKey, status: &ScanPipelineStatus) -> Result<()>;
}

/// Writes through the status subresource.
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_status(&self, key: &ResourceKey, status: &ScanPipelineStatus) -> Result<()> {
        let api: Api<ScanPipeline> = Api::namespaced(self.client.clone(), key.namespace().unwrap_or("default"));
        let body = serde_json::json!({ "status": status });
        match api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&body)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(key = %key, "pipeline gone before its status was written");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
