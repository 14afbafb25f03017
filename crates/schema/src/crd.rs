//! ScanPipeline custom resource.
//!
//! Declares which scanning components run for a cluster, how they are sized and
//! whether they should be running at all. Every spec field is optional so that a
//! declared spec can be layered over defaults.

use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use secmeta_core::{CacheObject, ResourceKey};

use crate::SchemaError;

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "secmeta.dev",
    version = "v1",
    kind = "ScanPipeline",
    namespaced,
    status = "ScanPipelineStatus",
    shortname = "scp",
    printcolumn = r#"{"name":"Desired","type":"string","jsonPath":".spec.desiredState"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScanPipelineSpec {
    /// Namespace the components are deployed into. Defaults to the resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// `Start` (or empty) runs the pipeline, `Stop` scales it to zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<String>,

    /// Registry and tag the component images are pulled from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner: Option<ScannerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processors: Option<ProcessorsSpec>,

    /// Credentials for private registries; enables the credential refresher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_auth: Option<Vec<RegistryAuth>>,

    /// Requests for components without their own sizing, e.g. `300m` / `1300Mi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_memory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScannerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_pod_processor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_image_processor: Option<bool>,
    /// Restrict the pod processor to one namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_interval_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_interval_minutes: Option<u32>,
    /// `platform` or `blackduck`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuth {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PipelineState {
    Running,
    Stopped,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Running => "Running",
            PipelineState::Stopped => "Stopped",
            PipelineState::Error => "Error",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Written only by the pipeline controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanPipelineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PipelineState>,
    #[serde(default)]
    pub error_message: String,
    /// In-cluster endpoints of the deployed services, `host:port`.
    #[serde(default)]
    pub internal_host_list: Vec<String>,
}

/// What the controller should converge the pipeline to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Start,
    Stop,
}

impl DesiredState {
    /// Empty or missing means start.
    pub fn parse(raw: Option<&str>) -> Result<Self, SchemaError> {
        match raw.map(str::trim).unwrap_or_default() {
            "" => Ok(DesiredState::Start),
            s if s.eq_ignore_ascii_case("start") => Ok(DesiredState::Start),
            s if s.eq_ignore_ascii_case("stop") => Ok(DesiredState::Stop),
            other => Err(SchemaError::Invalid(format!("desiredState {other:?} (expected Start or Stop)"))),
        }
    }
}

impl ScanPipelineSpec {
    pub fn desired(&self) -> Result<DesiredState, SchemaError> { DesiredState::parse(self.desired_state.as_deref()) }
}

impl CacheObject for ScanPipeline {
    fn key(&self) -> ResourceKey { ResourceKey::namespaced(self.namespace().unwrap_or_else(|| "default".into()), self.name_any()) }
}

/// Only spec and deletion changes are worth reconciling; status writes are the controller's own.
pub fn spec_changed(old: &ScanPipeline, new: &ScanPipeline) -> bool {
    old.spec != new.spec || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
}
