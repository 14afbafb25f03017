//! secmeta apply: plans the components of a scan pipeline and rolls them out
//! with server-side apply.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;

mod kube_deployer;
pub mod plan;

pub use kube_deployer::KubeDeployer;
pub use plan::{plan_components, Plan};

/// Label carried by every object a pipeline owns; the value is `<namespace>.<name>`.
pub const OWNER_LABEL: &str = "secmeta.dev/owner";

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "secmeta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Namespace,
    ConfigMap,
    Secret,
    Service,
    Deployment,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Namespace => "Namespace",
            ComponentKind::ConfigMap => "ConfigMap",
            ComponentKind::Secret => "Secret",
            ComponentKind::Service => "Service",
            ComponentKind::Deployment => "Deployment",
        }
    }
}

/// One deployable object. `namespace` is `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub kind: ComponentKind,
    pub name: String,
    pub namespace: Option<String>,
    pub manifest: serde_json::Value,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.as_str(), ns, self.name),
            None => write!(f, "{} {}", self.kind.as_str(), self.name),
        }
    }
}

/// The pipeline resource that owns a set of components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub namespace: String,
    pub name: String,
}

impl Owner {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self { Self { namespace: namespace.into(), name: name.into() } }

    pub fn label_value(&self) -> String { format!("{}.{}", self.namespace, self.name) }

    pub fn selector(&self) -> String { format!("{}={}", OWNER_LABEL, self.label_value()) }
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invalid pipeline configuration: {0}")]
    Config(String),
    #[error("cannot encode manifest: {0}")]
    Encode(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{op} {target}: {message}")]
    Api { op: &'static str, target: String, message: String },
}

impl DeployError {
    pub fn is_config(&self) -> bool { matches!(self, DeployError::Config(_)) }

    /// Retrying will not help until the spec or the cluster is changed by someone else.
    pub fn is_permanent(&self) -> bool { matches!(self, DeployError::Config(_) | DeployError::Conflict(_)) }
}

/// Decide whether namespace `component` may be applied over the live namespace's labels.
///
/// A namespace that does not exist yet is ours to create. An existing one is only
/// touched when it already carries the same owner label; otherwise applying would
/// claim it and a later teardown would delete it.
pub fn check_namespace_claim(component: &Component, live_labels: Option<&BTreeMap<String, String>>) -> Result<(), DeployError> {
    let Some(live) = live_labels else { return Ok(()) };
    let wanted = component.manifest.pointer("/metadata/labels").and_then(|l| l.get(OWNER_LABEL)).and_then(|v| v.as_str());
    match (wanted, live.get(OWNER_LABEL)) {
        (Some(w), Some(have)) if w == have => Ok(()),
        (_, Some(have)) => Err(DeployError::Conflict(format!("namespace {} belongs to pipeline {have}", component.name))),
        (_, None) => Err(DeployError::Conflict(format!("namespace {} already exists and was not created by a pipeline", component.name))),
    }
}

/// Rolls out and removes pipeline components.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Create or update every component, in order.
    async fn deploy(&self, components: &[Component]) -> Result<(), DeployError>;

    async fn exists(&self, component: &Component) -> Result<bool, DeployError>;

    /// Scale every deployment owned by `owner` to zero replicas. Returns how many were scaled.
    async fn scale_to_zero(&self, owner: &Owner) -> Result<usize, DeployError>;

    /// Delete everything owned by `owner`. Returns how many objects were deleted;
    /// tearing down an owner with nothing left is not an error.
    async fn teardown(&self, owner: &Owner) -> Result<usize, DeployError>;
}
