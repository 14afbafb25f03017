//! Turns a merged `ScanPipelineSpec` into deployable component manifests.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, Namespace, PodSpec, PodTemplateSpec, ResourceRequirements, Secret,
    SecretKeySelector, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use secmeta_schema::ScanPipelineSpec;
use serde::Serialize;

use crate::{Component, ComponentKind, DeployError, Owner, OWNER_LABEL};

pub const CORE: &str = "secmeta-core";
pub const SCANNER: &str = "secmeta-scanner";
pub const IMAGE_GETTER: &str = "secmeta-image-getter";
pub const POD_PROCESSOR: &str = "secmeta-pod-processor";
pub const IMAGE_PROCESSOR: &str = "secmeta-image-processor";
pub const CLOUD_AUTH: &str = "secmeta-cloud-auth";
pub const CONFIG: &str = "secmeta-config";
pub const REGISTRY_AUTH: &str = "secmeta-registry-auth";

const CORE_PORT: i32 = 3001;
const SCANNER_PORT: i32 = 3003;
const IMAGE_GETTER_PORT: i32 = 3004;

const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Everything one pipeline needs in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub namespace: String,
    pub components: Vec<Component>,
    /// `host:port` of every service component.
    pub internal_hosts: Vec<String>,
}

impl Plan {
    pub fn namespace_component(&self) -> Option<&Component> { self.components.iter().find(|c| c.kind == ComponentKind::Namespace) }

    pub fn names(&self, kind: ComponentKind) -> Vec<&str> {
        self.components.iter().filter(|c| c.kind == kind).map(|c| c.name.as_str()).collect()
    }
}

/// Processor settings shipped in the config map.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessorConfig<'a> {
    scan_url: &'a str,
    annotation_interval_secs: u32,
    dump_interval_mins: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace_filter: Option<&'a str>,
    flavor: &'a str,
    log_level: &'a str,
}

fn valid_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, DeployError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| DeployError::Config(format!("{field} is not set")))
}

fn quantity(raw: &str, field: &str) -> Result<Quantity, DeployError> {
    let ok = raw.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    if ok.is_empty() || ok.parse::<f64>().is_err() {
        return Err(DeployError::Config(format!("{field} {raw:?} is not a quantity")));
    }
    Ok(Quantity(raw.to_string()))
}

fn encode<T: Serialize>(kind: ComponentKind, name: &str, namespace: Option<&str>, obj: &T) -> Result<Component, DeployError> {
    let manifest = serde_json::to_value(obj).map_err(|e| DeployError::Encode(format!("{} {name}: {e}", kind.as_str())))?;
    Ok(Component { kind, name: name.to_string(), namespace: namespace.map(str::to_string), manifest })
}

struct Builder<'a> {
    namespace: &'a str,
    owner_labels: BTreeMap<String, String>,
    registry: &'a str,
    tag: &'a str,
    cpu: Quantity,
    memory: Quantity,
}

impl<'a> Builder<'a> {
    fn meta(&self, name: &str, component: &str) -> ObjectMeta {
        let mut labels = self.owner_labels.clone();
        labels.insert(COMPONENT_LABEL.into(), component.into());
        ObjectMeta { name: Some(name.into()), namespace: Some(self.namespace.into()), labels: Some(labels), ..Default::default() }
    }

    fn selector(name: &str) -> BTreeMap<String, String> { BTreeMap::from([(COMPONENT_LABEL.to_string(), name.to_string())]) }

    fn image(&self, component: &str) -> String { format!("{}/{}:{}", self.registry, component, self.tag) }

    fn service(&self, name: &str, port: i32) -> Service {
        Service {
            metadata: self.meta(name, name),
            spec: Some(ServiceSpec {
                selector: Some(Self::selector(name)),
                ports: Some(vec![ServicePort { name: Some("http".into()), port, target_port: Some(IntOrString::Int(port)), ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deployment(
        &self,
        name: &str,
        image: String,
        args: Vec<String>,
        env: Vec<EnvVar>,
        replicas: i32,
        port: Option<i32>,
        requests: (Quantity, Quantity),
        volume: Option<(Volume, VolumeMount)>,
    ) -> Deployment {
        let (volumes, mounts) = match volume {
            Some((v, m)) => (Some(vec![v]), Some(vec![m])),
            None => (None, None),
        };
        let container = Container {
            name: name.into(),
            image: Some(image),
            args: (!args.is_empty()).then_some(args),
            env: (!env.is_empty()).then_some(env),
            ports: port.map(|p| vec![ContainerPort { container_port: p, ..Default::default() }]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([("cpu".to_string(), requests.0), ("memory".to_string(), requests.1)])),
                ..Default::default()
            }),
            volume_mounts: mounts,
            ..Default::default()
        };
        let mut pod_labels = self.owner_labels.clone();
        pod_labels.extend(Self::selector(name));
        Deployment {
            metadata: self.meta(name, name),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector { match_labels: Some(Self::selector(name)), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(pod_labels), ..Default::default() }),
                    spec: Some(PodSpec { containers: vec![container], volumes, ..Default::default() }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn defaults(&self) -> (Quantity, Quantity) { (self.cpu.clone(), self.memory.clone()) }
}

fn env(name: &str, value: impl ToString) -> EnvVar { EnvVar { name: name.into(), value: Some(value.to_string()), ..Default::default() } }

fn config_volume() -> (Volume, VolumeMount) {
    (
        Volume { name: "config".into(), config_map: Some(ConfigMapVolumeSource { name: Some(CONFIG.into()), ..Default::default() }), ..Default::default() },
        VolumeMount { name: "config".into(), mount_path: "/etc/secmeta".into(), read_only: Some(true), ..Default::default() },
    )
}

/// Namespaces a pipeline never deploys into. The pipeline's own namespace is refused too,
/// since teardown deletes the target namespace.
const RESERVED_NAMESPACES: &[&str] = &["default", "kube-system", "kube-public", "kube-node-lease"];

/// Plan the components for `owner` from a spec already merged over defaults.
///
/// Missing or malformed settings are configuration errors; retrying will not fix them.
pub fn plan_components(owner: &Owner, spec: &ScanPipelineSpec) -> Result<Plan, DeployError> {
    let namespace = spec.namespace.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| owner.name.clone());
    if !valid_dns_label(&namespace) {
        return Err(DeployError::Config(format!("target namespace {namespace:?} is not a valid DNS label")));
    }
    if RESERVED_NAMESPACES.contains(&namespace.as_str()) || namespace == owner.namespace {
        return Err(DeployError::Config(format!("target namespace {namespace:?} is reserved; pick a dedicated namespace")));
    }
    let scanner = spec.scanner.clone().unwrap_or_default();
    let processors = spec.processors.clone().unwrap_or_default();
    let b = Builder {
        namespace: &namespace,
        owner_labels: BTreeMap::from([(OWNER_LABEL.to_string(), owner.label_value())]),
        registry: required(spec.image_registry.as_deref(), "imageRegistry")?,
        tag: required(spec.image_tag.as_deref(), "imageTag")?,
        cpu: quantity(required(spec.default_cpu.as_deref(), "defaultCpu")?, "defaultCpu")?,
        memory: quantity(required(spec.default_memory.as_deref(), "defaultMemory")?, "defaultMemory")?,
    };
    let replicas = scanner.replicas.unwrap_or(1);
    if replicas < 0 {
        return Err(DeployError::Config(format!("scanner.replicas {replicas} is negative")));
    }
    let scanner_requests = (
        quantity(scanner.cpu.as_deref().unwrap_or(b.cpu.0.as_str()), "scanner.cpu")?,
        quantity(scanner.memory.as_deref().unwrap_or(b.memory.0.as_str()), "scanner.memory")?,
    );
    let log_level = spec.log_level.as_deref().unwrap_or("info");
    let scan_url = format!("http://{CORE}.{namespace}.svc:{CORE_PORT}");
    let flavor = processors.flavor.as_deref().unwrap_or("blackduck");
    let annotation_interval = processors.annotation_interval_seconds.unwrap_or(30);
    let dump_interval = processors.dump_interval_minutes.unwrap_or(30);
    if annotation_interval == 0 {
        return Err(DeployError::Config("processors.annotationIntervalSeconds must be positive".into()));
    }

    let ns = Some(namespace.as_str());
    let mut components = Vec::new();
    let namespace_obj = Namespace {
        metadata: ObjectMeta { name: Some(namespace.clone()), labels: Some(b.owner_labels.clone()), ..Default::default() },
        ..Default::default()
    };
    components.push(encode(ComponentKind::Namespace, &namespace, None, &namespace_obj)?);

    let config = ProcessorConfig {
        scan_url: &scan_url,
        annotation_interval_secs: annotation_interval,
        dump_interval_mins: dump_interval,
        namespace_filter: processors.namespace_filter.as_deref(),
        flavor,
        log_level,
    };
    let config_json = serde_json::to_string_pretty(&config).map_err(|e| DeployError::Encode(format!("processor config: {e}")))?;
    let cm = ConfigMap { metadata: b.meta(CONFIG, "config"), data: Some(BTreeMap::from([("config.json".to_string(), config_json)])), ..Default::default() };
    components.push(encode(ComponentKind::ConfigMap, CONFIG, ns, &cm)?);

    let mut internal_hosts = Vec::new();
    for (name, port) in [(CORE, CORE_PORT), (SCANNER, SCANNER_PORT), (IMAGE_GETTER, IMAGE_GETTER_PORT)] {
        components.push(encode(ComponentKind::Service, name, ns, &b.service(name, port))?);
        internal_hosts.push(format!("{name}.{namespace}.svc:{port}"));
    }

    let log_env = || env("SECMETA_LOG_LEVEL", log_level);
    let core = b.deployment(CORE, b.image(CORE), vec![], vec![log_env()], 1, Some(CORE_PORT), b.defaults(), Some(config_volume()));
    components.push(encode(ComponentKind::Deployment, CORE, ns, &core)?);
    let scan = b.deployment(
        SCANNER,
        b.image(SCANNER),
        vec![],
        vec![log_env(), env("SECMETA_CLIENT_TIMEOUT_SECS", scanner.client_timeout_seconds.unwrap_or(600))],
        replicas,
        Some(SCANNER_PORT),
        scanner_requests.clone(),
        None,
    );
    components.push(encode(ComponentKind::Deployment, SCANNER, ns, &scan)?);
    let getter = b.deployment(IMAGE_GETTER, b.image(IMAGE_GETTER), vec![], vec![log_env()], replicas, Some(IMAGE_GETTER_PORT), scanner_requests, None);
    components.push(encode(ComponentKind::Deployment, IMAGE_GETTER, ns, &getter)?);

    let processor_env = |filter: Option<&str>| {
        let mut out = vec![
            log_env(),
            env("SECMETA_SCAN_URL", &scan_url),
            env("SECMETA_ANNOTATION_INTERVAL_SECS", annotation_interval),
            env("SECMETA_DUMP_INTERVAL_MINS", dump_interval),
            env("SECMETA_FLAVOR", flavor),
        ];
        if let Some(f) = filter {
            out.push(env("SECMETA_NAMESPACE", f));
        }
        out
    };
    if processors.enable_pod_processor.unwrap_or(true) {
        let d = b.deployment(
            POD_PROCESSOR,
            b.image("secmetad"),
            vec!["pod-processor".into()],
            processor_env(processors.namespace_filter.as_deref()),
            1,
            None,
            b.defaults(),
            None,
        );
        components.push(encode(ComponentKind::Deployment, POD_PROCESSOR, ns, &d)?);
    }
    if processors.enable_image_processor.unwrap_or(false) {
        let d = b.deployment(IMAGE_PROCESSOR, b.image("secmetad"), vec!["image-processor".into()], processor_env(None), 1, None, b.defaults(), None);
        components.push(encode(ComponentKind::Deployment, IMAGE_PROCESSOR, ns, &d)?);
    }

    let registries = spec.registry_auth.clone().unwrap_or_default();
    if !registries.is_empty() {
        if let Some(bad) = registries.iter().find(|r| r.url.is_empty()) {
            return Err(DeployError::Config(format!("registry credentials for user {:?} have no url", bad.user)));
        }
        let payload = serde_json::to_string(&registries).map_err(|e| DeployError::Encode(format!("registry auth: {e}")))?;
        let secret = Secret {
            metadata: b.meta(REGISTRY_AUTH, CLOUD_AUTH),
            string_data: Some(BTreeMap::from([("registries.json".to_string(), payload)])),
            ..Default::default()
        };
        components.push(encode(ComponentKind::Secret, REGISTRY_AUTH, ns, &secret)?);
        let from_secret = EnvVar {
            name: "SECMETA_REGISTRY_AUTH".into(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector { name: Some(REGISTRY_AUTH.into()), key: "registries.json".into(), ..Default::default() }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let secret_volume = (
            Volume { name: "registry-auth".into(), secret: Some(SecretVolumeSource { secret_name: Some(REGISTRY_AUTH.into()), ..Default::default() }), ..Default::default() },
            VolumeMount { name: "registry-auth".into(), mount_path: "/etc/secmeta/registries".into(), read_only: Some(true), ..Default::default() },
        );
        let d = b.deployment(CLOUD_AUTH, b.image(CLOUD_AUTH), vec![], vec![log_env(), from_secret], 1, None, b.defaults(), Some(secret_volume));
        components.push(encode(ComponentKind::Deployment, CLOUD_AUTH, ns, &d)?);
    }

    Ok(Plan { namespace, components, internal_hosts })
}
