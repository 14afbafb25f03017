use tracing::debug;

use crate::config::{ConfigValue, Override, Preserve};
use crate::crd::{ProcessorsSpec, ScanPipelineSpec, ScannerSpec};
use crate::SchemaError;

pub const DEFAULT_ANNOTATION_INTERVAL_SECS: u32 = 30;
pub const DEFAULT_DUMP_INTERVAL_MINS: u32 = 30;
pub const DEFAULT_SCANNER_REPLICAS: i32 = 1;
pub const DEFAULT_CPU: &str = "300m";
pub const DEFAULT_MEMORY: &str = "1300Mi";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_IMAGE_REGISTRY: &str = "docker.io/secmeta";
pub const DEFAULT_IMAGE_TAG: &str = "latest";

pub fn builtin_defaults() -> ScanPipelineSpec {
    ScanPipelineSpec {
        namespace: None,
        desired_state: None,
        image_registry: Some(DEFAULT_IMAGE_REGISTRY.into()),
        image_tag: Some(DEFAULT_IMAGE_TAG.into()),
        scanner: Some(ScannerSpec {
            replicas: Some(DEFAULT_SCANNER_REPLICAS),
            cpu: Some(DEFAULT_CPU.into()),
            memory: Some(DEFAULT_MEMORY.into()),
            client_timeout_seconds: Some(600),
        }),
        processors: Some(ProcessorsSpec {
            enable_pod_processor: Some(true),
            enable_image_processor: Some(false),
            namespace_filter: None,
            annotation_interval_seconds: Some(DEFAULT_ANNOTATION_INTERVAL_SECS),
            dump_interval_minutes: Some(DEFAULT_DUMP_INTERVAL_MINS),
            flavor: Some("blackduck".into()),
        }),
        registry_auth: None,
        default_cpu: Some(DEFAULT_CPU.into()),
        default_memory: Some(DEFAULT_MEMORY.into()),
        log_level: Some(DEFAULT_LOG_LEVEL.into()),
    }
}

/// Built-in defaults with a YAML `ScanPipelineSpec` laid over them; the file wins.
pub fn defaults_from_yaml(yaml: &str) -> Result<ScanPipelineSpec, SchemaError> {
    let overlay: ScanPipelineSpec = serde_yaml::from_str(yaml).map_err(|e| SchemaError::Invalid(format!("defaults file: {e}")))?;
    let base = ConfigValue::from_serialize(&builtin_defaults())?;
    let merged = base.merge::<Override>(ConfigValue::from_serialize(&overlay)?);
    debug!("defaults file merged over built-in defaults");
    merged.into_typed()
}

/// A declared spec completed from `defaults`; declared values always win.
pub fn with_defaults(declared: &ScanPipelineSpec, defaults: &ScanPipelineSpec) -> Result<ScanPipelineSpec, SchemaError> {
    let merged = ConfigValue::from_serialize(declared)?.merge::<Preserve>(ConfigValue::from_serialize(defaults)?);
    merged.into_typed()
}
