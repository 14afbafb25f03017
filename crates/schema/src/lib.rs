//! secmeta schema: the ScanPipeline custom resource, its defaults and the typed
//! config tree used to layer a declared spec over them.

#![forbid(unsafe_code)]

pub mod config;
pub mod crd;
pub mod defaults;

pub use config::{ConfigValue, Override, Preserve, Resolve, Scalar};
pub use crd::{spec_changed, DesiredState, PipelineState, ProcessorsSpec, RegistryAuth, ScanPipeline, ScanPipelineSpec, ScanPipelineStatus, ScannerSpec};
pub use defaults::{builtin_defaults, defaults_from_yaml, with_defaults};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid pipeline configuration: {0}")]
    Invalid(String),
    #[error("cannot encode configuration: {0}")]
    Encode(String),
}
