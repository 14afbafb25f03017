use std::sync::Arc;

use kube::{Api, Client};
use secmeta_schema::ScanPipeline;

use crate::{as_is, KubeStore};

/// ScanPipeline resources, cached as themselves.
pub fn pipeline_store(client: Client, namespace: Option<String>) -> KubeStore<ScanPipeline, ScanPipeline> {
    let api_for = Arc::new(move |ns: Option<&str>| match ns {
        Some(ns) => Api::<ScanPipeline>::namespaced(client.clone(), ns),
        None => Api::<ScanPipeline>::all(client.clone()),
    });
    KubeStore::new("scanpipeline", namespace, api_for, as_is)
}
