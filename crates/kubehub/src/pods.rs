use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use secmeta_core::{parse_image_id, ContainerImageRef, ResourceKey, ResourceKind, WatchedResource};
use secmeta_store::{Result, StoreError};
use tracing::debug;

use crate::KubeStore;

/// Pods, optionally restricted to one namespace.
pub fn pod_store(client: Client, namespace: Option<String>) -> KubeStore<Pod, WatchedResource> {
    let api_for = Arc::new(move |ns: Option<&str>| match ns {
        Some(ns) => Api::<Pod>::namespaced(client.clone(), ns),
        None => Api::<Pod>::all(client.clone()),
    });
    KubeStore::new("pod", namespace, api_for, watched_from_pod)
}

/// Cached view of a pod. Containers are taken from the status in reported order;
/// a container whose image id does not resolve to a digest keeps its slot with no image.
pub fn watched_from_pod(pod: Pod) -> Result<WatchedResource> {
    let meta = pod.metadata;
    let name = meta.name.ok_or_else(|| StoreError::Decode("pod without metadata.name".into()))?;
    let namespace = meta.namespace.unwrap_or_else(|| "default".to_string());
    let mut out = WatchedResource::new(ResourceKind::Pod, ResourceKey::namespaced(namespace, name));
    out.uid = meta.uid;
    out.resource_version = meta.resource_version;
    out.labels = meta.labels.unwrap_or_default();
    out.annotations = meta.annotations.unwrap_or_default();
    let statuses = pod.status.and_then(|s| s.container_statuses).unwrap_or_default();
    for cs in statuses {
        let image = if cs.image_id.is_empty() {
            None
        } else {
            match parse_image_id(&cs.image_id) {
                Ok(r) => Some(r),
                Err(e) => {
                    debug!(pod = %out.key, container = %cs.name, error = %e, "container image id not usable");
                    None
                }
            }
        };
        out.containers.push(ContainerImageRef::new(cs.name, image));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use secmeta_core::ImageRef;

    fn status(name: &str, image_id: &str) -> ContainerStatus {
        ContainerStatus { name: name.into(), image_id: image_id.into(), image: "ignored".into(), ..Default::default() }
    }

    #[test]
    fn keeps_container_order_and_unresolved_slots() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("pod1".into()),
                namespace: Some("ns1".into()),
                resource_version: Some("42".into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(vec![
                    status("sidecar", "docker://sha256:abc"),
                    status("app", "docker-pullable://img1@sha256:AAA"),
                    status("pending", ""),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let w = watched_from_pod(pod).unwrap();
        assert_eq!(w.key, ResourceKey::namespaced("ns1", "pod1"));
        assert_eq!(w.resource_version.as_deref(), Some("42"));
        assert_eq!(w.containers.len(), 3);
        assert_eq!(w.containers[0].image, None);
        assert_eq!(w.containers[1].image, Some(ImageRef::new("img1", "AAA")));
        assert_eq!(w.containers[2].container, "pending");
        assert_eq!(w.digests(), vec!["AAA".to_string()]);
    }

    #[test]
    fn nameless_pod_is_rejected() {
        assert!(watched_from_pod(Pod::default()).is_err());
    }
}
